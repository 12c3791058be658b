//! Data models for the user principals lookup and the streaming wire format.
//!
//! All models use serde for JSON serialization/deserialization.
use std::fmt;

use chrono::DateTime;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::enums::{Command, FrameKind, Service};
use crate::errors::TdError;

/// Deserialize an optional value that may be a JSON number or a string, storing as String.
fn deserialize_optional_string_or_number<'de, D>(
    deserializer: D,
) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<Value> = Option::deserialize(deserializer)?;
    match value {
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Null) | None => Ok(None),
        Some(v) => Ok(Some(v.to_string())),
    }
}

/// Deserialize a value that may be a JSON number or a string containing a number.
fn deserialize_string_or_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    struct StringOrU64;
    impl<'de> de::Visitor<'de> for StringOrU64 {
        type Value = u64;
        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a u64 or a string containing a u64")
        }
        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
            Ok(v)
        }
        fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
            v.parse().map_err(de::Error::custom)
        }
    }
    deserializer.deserialize_any(StringOrU64)
}

// ---------------------------------------------------------------------------
// User principals
// ---------------------------------------------------------------------------

/// Streamer connection details from the user principals response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamerInfo {
    pub streamer_socket_url: String,
    pub token: String,
    pub token_timestamp: String,
    pub user_group: String,
    pub access_level: String,
    pub acl: String,
    pub app_id: String,
    #[serde(default)]
    pub streamer_binary_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrincipalAccount {
    pub account_id: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub segment: String,
    #[serde(default)]
    pub account_cd_domain_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionKeys {
    #[serde(default)]
    pub keys: Vec<SubscriptionKey>,
}

/// The subset of the user principals response the streaming client needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPrincipals {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub streamer_info: Option<StreamerInfo>,
    #[serde(default)]
    pub accounts: Vec<PrincipalAccount>,
    #[serde(default)]
    pub streamer_subscription_keys: Option<SubscriptionKeys>,
}

impl UserPrincipals {
    pub fn streamer(&self) -> Result<&StreamerInfo, TdError> {
        self.streamer_info
            .as_ref()
            .ok_or_else(|| TdError::MissingPrincipals("streamerInfo".into()))
    }

    /// The first account, used as the streaming identity.
    pub fn primary_account(&self) -> Result<&PrincipalAccount, TdError> {
        self.accounts
            .first()
            .ok_or_else(|| TdError::MissingPrincipals("accounts".into()))
    }

    /// First streamer subscription key, used by account activity.
    pub fn subscription_key(&self) -> Result<&str, TdError> {
        self.streamer_subscription_keys
            .as_ref()
            .and_then(|keys| keys.keys.first())
            .map(|k| k.key.as_str())
            .ok_or_else(|| TdError::MissingPrincipals("streamerSubscriptionKeys".into()))
    }

    /// WebSocket URL of the streamer: `wss://<streamerSocketUrl>/ws`.
    pub fn socket_url(&self) -> Result<String, TdError> {
        Ok(format!("wss://{}/ws", self.streamer()?.streamer_socket_url))
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Login credentials, built once from the user principals.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub userid: String,
    pub token: String,
    pub company: String,
    pub segment: String,
    pub cddomain: String,
    pub usergroup: String,
    pub accesslevel: String,
    pub authorized: String,
    /// Token timestamp in epoch milliseconds.
    pub timestamp: i64,
    pub appid: String,
    pub acl: String,
}

impl Credentials {
    pub fn from_principals(principals: &UserPrincipals) -> Result<Self, TdError> {
        let streamer = principals.streamer()?;
        let account = principals.primary_account()?;
        let parsed = DateTime::parse_from_str(&streamer.token_timestamp, "%Y-%m-%dT%H:%M:%S%z")
            .map_err(|e| {
                TdError::MissingPrincipals(format!(
                    "tokenTimestamp {:?}: {e}",
                    streamer.token_timestamp
                ))
            })?;

        Ok(Self {
            userid: account.account_id.clone(),
            token: streamer.token.clone(),
            company: account.company.clone(),
            segment: account.segment.clone(),
            cddomain: account.account_cd_domain_id.clone(),
            usergroup: streamer.user_group.clone(),
            accesslevel: streamer.access_level.clone(),
            authorized: "Y".into(),
            timestamp: parsed.timestamp() * 1000,
            appid: streamer.app_id.clone(),
            acl: streamer.acl.clone(),
        })
    }

    /// URL-encoded `key=value&...` form sent as the login `credential` parameter.
    pub fn to_query(&self) -> String {
        let timestamp = self.timestamp.to_string();
        url::form_urlencoded::Serializer::new(String::new())
            .append_pair("userid", &self.userid)
            .append_pair("token", &self.token)
            .append_pair("company", &self.company)
            .append_pair("segment", &self.segment)
            .append_pair("cddomain", &self.cddomain)
            .append_pair("usergroup", &self.usergroup)
            .append_pair("accesslevel", &self.accesslevel)
            .append_pair("authorized", &self.authorized)
            .append_pair("timestamp", &timestamp)
            .append_pair("appid", &self.appid)
            .append_pair("acl", &self.acl)
            .finish()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("userid", &self.userid)
            .field("token", &"<redacted>")
            .field("company", &self.company)
            .field("segment", &self.segment)
            .field("cddomain", &self.cddomain)
            .field("usergroup", &self.usergroup)
            .field("accesslevel", &self.accesslevel)
            .field("authorized", &self.authorized)
            .field("timestamp", &self.timestamp)
            .field("appid", &self.appid)
            .field("acl", &self.acl)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// A single request against a streaming service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub service: Service,
    /// Assigned when the request enters the queue.
    #[serde(rename = "requestid", deserialize_with = "deserialize_string_or_u64")]
    pub request_id: u64,
    pub command: Command,
    pub account: String,
    pub source: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl ServiceRequest {
    pub fn new(
        service: impl Into<Service>,
        command: Command,
        account: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            request_id: 0,
            command,
            account: account.into(),
            source: source.into(),
            parameters: Map::new(),
        }
    }

    /// Set a parameter, replacing any previous value.
    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }
}

/// The wire-level unit: every request flushed in one tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestBatch {
    pub requests: Vec<ServiceRequest>,
}

impl RequestBatch {
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }
}

// ---------------------------------------------------------------------------
// Inbound frames
// ---------------------------------------------------------------------------

/// One per-service message inside an inbound frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceMessage {
    #[serde(default)]
    pub service: Option<Service>,
    #[serde(default)]
    pub command: Option<Command>,
    #[serde(
        default,
        rename = "requestid",
        deserialize_with = "deserialize_optional_string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    /// Any other keys, e.g. `heartbeat`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ServiceMessage {
    /// The `content.code` of an acknowledgement.
    pub fn code(&self) -> Option<i64> {
        self.content.as_ref()?.get("code")?.as_i64()
    }

    /// The `content.msg` of an acknowledgement.
    pub fn msg(&self) -> Option<&str> {
        self.content.as_ref()?.get("msg")?.as_str()
    }

    /// Content entries as a slice; a non-array content yields nothing.
    pub fn content_items(&self) -> &[Value] {
        match &self.content {
            Some(Value::Array(items)) => items,
            _ => &[],
        }
    }

    pub fn is(&self, service: &Service, command: Command) -> bool {
        self.service.as_ref() == Some(service) && self.command == Some(command)
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response: Vec<ServiceMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<ServiceMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notify: Vec<ServiceMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snapshot: Vec<ServiceMessage>,
}

impl Frame {
    pub fn messages(&self, kind: FrameKind) -> &[ServiceMessage] {
        match kind {
            FrameKind::Response => &self.response,
            FrameKind::Data => &self.data,
            FrameKind::Notify => &self.notify,
            FrameKind::Snapshot => &self.snapshot,
        }
    }

    pub fn is_empty(&self) -> bool {
        FrameKind::ALL.iter().all(|kind| self.messages(*kind).is_empty())
    }

    /// The ADMIN/LOGIN acknowledgement carried by this frame, if any.
    pub fn login_ack(&self) -> Option<&ServiceMessage> {
        self.response
            .iter()
            .find(|msg| msg.is(&Service::Admin, Command::Login))
    }
}
