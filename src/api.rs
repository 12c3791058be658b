/// REST client for the user principals lookup.
///
/// The streamer needs the socket host, the login token and the account ids
/// from `GET /userprincipals`. Access tokens come from a [`TokenProvider`].
use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use log::debug;
use reqwest::Client;

use crate::config::ApiConfig;
use crate::errors::TdError;
use crate::models::UserPrincipals;

const PRINCIPAL_FIELDS: &str = "streamerSubscriptionKeys,streamerConnectionInfo";

/// Source of OAuth access tokens.
///
/// Refresh mechanics live outside the SDK; implementations return a token
/// that is valid at the time of the call.
pub trait TokenProvider: Send + Sync {
    fn access_token(&self) -> Result<String, TdError>;
}

/// A fixed access token.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl TokenProvider for StaticToken {
    fn access_token(&self) -> Result<String, TdError> {
        if self.0.is_empty() {
            return Err(TdError::Other("access token is empty".into()));
        }
        Ok(self.0.clone())
    }
}

impl fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StaticToken(<redacted>)")
    }
}

/// Low-level REST API client.
#[derive(Clone)]
pub struct TdApi {
    client: Client,
    config: ApiConfig,
    tokens: Arc<dyn TokenProvider>,
}

impl fmt::Debug for TdApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TdApi")
            .field("api_base", &self.config.api_base)
            .finish_non_exhaustive()
    }
}

impl TdApi {
    pub fn new(config: ApiConfig, tokens: impl TokenProvider + 'static) -> Self {
        Self {
            client: Client::new(),
            config,
            tokens: Arc::new(tokens),
        }
    }

    /// Shortcut for the default endpoint with a fixed token.
    pub fn with_token(token: impl Into<String>) -> Self {
        Self::new(ApiConfig::default(), StaticToken::new(token))
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    /// Parse an API response, mapping non-2xx statuses to [`TdError::ApiError`].
    async fn parse_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, TdError> {
        let status = response.status();
        let text = response.text().await?;
        let target_type = type_name::<T>();
        debug!(
            "api.parse_response status={} target_type={} body_len={}",
            status,
            target_type,
            text.len()
        );

        if !status.is_success() {
            debug!(
                "api.parse_response non_success status={} body={}",
                status, text
            );
            let message = serde_json::from_str::<serde_json::Value>(&text)
                .ok()
                .and_then(|err| {
                    err.get("error")
                        .or_else(|| err.get("message"))
                        .and_then(|m| m.as_str())
                        .map(str::to_string)
                })
                .unwrap_or(text);
            return Err(TdError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        match serde_json::from_str(&text) {
            Ok(parsed) => {
                debug!("api.parse_response decode_ok target_type={}", target_type);
                Ok(parsed)
            }
            Err(e) => {
                debug!(
                    "api.parse_response decode_failed target_type={} error={}",
                    target_type, e
                );
                let end = (0..=text.len().min(500))
                    .rev()
                    .find(|&i| text.is_char_boundary(i))
                    .unwrap_or(0);
                Err(TdError::JsonError(format!(
                    "Failed to parse response: {e}\nBody: {}",
                    &text[..end]
                )))
            }
        }
    }

    // -----------------------------------------------------------------------
    // User principals
    // -----------------------------------------------------------------------

    /// GET /userprincipals - streamer connection info and subscription keys.
    pub async fn get_user_principals(&self) -> Result<UserPrincipals, TdError> {
        debug!("api.get_user_principals");
        let token = self.tokens.access_token()?;
        let url = format!("{}/userprincipals", self.config.api_base);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(token)
            .query(&[("fields", PRINCIPAL_FIELDS)])
            .send()
            .await?;
        self.parse_response(resp).await
    }
}
