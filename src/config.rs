//! Endpoint and streaming configuration.
use std::time::Duration;

use crate::backoff::BackoffConfig;

/// Default REST base URL.
pub const DEFAULT_API_BASE: &str = "https://api.tdameritrade.com/v1";

/// Largest inbound frame the streamer accepts, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 2_048_000;

/// Configuration holding the REST endpoint.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub api_base: String,
}

impl ApiConfig {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self::new(DEFAULT_API_BASE)
    }
}

/// Configuration for the streaming client.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Use this socket URL instead of the one from the user principals.
    pub url_override: Option<String>,
    /// Cadence at which queued requests are flushed as one batch (default: 100ms).
    pub flush_interval: Duration,
    /// How long to wait for the ADMIN/LOGIN acknowledgement (default: 30s).
    pub login_timeout: Duration,
    /// Maximum inbound message and frame size in bytes (default: 2,048,000).
    pub max_message_size: usize,
    /// Restart backoff policy.
    pub backoff: BackoffConfig,
    /// Log every sent batch (redacted) at debug level (default: true).
    pub log_sent_messages: bool,
    /// Log every received frame at debug level (default: false).
    pub log_received_messages: bool,
    /// Replay the last subscription request per service after a restart (default: false).
    pub resubscribe_on_restart: bool,
}

impl StreamConfig {
    /// Convenience for pointing the client at a specific socket URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url_override = Some(url.into());
        self
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url_override: None,
            flush_interval: Duration::from_millis(100),
            login_timeout: Duration::from_secs(30),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            backoff: BackoffConfig::default(),
            log_sent_messages: true,
            log_received_messages: false,
            resubscribe_on_restart: false,
        }
    }
}
