//! Error types for the TD SDK.
//!
//! One enum covers the REST principals lookup, the wire codec and the
//! streaming connection, so callers match on a single type.
use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// The primary error type for the TD SDK.
#[derive(Error, Debug)]
pub enum TdError {
    // REST
    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("API error (HTTP {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("Missing user principal data: {0}")]
    MissingPrincipals(String),

    // Codec
    #[error("JSON error: {0}")]
    JsonError(String),

    #[error("Failed to decode stream frame: {0}")]
    DecodeError(String),

    // Transport
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    // Streaming protocol
    #[error("Login rejected (code {code}): {message}")]
    LoginRejected { code: i64, message: String },

    #[error("Timed out waiting for login acknowledgement")]
    LoginTimeout,

    #[error("Unable to restart stream after {attempts} attempts ({elapsed:?} of backoff)")]
    ReconnectExhausted { attempts: u32, elapsed: Duration },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Client lifecycle
    #[error("Stream is already open")]
    StreamAlreadyOpen,

    #[error("Stream is closed")]
    StreamClosed,

    #[error("Stream shut down")]
    Shutdown,

    // Generic
    #[error("{0}")]
    Other(String),
}

impl TdError {
    /// Returns true if the transport reported the connection as closed.
    ///
    /// These errors are recoverable: the connection manager reconnects with
    /// backoff instead of terminating.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, TdError::ConnectionClosed(_))
    }

    /// Returns true if this error suggests retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            TdError::ConnectionClosed(_) | TdError::LoginTimeout | TdError::HttpError(_) => true,
            TdError::ApiError { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for TdError {
    fn from(err: reqwest::Error) -> Self {
        TdError::HttpError(err.to_string())
    }
}

impl From<serde_json::Error> for TdError {
    fn from(err: serde_json::Error) -> Self {
        TdError::JsonError(err.to_string())
    }
}

impl From<url::ParseError> for TdError {
    fn from(err: url::ParseError) -> Self {
        TdError::Other(format!("URL parse error: {err}"))
    }
}

impl From<tungstenite::Error> for TdError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed
            | tungstenite::Error::AlreadyClosed
            | tungstenite::Error::Io(_)
            | tungstenite::Error::Protocol(_) => TdError::ConnectionClosed(err.to_string()),
            other => TdError::WebSocketError(other.to_string()),
        }
    }
}
