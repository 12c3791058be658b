//! Wire codec for the streamer.
//!
//! Outbound batches are plain JSON. Inbound frames are parsed strictly first;
//! the streamer occasionally emits doubled escapes, NUL bytes and raw control
//! characters inside strings, so a failed parse is retried after sanitizing
//! and then once more with control characters escaped.
use log::debug;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::errors::TdError;
use crate::models::{Frame, RequestBatch};

const REDACTED: &str = "<redacted>";
const SECRET_PARAMS: [&str; 2] = ["credential", "token"];

/// An encoded batch ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBatch {
    /// Exact text frame sent on the wire.
    pub wire: String,
    /// Copy with secrets masked, present only when redaction was requested.
    pub redacted: Option<String>,
}

impl EncodedBatch {
    /// The text safe to write to logs.
    pub fn loggable(&self) -> &str {
        self.redacted.as_deref().unwrap_or(&self.wire)
    }
}

/// Encode a batch to its JSON text frame.
///
/// With `redact` set, the `credential` and `token` parameters are replaced
/// by `<redacted>` in [`EncodedBatch::redacted`]; the wire text is untouched.
pub fn encode(batch: &RequestBatch, redact: bool) -> Result<EncodedBatch, TdError> {
    let wire = serde_json::to_string(batch)?;
    let redacted = if redact {
        let mut masked = batch.clone();
        for request in &mut masked.requests {
            for key in SECRET_PARAMS {
                if let Some(value) = request.parameters.get_mut(key) {
                    *value = Value::String(REDACTED.into());
                }
            }
        }
        Some(serde_json::to_string(&masked)?)
    } else {
        None
    };
    Ok(EncodedBatch { wire, redacted })
}

/// Decode an inbound text frame.
pub fn decode(text: &str) -> Result<Frame, TdError> {
    decode_as(text)
}

/// Decode raw frame bytes, replacing invalid UTF-8 sequences first.
pub fn decode_bytes(bytes: &[u8]) -> Result<Frame, TdError> {
    decode(&String::from_utf8_lossy(bytes))
}

/// Decode an inbound text frame into any deserializable type, with the
/// sanitize and lenient fallbacks.
pub fn decode_as<T: DeserializeOwned>(text: &str) -> Result<T, TdError> {
    let strict_err = match serde_json::from_str(text) {
        Ok(parsed) => return Ok(parsed),
        Err(e) => e,
    };
    debug!("codec.decode strict_failed error={strict_err} len={}", text.len());

    let sanitized = sanitize(text);
    if let Ok(parsed) = serde_json::from_str(&sanitized) {
        debug!("codec.decode recovered stage=sanitize");
        return Ok(parsed);
    }

    match serde_json::from_str(&escape_control_chars(&sanitized)) {
        Ok(parsed) => {
            debug!("codec.decode recovered stage=lenient");
            Ok(parsed)
        }
        Err(e) => Err(TdError::DecodeError(format!(
            "{e} (strict parse: {strict_err})"
        ))),
    }
}

/// Collapse doubled backslashes and strip NUL characters.
fn sanitize(text: &str) -> String {
    text.replace("\\\\", "\\").replace('\0', "")
}

/// Escape raw control characters that appear inside string literals.
fn escape_control_chars(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    for c in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            } else if (c as u32) < 0x20 {
                out.push_str(&format!("\\u{:04x}", c as u32));
                continue;
            }
        } else if c == '"' {
            in_string = true;
        }
        out.push(c);
    }
    out
}
