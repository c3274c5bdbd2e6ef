//! Error types for session and request operations.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for session and request operations.
///
/// Every terminal failure reaches the caller with enough structure (status,
/// parsed body) to render a message. Forced logout happens as a side effect
/// and never replaces the error.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection failure, timeout, 5xx or 429, surfaced after retries ran out.
    #[error("Transient failure{}: {message}", status_suffix(.status))]
    Transient {
        /// HTTP status, absent for transport-level failures.
        status: Option<u16>,
        /// Message from the server or transport.
        message: String,
    },

    /// 401 that a token refresh could not recover.
    #[error("Authentication failed ({status}): {message}")]
    Authentication {
        /// HTTP status code.
        status: u16,
        /// Message from the server.
        message: String,
    },

    /// The user was idle past the threshold; nothing was sent.
    #[error("Session expired due to inactivity")]
    SessionExpired,

    /// Any other 4xx. Never retried.
    #[error("Request rejected ({status}): {message}")]
    Validation {
        /// HTTP status code.
        status: u16,
        /// Message extracted from the body, or a generic one.
        message: String,
        /// Parsed error body, verbatim.
        body: Option<Value>,
    },

    /// The refresh or login endpoint rejected the credential.
    #[error("Token refresh rejected: {0}")]
    RefreshFailed(String),

    /// Durable storage could not be read or written.
    #[error("Storage error: {0}")]
    Storage(String),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parsing failed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Transient { status, .. } => *status,
            Error::Authentication { status, .. } | Error::Validation { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    /// Check if this is an authentication error (including idle expiry).
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            Error::Authentication { .. } | Error::SessionExpired | Error::RefreshFailed(_)
        )
    }

    /// Check if this error came from a transient condition.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient { .. })
    }

    /// Check if repeating the call later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transient { .. } => true,
            Error::Storage(_) => true,
            _ => false,
        }
    }

    /// Check if this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Validation { status: 404, .. })
    }

    /// Structured per-field errors, when the server sent them.
    ///
    /// Accepts `{"errors": {"field": ["msg", ...]}}` and
    /// `{"errors": {"field": "msg"}}`.
    pub fn field_errors(&self) -> BTreeMap<String, Vec<String>> {
        let mut out = BTreeMap::new();
        let Error::Validation {
            body: Some(body), ..
        } = self
        else {
            return out;
        };
        let Some(errors) = body.get("errors").and_then(Value::as_object) else {
            return out;
        };

        for (field, value) in errors {
            let messages = match value {
                Value::String(s) => vec![s.clone()],
                Value::Array(items) => items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
                other => vec![other.to_string()],
            };
            out.insert(field.clone(), messages);
        }
        out
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

/// Pull a human-readable message out of an error body.
pub(crate) fn message_from_body(body: Option<&Value>, status: u16) -> String {
    body.and_then(|b| {
        ["message", "error", "detail"]
            .iter()
            .find_map(|k| b.get(*k).and_then(Value::as_str))
            .map(str::to_string)
    })
    .unwrap_or_else(|| format!("HTTP {status}"))
}
