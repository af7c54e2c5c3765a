//! Error types for the Bazaar backend clients.

use thiserror::Error;

/// Coarse classification of a remote failure.
///
/// Callers decide retry/revert behaviour from the class, never from the
/// concrete variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Network trouble or an overloaded server. Safe to retry with backoff.
    TransientNetworkFailure,
    /// Row-level security or session rejected the request. Never retried.
    AuthorizationDenied,
    /// The command was already applied (duplicate key, already liked, ...).
    ConflictOrDuplicate,
    /// The request was malformed or rejected as invalid.
    ValidationFailure,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorClass::TransientNetworkFailure => "transient network failure",
            ErrorClass::AuthorizationDenied => "authorization denied",
            ErrorClass::ConflictOrDuplicate => "conflict or duplicate",
            ErrorClass::ValidationFailure => "validation failure",
        };
        f.write_str(name)
    }
}

/// Errors that can occur when talking to the backend.
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed before a response was read.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The backend refused the caller (row-level security, expired session).
    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    /// The command conflicts with existing state (duplicate key).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The request was rejected as invalid.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The backend answered with an error status.
    #[error("server error ({status}){}: {message}", match code {
        Some(code) => format!(" [{}]", code),
        None => String::new(),
    })]
    Server {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// The request or subscription did not complete in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Invalid response from server.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Invalid client configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ClientError {
    /// Build an error from an HTTP status and an optional PostgREST error code.
    pub fn from_status(status: u16, code: Option<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        match (status, code.as_deref()) {
            (_, Some("42501")) | (401 | 403, _) => ClientError::AuthorizationDenied(message),
            (_, Some("23505")) | (409, _) => ClientError::Conflict(message),
            (_, Some("23502" | "23503" | "23514" | "22P02")) | (400 | 422, _) => {
                ClientError::Validation(message)
            }
            _ => ClientError::Server {
                status,
                code,
                message,
            },
        }
    }

    /// Classify this error into the retry/revert taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            ClientError::Http(e) => match e.status() {
                Some(status) if !e.is_timeout() => {
                    ClientError::from_status(status.as_u16(), None, String::new()).class()
                }
                _ => ErrorClass::TransientNetworkFailure,
            },
            ClientError::AuthorizationDenied(_) => ErrorClass::AuthorizationDenied,
            ClientError::Conflict(_) => ErrorClass::ConflictOrDuplicate,
            ClientError::Validation(_)
            | ClientError::Json(_)
            | ClientError::InvalidResponse(_)
            | ClientError::Config(_) => ErrorClass::ValidationFailure,
            ClientError::Server { status, .. } => match status {
                408 | 429 | 500..=599 => ErrorClass::TransientNetworkFailure,
                _ => ErrorClass::ValidationFailure,
            },
            ClientError::Timeout(_) | ClientError::WebSocket(_) => {
                ErrorClass::TransientNetworkFailure
            }
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::TransientNetworkFailure
    }
}
