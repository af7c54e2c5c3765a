//! Error types for domain feeds.

use thiserror::Error;

/// Errors that can occur in feed operations.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Sync layer error.
    #[error("sync error: {0}")]
    Sync(#[from] bazaar_sync::SyncError),

    /// Backend error on a fetch (commands settle through the coordinator instead).
    #[error("backend error: {0}")]
    Client(#[from] bazaar_client::ClientError),

    /// Input rejected before any remote command was issued.
    #[error("validation failed: {0}")]
    Validation(String),

    /// No conversation is open on the message feed.
    #[error("no conversation open")]
    NoConversation,

    /// The record is not in the feed.
    #[error("not in feed: {0}")]
    NotInFeed(String),

    /// A server procedure returned something other than the expected shape.
    #[error("unexpected response from {procedure}: {message}")]
    UnexpectedResponse { procedure: String, message: String },

    /// JSON decoding error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FeedError {
    pub fn unexpected(procedure: &str, message: impl Into<String>) -> Self {
        FeedError::UnexpectedResponse {
            procedure: procedure.to_string(),
            message: message.into(),
        }
    }
}
