//! Error types for the sync layer.

use thiserror::Error;

use crate::EntryId;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Backend error.
    #[error("backend error: {0}")]
    Client(#[from] bazaar_client::ClientError),

    /// The record is not in the store.
    #[error("unknown record: {0}")]
    UnknownRecord(String),

    /// An optimistic insert would duplicate an existing identifier.
    #[error("duplicate record: {0}")]
    DuplicateRecord(String),

    /// The optimistic entry does not exist or has already settled.
    #[error("unknown optimistic entry: {0}")]
    UnknownEntry(EntryId),

    /// A row could not be decoded into its record type.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Invalid sync configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}
