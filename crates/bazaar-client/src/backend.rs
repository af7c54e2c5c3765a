//! Contracts between the sync layer and whatever backend serves it.

use async_trait::async_trait;
use serde_json::Value;

use crate::{ClientError, FeedCallback, Filter, RemoteSubscription, Row, Scope, Select};

/// Request/response access to tables and stored procedures.
#[async_trait]
pub trait QueryClient: Send + Sync {
    /// Read rows matching a select.
    async fn select(&self, query: &Select) -> Result<Vec<Row>, ClientError>;

    /// Insert one row and return it as stored.
    async fn insert(&self, table: &str, row: Row) -> Result<Row, ClientError>;

    /// Apply `patch` to every row matching all `filters`; returns the updated rows.
    async fn update(
        &self,
        table: &str,
        patch: Row,
        filters: &[Filter],
    ) -> Result<Vec<Row>, ClientError>;

    /// Delete every row matching all `filters`; returns the deleted rows.
    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<Vec<Row>, ClientError>;

    /// Invoke a stored procedure with named arguments.
    async fn invoke(&self, procedure: &str, args: Value) -> Result<Value, ClientError>;
}

/// Push-based row-level change notifications.
///
/// A confirmed subscription delivers every change in its scope to the
/// callback until [`ChangeFeed::unsubscribe`] is called or the stream is
/// lost, in which case a final [`FeedMessage::Disconnected`](crate::FeedMessage)
/// is delivered.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a remote subscription. Resolves once the backend confirms it.
    async fn subscribe(
        &self,
        scope: &Scope,
        callback: FeedCallback,
    ) -> Result<RemoteSubscription, ClientError>;

    /// Release a remote subscription. Unknown subscriptions are ignored.
    async fn unsubscribe(&self, subscription: RemoteSubscription) -> Result<(), ClientError>;
}
