//! In-process backend implementing both [`QueryClient`] and [`ChangeFeed`].
//!
//! Rows live in memory and every write is published to matching
//! subscriptions, the way the realtime server would. Failures and latency
//! can be injected per operation, which is what the sync layer tests and
//! the `demo` command drive.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, trace};

use crate::{
    ChangeEvent, ChangeFeed, ClientError, FeedCallback, FeedMessage, Filter, QueryClient,
    RemoteSubscription, Row, Scope, Select, compare_json,
};

/// Backend operations that can be delayed or made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
    Invoke,
    Subscribe,
}

/// Failure returned by the next call of an [`Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Service unavailable.
    Transient,
    /// Row-level security rejection.
    Denied,
    /// Unique-key violation.
    Conflict,
    /// Malformed request.
    Validation,
}

impl InjectedFailure {
    fn into_error(self, operation: Operation) -> ClientError {
        let message = format!("injected failure for {:?}", operation);
        match self {
            InjectedFailure::Transient => ClientError::from_status(503, None, message),
            InjectedFailure::Denied => ClientError::from_status(403, Some("42501".into()), message),
            InjectedFailure::Conflict => ClientError::from_status(409, Some("23505".into()), message),
            InjectedFailure::Validation => ClientError::from_status(400, Some("22P02".into()), message),
        }
    }
}

/// Stored procedure handler.
pub type Procedure = Arc<dyn Fn(Value) -> Result<Value, ClientError> + Send + Sync>;

struct MemorySubscription {
    scope: Scope,
    callback: FeedCallback,
}

struct MemoryInner {
    tables: DashMap<String, Vec<Row>>,
    unique: DashMap<String, Vec<Vec<String>>>,
    procedures: DashMap<String, Procedure>,
    subscriptions: DashMap<u64, MemorySubscription>,
    failures: DashMap<Operation, VecDeque<InjectedFailure>>,
    calls: DashMap<Operation, usize>,
    command_latency_ms: AtomicU64,
    subscribe_latency_ms: AtomicU64,
    next_id: AtomicU64,
    subscribes: AtomicUsize,
}

/// Shared in-memory backend. Clones share state.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                tables: DashMap::new(),
                unique: DashMap::new(),
                procedures: DashMap::new(),
                subscriptions: DashMap::new(),
                failures: DashMap::new(),
                calls: DashMap::new(),
                command_latency_ms: AtomicU64::new(0),
                subscribe_latency_ms: AtomicU64::new(0),
                next_id: AtomicU64::new(0),
                subscribes: AtomicUsize::new(0),
            }),
        }
    }

    /// Declare a unique key over `columns` of `table` (`id` is always unique).
    pub fn add_unique(&self, table: &str, columns: &[&str]) {
        self.inner
            .unique
            .entry(table.to_string())
            .or_default()
            .push(columns.iter().map(|c| c.to_string()).collect());
    }

    /// Register a stored procedure.
    pub fn register_procedure<F>(&self, name: &str, procedure: F)
    where
        F: Fn(Value) -> Result<Value, ClientError> + Send + Sync + 'static,
    {
        self.inner
            .procedures
            .insert(name.to_string(), Arc::new(procedure));
    }

    /// Make the next call of `operation` fail. Failures queue up in order.
    pub fn fail_next(&self, operation: Operation, failure: InjectedFailure) {
        self.inner
            .failures
            .entry(operation)
            .or_default()
            .push_back(failure);
    }

    /// Delay applied to every query and write.
    pub fn set_command_latency(&self, latency: Duration) {
        self.inner
            .command_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay before a subscription is confirmed.
    pub fn set_subscribe_latency(&self, latency: Duration) {
        self.inner
            .subscribe_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Seed a row without publishing a change.
    pub fn insert_row(&self, table: &str, row: Row) {
        self.inner
            .tables
            .entry(table.to_string())
            .or_default()
            .push(row);
    }

    /// Current contents of `table`.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.inner
            .tables
            .get(table)
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }

    /// Find a row by `id`.
    pub fn row(&self, table: &str, id: &str) -> Option<Row> {
        self.rows(table).into_iter().find(|row| row_id(row) == id)
    }

    /// Deliver a change to matching subscribers without touching storage.
    pub fn emit(&self, event: ChangeEvent) {
        self.publish(event);
    }

    /// Scopes of all confirmed subscriptions.
    pub fn active_subscriptions(&self) -> Vec<Scope> {
        self.inner
            .subscriptions
            .iter()
            .map(|s| s.scope.clone())
            .collect()
    }

    /// Number of `subscribe` calls so far, successful or not.
    pub fn subscribe_count(&self) -> usize {
        self.inner.subscribes.load(Ordering::SeqCst)
    }

    /// Number of calls of a query or write operation so far.
    pub fn call_count(&self, operation: Operation) -> usize {
        self.inner.calls.get(&operation).map(|c| *c).unwrap_or(0)
    }

    /// Drop every subscription, telling each subscriber the stream was lost.
    pub fn disconnect_all(&self, reason: &str) {
        let ids: Vec<u64> = self.inner.subscriptions.iter().map(|s| *s.key()).collect();
        for id in ids {
            if let Some((_, sub)) = self.inner.subscriptions.remove(&id) {
                (sub.callback)(FeedMessage::Disconnected {
                    reason: reason.to_string(),
                });
            }
        }
    }

    async fn begin(&self, operation: Operation) -> Result<(), ClientError> {
        *self.inner.calls.entry(operation).or_insert(0) += 1;

        let latency_ms = match operation {
            Operation::Subscribe => self.inner.subscribe_latency_ms.load(Ordering::SeqCst),
            _ => self.inner.command_latency_ms.load(Ordering::SeqCst),
        };
        if latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(latency_ms)).await;
        }

        let failure = self
            .inner
            .failures
            .get_mut(&operation)
            .and_then(|mut queue| queue.pop_front());
        match failure {
            Some(failure) => {
                debug!(?operation, ?failure, "injecting failure");
                Err(failure.into_error(operation))
            }
            None => Ok(()),
        }
    }

    fn publish(&self, event: ChangeEvent) {
        let callbacks: Vec<FeedCallback> = self
            .inner
            .subscriptions
            .iter()
            .filter(|sub| sub.scope.admits(&event))
            .map(|sub| Arc::clone(&sub.callback))
            .collect();

        trace!(table = %event.table, event = %event.event, listeners = callbacks.len(), "publishing change");
        for callback in callbacks {
            callback(FeedMessage::Change(event.clone()));
        }
    }

    fn violates_unique(&self, table: &str, rows: &[Row], candidate: &Row) -> bool {
        let id = row_id(candidate);
        if rows.iter().any(|row| row_id(row) == id) {
            return true;
        }
        let Some(keys) = self.inner.unique.get(table) else {
            return false;
        };
        keys.iter().any(|columns| {
            rows.iter().any(|row| {
                columns
                    .iter()
                    .all(|c| row.get(c).is_some() && row.get(c) == candidate.get(c))
            })
        })
    }
}

fn row_id(row: &Row) -> String {
    row.get("id")
        .and_then(crate::value_text)
        .unwrap_or_default()
}

fn matches_all(row: &Row, filters: &[Filter]) -> bool {
    filters.iter().all(|f| f.matches(row))
}

#[async_trait]
impl QueryClient for MemoryBackend {
    async fn select(&self, query: &Select) -> Result<Vec<Row>, ClientError> {
        self.begin(Operation::Select).await?;

        let mut rows: Vec<Row> = self
            .rows(&query.table)
            .into_iter()
            .filter(|row| matches_all(row, &query.filters) && query.matches_any(row))
            .collect();

        rows.sort_by(|a, b| {
            for order in &query.order {
                let null = Value::Null;
                let left = a.get(&order.column).unwrap_or(&null);
                let right = b.get(&order.column).unwrap_or(&null);
                let ordering = compare_json(left, right);
                let ordering = if order.ascending {
                    ordering
                } else {
                    ordering.reverse()
                };
                if ordering.is_ne() {
                    return ordering;
                }
            }
            std::cmp::Ordering::Equal
        });

        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, mut row: Row) -> Result<Row, ClientError> {
        self.begin(Operation::Insert).await?;

        if !row.contains_key("id") {
            let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            row.insert("id".into(), Value::String(format!("{}-{}", table, id)));
        }
        if !row.contains_key("created_at") {
            row.insert("created_at".into(), Value::String(Utc::now().to_rfc3339()));
        }

        {
            let mut rows = self.inner.tables.entry(table.to_string()).or_default();
            if self.violates_unique(table, &rows, &row) {
                return Err(ClientError::from_status(
                    409,
                    Some("23505".into()),
                    format!("duplicate key value violates unique constraint on {}", table),
                ));
            }
            rows.push(row.clone());
        }

        self.publish(ChangeEvent::insert(table, row.clone()));
        Ok(row)
    }

    async fn update(
        &self,
        table: &str,
        patch: Row,
        filters: &[Filter],
    ) -> Result<Vec<Row>, ClientError> {
        self.begin(Operation::Update).await?;

        let updated: Vec<Row> = {
            let mut rows = self.inner.tables.entry(table.to_string()).or_default();
            rows.iter_mut()
                .filter(|row| matches_all(row, filters))
                .map(|row| {
                    for (key, value) in &patch {
                        row.insert(key.clone(), value.clone());
                    }
                    row.clone()
                })
                .collect()
        };

        for row in &updated {
            let mut old = Row::new();
            if let Some(id) = row.get("id") {
                old.insert("id".into(), id.clone());
            }
            let mut event = ChangeEvent::update(table, row.clone());
            event.old_row = Some(old);
            self.publish(event);
        }
        Ok(updated)
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<Vec<Row>, ClientError> {
        self.begin(Operation::Delete).await?;

        let removed: Vec<Row> = {
            let mut rows = self.inner.tables.entry(table.to_string()).or_default();
            let (removed, kept): (Vec<Row>, Vec<Row>) =
                rows.drain(..).partition(|row| matches_all(row, filters));
            *rows = kept;
            removed
        };

        for row in &removed {
            self.publish(ChangeEvent::delete(table, row.clone()));
        }
        Ok(removed)
    }

    async fn invoke(&self, procedure: &str, args: Value) -> Result<Value, ClientError> {
        self.begin(Operation::Invoke).await?;

        let handler = self
            .inner
            .procedures
            .get(procedure)
            .map(|p| Arc::clone(&p))
            .ok_or_else(|| {
                ClientError::from_status(
                    404,
                    Some("PGRST202".into()),
                    format!("function {} not found", procedure),
                )
            })?;
        handler(args)
    }
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn subscribe(
        &self,
        scope: &Scope,
        callback: FeedCallback,
    ) -> Result<RemoteSubscription, ClientError> {
        self.inner.subscribes.fetch_add(1, Ordering::SeqCst);
        self.begin(Operation::Subscribe).await?;

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.subscriptions.insert(
            id,
            MemorySubscription {
                scope: scope.clone(),
                callback,
            },
        );
        debug!(id, scope = %scope, "memory subscription confirmed");
        Ok(RemoteSubscription {
            id,
            topic: format!("memory:{}:{}", scope, id),
        })
    }

    async fn unsubscribe(&self, subscription: RemoteSubscription) -> Result<(), ClientError> {
        self.inner.subscriptions.remove(&subscription.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventClass, ErrorClass, Order};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Mutex;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn recorder() -> (FeedCallback, Arc<Mutex<Vec<FeedMessage>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: FeedCallback = Arc::new(move |msg| sink.lock().unwrap().push(msg));
        (callback, seen)
    }

    #[tokio::test]
    async fn test_select_filters_orders_and_limits() {
        let backend = MemoryBackend::new();
        for (id, ts) in [("m1", "2024-01-01T00:00:01Z"), ("m2", "2024-01-01T00:00:03Z"), ("m3", "2024-01-01T00:00:02Z")] {
            backend.insert_row("messages", row(json!({"id": id, "conversation_id": "c1", "created_at": ts})));
        }
        backend.insert_row("messages", row(json!({"id": "x", "conversation_id": "c2", "created_at": "2024-01-01T00:00:09Z"})));

        let rows = backend
            .select(
                &Select::new("messages")
                    .filter(Filter::eq("conversation_id", "c1"))
                    .order(Order::desc("created_at"))
                    .limit(2),
            )
            .await
            .unwrap();

        let ids: Vec<String> = rows.iter().map(row_id).collect();
        assert_eq!(ids, vec!["m2", "m3"]);
    }

    #[tokio::test]
    async fn test_insert_publishes_to_matching_scope() {
        let backend = MemoryBackend::new();
        let (callback, seen) = recorder();
        let scope = Scope::new("messages", EventClass::Insert)
            .with_filter(Filter::eq("conversation_id", "c1"));
        backend.subscribe(&scope, callback).await.unwrap();

        backend
            .insert("messages", row(json!({"conversation_id": "c1", "content": "hi"})))
            .await
            .unwrap();
        backend
            .insert("messages", row(json!({"conversation_id": "c2", "content": "other"})))
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let FeedMessage::Change(event) = &seen[0] else {
            panic!("expected change");
        };
        assert_eq!(event.column("content"), Some(&json!("hi")));
    }

    #[tokio::test]
    async fn test_unique_violation_is_conflict() {
        let backend = MemoryBackend::new();
        backend.add_unique("likes", &["post_id", "user_id"]);

        backend
            .insert("likes", row(json!({"post_id": "p1", "user_id": "u1"})))
            .await
            .unwrap();
        let err = backend
            .insert("likes", row(json!({"post_id": "p1", "user_id": "u1"})))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::ConflictOrDuplicate);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed_in_order() {
        let backend = MemoryBackend::new();
        backend.fail_next(Operation::Insert, InjectedFailure::Transient);
        backend.fail_next(Operation::Insert, InjectedFailure::Denied);

        let first = backend.insert("t", Row::new()).await.unwrap_err();
        let second = backend.insert("t", Row::new()).await.unwrap_err();
        assert!(first.is_transient());
        assert_eq!(second.class(), ErrorClass::AuthorizationDenied);
        assert!(backend.insert("t", Row::new()).await.is_ok());
        assert_eq!(backend.call_count(Operation::Insert), 3);
    }

    #[tokio::test]
    async fn test_update_and_delete_publish() {
        let backend = MemoryBackend::new();
        backend.insert_row("posts", row(json!({"id": "p1", "likes_count": 3})));
        let (callback, seen) = recorder();
        backend
            .subscribe(&Scope::new("posts", EventClass::All), callback)
            .await
            .unwrap();

        let mut patch = Row::new();
        patch.insert("likes_count".into(), json!(4));
        let updated = backend
            .update("posts", patch, &[Filter::eq("id", "p1")])
            .await
            .unwrap();
        assert_eq!(updated[0]["likes_count"], json!(4));

        backend.delete("posts", &[Filter::eq("id", "p1")]).await.unwrap();
        assert!(backend.rows("posts").is_empty());
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_all_notifies_and_forgets() {
        let backend = MemoryBackend::new();
        let (callback, seen) = recorder();
        backend
            .subscribe(&Scope::new("posts", EventClass::Update), callback)
            .await
            .unwrap();

        backend.disconnect_all("network down");
        assert!(backend.active_subscriptions().is_empty());
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[FeedMessage::Disconnected {
                reason: "network down".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_invoke_unknown_procedure() {
        let backend = MemoryBackend::new();
        backend.register_procedure("echo", Ok);
        assert_eq!(backend.invoke("echo", json!({"a": 1})).await.unwrap(), json!({"a": 1}));
        let err = backend.invoke("missing", json!({})).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::ValidationFailure);
    }
}
