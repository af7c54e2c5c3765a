//! Shared fixtures for the feed tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bazaar_client::{MemoryBackend, Row};
use bazaar_feeds::FeedContext;
use bazaar_sync::{FeedHealth, SyncConfig};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tokio::sync::watch;

pub const WAIT: Duration = Duration::from_secs(600);

pub fn row(value: Value) -> Row {
    value.as_object().cloned().expect("row literal must be an object")
}

/// Fixed instant `secs` seconds after the fixture epoch.
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap() + chrono::Duration::seconds(secs)
}

pub fn ts(secs: i64) -> String {
    at(secs).to_rfc3339()
}

pub fn context(backend: &MemoryBackend) -> FeedContext {
    context_with(backend, SyncConfig::default())
}

pub fn context_with(backend: &MemoryBackend, config: SyncConfig) -> FeedContext {
    FeedContext::new(Arc::new(backend.clone()), Arc::new(backend.clone()), config)
        .expect("valid config")
}

pub async fn live(mut health: watch::Receiver<FeedHealth>) {
    tokio::time::timeout(WAIT, health.wait_for(|h| *h == FeedHealth::Live))
        .await
        .expect("timed out waiting for live")
        .expect("health channel closed");
}

/// Let queued deliveries and spawned work run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Wait until `ready` holds, checking between short sleeps.
pub async fn until(ready: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !ready() {
            settle().await;
        }
    })
    .await
    .expect("timed out waiting for condition");
}
