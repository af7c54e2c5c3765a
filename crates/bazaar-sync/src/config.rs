//! Tunables for subscriptions, commands and feeds.

use std::time::Duration;

use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};

use crate::SyncError;

/// Retry schedule for re-establishing a lost subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    /// Consecutive failed attempts before a scope is marked degraded.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: 1_000,
            max_interval_ms: 30_000,
            max_attempts: 8,
        }
    }
}

impl RetryPolicy {
    /// Fresh backoff state. Attempts are bounded by `max_attempts`, not elapsed time.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(self.initial_interval_ms),
            current_interval: Duration::from_millis(self.initial_interval_ms),
            max_interval: Duration::from_millis(self.max_interval_ms),
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }
}

/// Configuration for the sync layer and the feeds built on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Rows per page for initial loads and older-page fetches.
    pub page_size: usize,
    /// Bound on every optimistic command.
    pub command_timeout_ms: u64,
    pub retry: RetryPolicy,
    pub trending_poll_secs: u64,
    /// Maximum number of notices kept on the board.
    pub notice_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            command_timeout_ms: 10_000,
            retry: RetryPolicy::default(),
            trending_poll_secs: 60,
            notice_capacity: 20,
        }
    }
}

impl SyncConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn trending_poll_interval(&self) -> Duration {
        Duration::from_secs(self.trending_poll_secs)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.page_size == 0 {
            return Err(SyncError::Config("page_size must be positive".into()));
        }
        if self.command_timeout_ms == 0 {
            return Err(SyncError::Config("command_timeout_ms must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::Config("retry.max_attempts must be positive".into()));
        }
        if self.retry.initial_interval_ms > self.retry.max_interval_ms {
            return Err(SyncError::Config(
                "retry.initial_interval_ms exceeds retry.max_interval_ms".into(),
            ));
        }
        if self.trending_poll_secs == 0 {
            return Err(SyncError::Config("trending_poll_secs must be positive".into()));
        }
        if self.notice_capacity == 0 {
            return Err(SyncError::Config("notice_capacity must be positive".into()));
        }
        Ok(())
    }
}
