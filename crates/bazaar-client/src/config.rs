//! Connection settings for the Bazaar backend.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ClientError;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 25;
const DEFAULT_JOIN_TIMEOUT_SECS: u64 = 10;

/// Configuration shared by [`RestClient`](crate::RestClient) and
/// [`RealtimeSocket`](crate::RealtimeSocket).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Project base URL (`https://xyz.example.co`).
    pub base_url: String,
    /// Public API key sent with every request.
    pub api_key: String,
    /// Session token of the signed-in user. Falls back to the API key.
    pub access_token: Option<String>,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Interval between realtime heartbeats.
    pub heartbeat_interval_secs: u64,
    /// How long to wait for a channel join to be acknowledged.
    pub join_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            access_token: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            join_timeout_secs: DEFAULT_JOIN_TIMEOUT_SECS,
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Bearer token for the `Authorization` header.
    pub fn bearer(&self) -> &str {
        self.access_token.as_deref().unwrap_or(&self.api_key)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    /// Reject configurations that cannot produce a working client.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.base_url.trim().is_empty() {
            return Err(ClientError::Config("base_url must not be empty".into()));
        }
        if self.api_key.trim().is_empty() {
            return Err(ClientError::Config("api_key must not be empty".into()));
        }
        if self.request_timeout_secs == 0 || self.join_timeout_secs == 0 {
            return Err(ClientError::Config("timeouts must be positive".into()));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ClientError::Config(
                "heartbeat_interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Base URL without a trailing slash.
    pub(crate) fn trimmed_base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}
