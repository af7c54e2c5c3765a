//! Polled trending posts and suggested users.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bazaar_client::QueryClient;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::records::{SuggestedUser, TrendingPost};
use crate::{FeedContext, FeedError, lock};

const TRENDING_PROCEDURE: &str = "get_trending_posts";
const SUGGESTED_PROCEDURE: &str = "get_suggested_users";
const TRENDING_LIMIT: usize = 20;
const SUGGESTED_LIMIT: usize = 10;

/// Latest result set. A failed poll keeps the previous posts and users and
/// records the error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrendingSnapshot {
    pub posts: Vec<TrendingPost>,
    pub users: Vec<SuggestedUser>,
    pub refreshed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

struct Poller {
    client: Arc<dyn QueryClient>,
    user_id: String,
    state: watch::Sender<TrendingSnapshot>,
}

impl Poller {
    async fn fetch<T: DeserializeOwned>(&self, procedure: &str, args: Value) -> Result<Vec<T>, FeedError> {
        match self.client.invoke(procedure, args).await? {
            Value::Array(items) => Ok(items
                .into_iter()
                .map(serde_json::from_value)
                .collect::<Result<Vec<T>, _>>()?),
            _ => Err(FeedError::unexpected(procedure, "expected an array")),
        }
    }

    async fn refresh(&self) -> Result<(), FeedError> {
        let result = async {
            let posts: Vec<TrendingPost> = self
                .fetch(TRENDING_PROCEDURE, json!({ "limit": TRENDING_LIMIT }))
                .await?;
            let users: Vec<SuggestedUser> = self
                .fetch(
                    SUGGESTED_PROCEDURE,
                    json!({ "user_id": self.user_id, "limit": SUGGESTED_LIMIT }),
                )
                .await?;
            Ok::<_, FeedError>((posts, users))
        }
        .await;

        match result {
            Ok((posts, users)) => {
                debug!(posts = posts.len(), users = users.len(), "trending refreshed");
                self.state.send_replace(TrendingSnapshot {
                    posts,
                    users,
                    refreshed_at: Some(Utc::now()),
                    last_error: None,
                });
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                self.state.send_modify(|state| state.last_error = Some(message));
                Err(e)
            }
        }
    }

    async fn run(&self, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "trending poller starting");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            if let Err(e) = self.refresh().await {
                warn!(error = %e, "trending refresh failed, keeping previous results");
            }

            tokio::select! {
                biased;
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = sleep(interval) => {}
            }
        }

        info!("trending poller stopped");
    }
}

/// Polls the trending procedures on a fixed interval and publishes the
/// latest result set.
pub struct TrendingAggregator {
    poller: Arc<Poller>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TrendingAggregator {
    /// Start polling. The first refresh runs immediately.
    pub fn spawn(ctx: &FeedContext, user_id: impl Into<String>) -> Self {
        let (state, _) = watch::channel(TrendingSnapshot::default());
        let poller = Arc::new(Poller {
            client: Arc::clone(ctx.client()),
            user_id: user_id.into(),
            state,
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let interval = ctx.config().trending_poll_interval();

        let task = tokio::spawn({
            let poller = Arc::clone(&poller);
            async move { poller.run(interval, shutdown_rx).await }
        });

        Self {
            poller,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn snapshot(&self) -> TrendingSnapshot {
        self.poller.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TrendingSnapshot> {
        self.poller.state.subscribe()
    }

    /// Poll now, outside the regular interval.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<(), FeedError> {
        self.poller.refresh().await
    }

    pub fn is_running(&self) -> bool {
        lock(&self.task).as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop polling and wait for the loop to exit.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let task = lock(&self.task).take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(error = %e, "trending poller task failed");
        }
    }
}

impl Drop for TrendingAggregator {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
