//! Like counts for a watched set of posts.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bazaar_client::{ClientError, EventClass, Filter, Row, Scope, Select, value_text};
use bazaar_sync::{
    FeedHealth, FeedOrder, FeedSnapshot, Mutation, MutationOutcome, ReconcilingStore,
    ScopedSubscription,
};
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, instrument};

use crate::records::PostLikes;
use crate::{FeedContext, FeedError, lock, merge_into};

const POSTS: &str = "posts";
const LIKES: &str = "likes";

/// Per-post `{likes_count, is_liked}` for the posts currently on screen.
///
/// The scope is the watched set itself: watching a different set of posts
/// replaces the subscription.
pub struct LikeFeed {
    ctx: FeedContext,
    user_id: String,
    store: ReconcilingStore<PostLikes>,
    subscription: Mutex<ScopedSubscription>,
    watched: Mutex<Vec<String>>,
    epoch: AtomicU64,
}

impl LikeFeed {
    pub fn new(ctx: FeedContext, user_id: impl Into<String>) -> Self {
        let subscription = Mutex::new(ScopedSubscription::idle(ctx.manager()));
        Self {
            ctx,
            user_id: user_id.into(),
            store: ReconcilingStore::new(FeedOrder::NewestFirst),
            subscription,
            watched: Mutex::new(Vec::new()),
            epoch: AtomicU64::new(0),
        }
    }

    /// Watch exactly `post_ids`. Watching the same set again is a no-op.
    #[instrument(skip(self, post_ids))]
    pub async fn watch<I, S>(&self, post_ids: I) -> Result<(), FeedError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ids: Vec<String> = post_ids.into_iter().map(Into::into).collect();
        ids.sort();
        ids.dedup();

        let epoch = {
            let mut watched = lock(&self.watched);
            if *watched == ids {
                return Ok(());
            }
            *watched = ids.clone();
            self.epoch.fetch_add(1, Ordering::SeqCst) + 1
        };

        {
            let mut subscription = lock(&self.subscription);
            subscription.close();
            self.store.clear();
            if ids.is_empty() {
                return Ok(());
            }
            let scope =
                Scope::new(POSTS, EventClass::Update).with_filter(Filter::in_list("id", &ids));
            subscription.switch(scope, merge_into(&self.store, "likes"));
        }
        debug!(count = ids.len(), "watching posts");

        let result = self.load(&ids).await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!("watched set changed during load, discarding");
            return Ok(());
        }
        let records = match result {
            Ok(records) => records,
            Err(e) => {
                // Let the same set be watched again.
                lock(&self.watched).clear();
                return Err(e);
            }
        };
        self.store.seed(records);
        Ok(())
    }

    async fn load(&self, ids: &[String]) -> Result<Vec<PostLikes>, FeedError> {
        let posts = self
            .ctx
            .client()
            .select(
                &Select::new(POSTS)
                    .columns("id, likes_count, created_at")
                    .filter(Filter::in_list("id", ids)),
            )
            .await?;
        let liked: HashSet<String> = self
            .ctx
            .client()
            .select(
                &Select::new(LIKES)
                    .columns("post_id")
                    .filter(Filter::eq("user_id", &self.user_id))
                    .filter(Filter::in_list("post_id", ids)),
            )
            .await?
            .iter()
            .filter_map(|row| row.get("post_id").and_then(value_text))
            .collect();

        let records = posts
            .into_iter()
            .map(|mut row| {
                let is_liked = row
                    .get("id")
                    .and_then(value_text)
                    .is_some_and(|id| liked.contains(&id));
                row.insert("is_liked".into(), json!(is_liked));
                serde_json::from_value::<PostLikes>(Value::Object(row))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn watched(&self) -> Vec<String> {
        lock(&self.watched).clone()
    }

    pub fn likes(&self, post_id: &str) -> Option<PostLikes> {
        self.store.get(post_id)
    }

    pub fn snapshot(&self) -> FeedSnapshot<PostLikes> {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<FeedSnapshot<PostLikes>> {
        self.store.subscribe()
    }

    pub fn store(&self) -> &ReconcilingStore<PostLikes> {
        &self.store
    }

    pub fn health(&self) -> watch::Receiver<FeedHealth> {
        lock(&self.subscription).health()
    }

    pub fn is_degraded(&self) -> bool {
        self.health().borrow().is_degraded()
    }

    /// Like or unlike a watched post.
    ///
    /// The count moves by one immediately. Pushed counts are absolute, so a
    /// push for this same like landing before the command's response leaves
    /// the count where it is.
    #[instrument(skip(self))]
    pub async fn toggle_like(&self, post_id: &str) -> Result<MutationOutcome<PostLikes>, FeedError> {
        let current = self
            .store
            .get(post_id)
            .ok_or_else(|| FeedError::NotInFeed(post_id.to_string()))?;
        let liking = !current.is_liked;
        let count = if liking {
            current.likes_count + 1
        } else {
            (current.likes_count - 1).max(0)
        };

        let mut patch = Row::new();
        patch.insert("likes_count".into(), json!(count));
        patch.insert("is_liked".into(), json!(liking));

        let client = Arc::clone(self.ctx.client());
        let user_id = self.user_id.clone();
        let target = post_id.to_string();
        let command = async move {
            if liking {
                let mut row = Row::new();
                row.insert("post_id".into(), json!(target));
                row.insert("user_id".into(), json!(user_id));
                client.insert(LIKES, row).await?;
            } else {
                client
                    .delete(
                        LIKES,
                        &[Filter::eq("post_id", &target), Filter::eq("user_id", &user_id)],
                    )
                    .await?;
            }
            Ok::<_, ClientError>(None)
        };

        let action = if liking { "like post" } else { "unlike post" };
        let outcome = self
            .ctx
            .coordinator()
            .apply(&self.store, Mutation::patch(post_id, patch), action, command)
            .await?;
        Ok(outcome)
    }
}
