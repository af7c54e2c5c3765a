//! User-scoped notification feed, newest first.

use std::sync::Arc;

use bazaar_client::{ClientError, EventClass, Filter, Row, Scope, Select};
use bazaar_sync::{
    FeedHealth, FeedOrder, FeedSnapshot, Mutation, MutationOutcome, ReconcilingStore,
    ScopedSubscription,
};
use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, instrument};

use crate::paging::{Cursor, PageState, Pager};
use crate::records::Notification;
use crate::{FeedContext, FeedError, merge_into};

const TABLE: &str = "notifications";

/// Unread notifications in a snapshot.
pub fn unread_count_of(snapshot: &FeedSnapshot<Notification>) -> usize {
    snapshot.records().iter().filter(|n| !n.is_read()).count()
}

pub struct NotificationFeed {
    ctx: FeedContext,
    user_id: String,
    store: ReconcilingStore<Notification>,
    subscription: ScopedSubscription,
    pager: Pager,
}

impl NotificationFeed {
    /// Subscribe to the user's notifications and load the newest page.
    #[instrument(skip(ctx))]
    pub async fn open(ctx: FeedContext, user_id: &str) -> Result<Self, FeedError> {
        let store = ReconcilingStore::new(FeedOrder::NewestFirst);
        let scope = Scope::new(TABLE, EventClass::All).with_filter(Filter::eq("user_id", user_id));
        let subscription =
            ScopedSubscription::open(ctx.manager(), scope, merge_into(&store, "notifications"));
        let pager = Pager::new("created_at", ctx.page_size());

        let feed = Self {
            ctx,
            user_id: user_id.to_string(),
            store,
            subscription,
            pager,
        };
        feed.refresh().await?;
        info!(count = feed.store.len(), unread = feed.unread_count(), "notification feed open");
        Ok(feed)
    }

    /// Reload the newest page. Unsettled local changes are laid back over it.
    pub async fn refresh(&self) -> Result<(), FeedError> {
        self.pager.begin_initial();
        let query = self
            .pager
            .first_page(Select::new(TABLE).filter(Filter::eq("user_id", &self.user_id)));
        match self.ctx.fetch::<Notification>(&query).await {
            Ok(page) => {
                let fetched = page.len();
                self.store.seed(page);
                self.pager.finish_initial(Some(fetched));
                Ok(())
            }
            Err(e) => {
                self.pager.finish_initial(None);
                Err(e)
            }
        }
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.store.records()
    }

    pub fn get(&self, id: &str) -> Option<Notification> {
        self.store.get(id)
    }

    /// Recomputed from the current snapshot on every call.
    pub fn unread_count(&self) -> usize {
        unread_count_of(&self.store.snapshot())
    }

    pub fn subscribe(&self) -> watch::Receiver<FeedSnapshot<Notification>> {
        self.store.subscribe()
    }

    pub fn store(&self) -> &ReconcilingStore<Notification> {
        &self.store
    }

    pub fn page_state(&self) -> PageState {
        self.pager.state()
    }

    pub fn health(&self) -> watch::Receiver<FeedHealth> {
        self.subscription.health()
    }

    pub fn is_degraded(&self) -> bool {
        self.health().borrow().is_degraded()
    }

    /// Mark one notification read. `None` if it already was.
    #[instrument(skip(self))]
    pub async fn mark_read(
        &self,
        id: &str,
    ) -> Result<Option<MutationOutcome<Notification>>, FeedError> {
        let current = self
            .store
            .get(id)
            .ok_or_else(|| FeedError::NotInFeed(id.to_string()))?;
        if current.is_read() {
            return Ok(None);
        }

        let patch = read_patch();
        let client = Arc::clone(self.ctx.client());
        let remote_patch = patch.clone();
        let filters = vec![Filter::eq("id", id)];
        let command = async move {
            client.update(TABLE, remote_patch, &filters).await?;
            Ok::<_, ClientError>(None)
        };

        let outcome = self
            .ctx
            .coordinator()
            .apply(&self.store, Mutation::patch(id, patch), "mark notification read", command)
            .await?;
        Ok(Some(outcome))
    }

    /// Mark every loaded unread notification read. `None` if none were unread.
    #[instrument(skip(self))]
    pub async fn mark_all_read(&self) -> Result<Option<MutationOutcome<Notification>>, FeedError> {
        let unread: Vec<String> = self
            .store
            .records()
            .into_iter()
            .filter(|n| !n.is_read())
            .map(|n| n.id)
            .collect();
        if unread.is_empty() {
            return Ok(None);
        }
        debug!(count = unread.len(), "marking all read");

        let patch = read_patch();
        let client = Arc::clone(self.ctx.client());
        let remote_patch = patch.clone();
        let filters = vec![
            Filter::eq("user_id", &self.user_id),
            Filter::is_null("read_at"),
        ];
        let command = async move {
            client.update(TABLE, remote_patch, &filters).await?;
            Ok::<_, ClientError>(None)
        };

        let outcome = self
            .ctx
            .coordinator()
            .apply(
                &self.store,
                Mutation::PatchMany { ids: unread, patch },
                "mark all notifications read",
                command,
            )
            .await?;
        Ok(Some(outcome))
    }

    /// Delete one notification.
    #[instrument(skip(self))]
    pub async fn dismiss(&self, id: &str) -> Result<MutationOutcome<Notification>, FeedError> {
        let client = Arc::clone(self.ctx.client());
        let filters = vec![Filter::eq("id", id)];
        let command = async move {
            client.delete(TABLE, &filters).await?;
            Ok::<_, ClientError>(None)
        };

        let outcome = self
            .ctx
            .coordinator()
            .apply(&self.store, Mutation::remove(id), "dismiss notification", command)
            .await?;
        Ok(outcome)
    }

    /// Fetch the page before the oldest loaded notification.
    #[instrument(skip(self))]
    pub async fn load_older(&self) -> Result<usize, FeedError> {
        if !self.pager.try_begin_older() {
            return Ok(0);
        }
        let cursor = Cursor::oldest(self.store.snapshot().records());
        let query = self.pager.page_before(
            Select::new(TABLE).filter(Filter::eq("user_id", &self.user_id)),
            cursor,
        );

        match self.ctx.fetch::<Notification>(&query).await {
            Ok(page) => {
                let fetched = page.len();
                let added = self.store.append_older(page);
                self.pager.finish_older(Some(fetched));
                Ok(added)
            }
            Err(e) => {
                self.pager.finish_older(None);
                Err(e)
            }
        }
    }
}

fn read_patch() -> Row {
    let mut patch = Row::new();
    patch.insert("read_at".into(), json!(Utc::now()));
    patch
}
