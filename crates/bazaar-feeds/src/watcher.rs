//! Generic live view over one table.

use std::sync::Mutex;

use bazaar_client::{Scope, Select};
use bazaar_sync::{FeedHealth, FeedOrder, FeedSnapshot, ReconcilingStore, Record, ScopedSubscription};
use tokio::sync::watch;
use tracing::{debug, instrument};

use crate::{FeedContext, FeedError, lock, merge_into};

/// Rows of any [`Record`] type kept live by one scope.
///
/// `rescope` swaps both the subscription and the seeding query; the old
/// scope is closed before anything of the new one is loaded.
pub struct TableWatcher<R: Record> {
    ctx: FeedContext,
    store: ReconcilingStore<R>,
    subscription: Mutex<ScopedSubscription>,
}

impl<R: Record> TableWatcher<R> {
    pub async fn open(
        ctx: FeedContext,
        order: FeedOrder,
        scope: Scope,
        query: Select,
    ) -> Result<Self, FeedError> {
        let watcher = Self {
            subscription: Mutex::new(ScopedSubscription::idle(ctx.manager())),
            ctx,
            store: ReconcilingStore::new(order),
        };
        watcher.rescope(scope, query).await?;
        Ok(watcher)
    }

    #[instrument(skip(self, scope, query), fields(scope = %scope))]
    pub async fn rescope(&self, scope: Scope, query: Select) -> Result<(), FeedError> {
        {
            let mut subscription = lock(&self.subscription);
            subscription.close();
            self.store.clear();
            subscription.switch(scope, merge_into(&self.store, "watcher"));
        }
        let rows = self.ctx.fetch::<R>(&query).await?;
        debug!(rows = rows.len(), "watcher seeded");
        self.store.merge_fetched(rows);
        Ok(())
    }

    pub fn records(&self) -> Vec<R> {
        self.store.records()
    }

    pub fn get(&self, id: &str) -> Option<R> {
        self.store.get(id)
    }

    pub fn subscribe(&self) -> watch::Receiver<FeedSnapshot<R>> {
        self.store.subscribe()
    }

    pub fn store(&self) -> &ReconcilingStore<R> {
        &self.store
    }

    pub fn scope(&self) -> Option<Scope> {
        lock(&self.subscription).scope().cloned()
    }

    pub fn health(&self) -> watch::Receiver<FeedHealth> {
        lock(&self.subscription).health()
    }

    pub fn close(&self) {
        lock(&self.subscription).close();
        self.store.clear();
    }
}
