//! Shared collaborators of every feed.

use std::sync::Arc;

use bazaar_client::{ChangeFeed, QueryClient, Select};
use bazaar_sync::{
    NoticeBoard, OptimisticCoordinator, Record, SubscriptionManager, SyncConfig, decode_row,
};
use tracing::debug;

use crate::FeedError;

/// Query client, subscription registry and coordinator shared by the feeds
/// of one session. Clones share everything.
#[derive(Clone)]
pub struct FeedContext {
    client: Arc<dyn QueryClient>,
    manager: SubscriptionManager,
    coordinator: OptimisticCoordinator,
    config: SyncConfig,
}

impl FeedContext {
    pub fn new(
        client: Arc<dyn QueryClient>,
        feed: Arc<dyn ChangeFeed>,
        config: SyncConfig,
    ) -> Result<Self, FeedError> {
        config.validate()?;
        let manager = SubscriptionManager::new(feed, config.retry.clone());
        let coordinator = OptimisticCoordinator::from_config(&config);
        Ok(Self {
            client,
            manager,
            coordinator,
            config,
        })
    }

    pub fn client(&self) -> &Arc<dyn QueryClient> {
        &self.client
    }

    pub fn manager(&self) -> &SubscriptionManager {
        &self.manager
    }

    pub fn coordinator(&self) -> &OptimisticCoordinator {
        &self.coordinator
    }

    pub fn notices(&self) -> &NoticeBoard {
        self.coordinator.notices()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    /// Run a select and decode every row.
    pub async fn fetch<R: Record>(&self, query: &Select) -> Result<Vec<R>, FeedError> {
        let rows = self.client.select(query).await?;
        debug!(table = %query.table, rows = rows.len(), "fetched");
        rows.iter()
            .map(|row| decode_row(row).map_err(FeedError::from))
            .collect()
    }
}
