//! The user's conversation list, most recent activity first.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bazaar_client::{ChangeEvent, EventClass, QueryClient, Scope, value_text};
use bazaar_sync::{
    EventCallback, FeedHealth, FeedOrder, FeedSnapshot, ReconcilingStore, ScopedSubscription,
};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::records::Conversation;
use crate::{FeedContext, FeedError, lock};

const PROCEDURE: &str = "get_conversations";

/// Fetches the list through the server procedure and seeds the store.
#[derive(Clone)]
struct ConversationLoader {
    client: Arc<dyn QueryClient>,
    store: ReconcilingStore<Conversation>,
    user_id: String,
    refreshing: Arc<AtomicBool>,
    counted: Arc<Mutex<Counted>>,
}

/// Messages already reflected in the list.
#[derive(Default)]
struct Counted {
    /// `last_message_at` of each conversation as of the last reload.
    watermarks: HashMap<String, DateTime<Utc>>,
    /// Pushed messages applied since the last reload.
    message_ids: HashSet<String>,
}

impl Counted {
    /// Record a pushed message. False if the list already reflects it.
    fn admit(&mut self, activity: &Activity) -> bool {
        if self
            .watermarks
            .get(&activity.conversation_id)
            .is_some_and(|seen| activity.created_at <= *seen)
        {
            return false;
        }
        match &activity.message_id {
            Some(id) => self.message_ids.insert(id.clone()),
            None => true,
        }
    }
}

impl ConversationLoader {
    async fn refresh(&self) -> Result<usize, FeedError> {
        let value = self
            .client
            .invoke(PROCEDURE, json!({ "user_id": self.user_id }))
            .await?;
        let Value::Array(items) = value else {
            return Err(FeedError::unexpected(PROCEDURE, "expected an array"));
        };
        let conversations = items
            .into_iter()
            .map(serde_json::from_value::<Conversation>)
            .collect::<Result<Vec<_>, _>>()?;
        let count = conversations.len();
        {
            let mut counted = lock(&self.counted);
            counted.watermarks = conversations
                .iter()
                .map(|c| (c.id.clone(), c.last_message_at))
                .collect();
            counted.message_ids.clear();
        }
        self.store.seed(conversations);
        Ok(count)
    }

    /// Refresh in the background unless one is already running.
    fn spawn_refresh(&self) {
        if self.refreshing.swap(true, Ordering::SeqCst) {
            return;
        }
        let loader = self.clone();
        tokio::spawn(async move {
            if let Err(e) = loader.refresh().await {
                warn!(error = %e, "conversation list refresh failed");
            }
            loader.refreshing.store(false, Ordering::SeqCst);
        });
    }
}

/// Fields of a pushed message row that move a conversation.
struct Activity {
    message_id: Option<String>,
    conversation_id: String,
    sender_id: String,
    body: Option<String>,
    created_at: DateTime<Utc>,
}

impl Activity {
    fn from_event(event: &ChangeEvent) -> Option<Self> {
        let conversation_id = event.column("conversation_id").and_then(value_text)?;
        let sender_id = event.column("sender_id").and_then(value_text)?;
        let created_at = event
            .column("created_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .or(event.commit_timestamp)
            .unwrap_or_else(Utc::now);
        Some(Self {
            message_id: event.column("id").and_then(value_text),
            conversation_id,
            sender_id,
            body: event.column("body").and_then(value_text),
            created_at,
        })
    }
}

/// Conversation list patched by every new message the user can see.
///
/// A message for a conversation not yet in the list triggers a reload.
/// Each message moves the list once: redelivered events and messages the
/// last reload already covered are ignored.
pub struct ConversationFeed {
    loader: ConversationLoader,
    subscription: ScopedSubscription,
}

impl ConversationFeed {
    #[instrument(skip(ctx))]
    pub async fn open(ctx: FeedContext, user_id: &str) -> Result<Self, FeedError> {
        let loader = ConversationLoader {
            client: Arc::clone(ctx.client()),
            store: ReconcilingStore::new(FeedOrder::NewestFirst),
            user_id: user_id.to_string(),
            refreshing: Arc::new(AtomicBool::new(false)),
            counted: Arc::default(),
        };
        let subscription = ScopedSubscription::open(
            ctx.manager(),
            Scope::new("messages", EventClass::Insert),
            on_message(loader.clone()),
        );

        let count = loader.refresh().await?;
        info!(count, "conversation feed open");
        Ok(Self {
            loader,
            subscription,
        })
    }

    pub async fn refresh(&self) -> Result<(), FeedError> {
        self.loader.refresh().await?;
        Ok(())
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.loader.store.records()
    }

    pub fn get(&self, id: &str) -> Option<Conversation> {
        self.loader.store.get(id)
    }

    /// Sum of unread counts across the list.
    pub fn total_unread(&self) -> i64 {
        self.loader
            .store
            .snapshot()
            .records()
            .iter()
            .map(|c| c.unread_count)
            .sum()
    }

    /// Zero the local unread count of a conversation the user is viewing.
    pub fn mark_seen(&self, id: &str) -> bool {
        self.loader.store.modify(id, |c| c.unread_count = 0)
    }

    pub fn subscribe(&self) -> watch::Receiver<FeedSnapshot<Conversation>> {
        self.loader.store.subscribe()
    }

    pub fn store(&self) -> &ReconcilingStore<Conversation> {
        &self.loader.store
    }

    pub fn health(&self) -> watch::Receiver<FeedHealth> {
        self.subscription.health()
    }

    pub fn is_degraded(&self) -> bool {
        self.health().borrow().is_degraded()
    }
}

fn on_message(loader: ConversationLoader) -> EventCallback {
    Arc::new(move |event: ChangeEvent| {
        let Some(activity) = Activity::from_event(&event) else {
            debug!("message event without conversation, ignoring");
            return;
        };
        if !lock(&loader.counted).admit(&activity) {
            debug!(conversation = %activity.conversation_id, "message already counted, ignoring");
            return;
        }
        let user_id = loader.user_id.clone();
        let known = loader.store.modify(&activity.conversation_id, |c| {
            if activity.created_at >= c.last_message_at {
                c.last_message = activity.body.clone();
                c.last_message_at = activity.created_at;
            }
            if activity.sender_id != user_id {
                c.unread_count += 1;
            }
        });
        if !known {
            debug!(conversation = %activity.conversation_id, "unknown conversation, reloading");
            loader.spawn_refresh();
        }
    })
}
