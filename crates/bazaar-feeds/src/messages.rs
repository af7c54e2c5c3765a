//! Conversation-scoped chat feed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bazaar_client::{ChangeEvent, ClientError, EventClass, Filter, QueryClient, Row, Scope, Select};
use bazaar_sync::{
    EventCallback, FeedHealth, FeedOrder, FeedSnapshot, Mutation, MutationOutcome,
    ReconcilingStore, ScopedSubscription, decode_row,
};
use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::paging::{Cursor, PageState, Pager};
use crate::records::{Message, ReplyPreview};
use crate::{FeedContext, FeedError, is_provisional, lock, provisional_id};

/// Longest message body accepted.
pub const MAX_MESSAGE_CHARS: usize = 4000;

const TABLE: &str = "messages";
const COLUMNS: &str = "*, sender:profiles!sender_id(id, display_name, avatar_url)";

fn thread_scope(conversation_id: &str) -> Scope {
    Scope::new(TABLE, EventClass::All).with_filter(Filter::eq("conversation_id", conversation_id))
}

fn validate_body(body: &str) -> Result<String, FeedError> {
    let body = body.trim();
    if body.is_empty() {
        return Err(FeedError::Validation("message is empty".into()));
    }
    let chars = body.chars().count();
    if chars > MAX_MESSAGE_CHARS {
        return Err(FeedError::Validation(format!(
            "message is {} characters, limit is {}",
            chars, MAX_MESSAGE_CHARS
        )));
    }
    Ok(body.to_string())
}

/// Fills reply previews, fetching referenced messages the store does not hold.
#[derive(Clone)]
struct ReplyResolver {
    client: Arc<dyn QueryClient>,
    store: ReconcilingStore<Message>,
}

impl ReplyResolver {
    async fn resolve(&self) {
        let waiting: Vec<Message> = self
            .store
            .records()
            .into_iter()
            .filter(Message::needs_reply_preview)
            .collect();
        if waiting.is_empty() {
            return;
        }

        let mut previews: HashMap<String, ReplyPreview> = HashMap::new();
        let mut unknown = Vec::new();
        for target in waiting.iter().filter_map(|m| m.reply_to_id.as_deref()) {
            match self.store.get(target) {
                Some(known) => {
                    previews.insert(target.to_string(), known.preview());
                }
                None => unknown.push(target.to_string()),
            }
        }

        if !unknown.is_empty() {
            let query = Select::new(TABLE).filter(Filter::in_list("id", &unknown));
            match self.client.select(&query).await {
                Ok(rows) => {
                    for row in rows {
                        match decode_row::<Message>(&row) {
                            Ok(message) => {
                                previews.insert(message.id.clone(), message.preview());
                            }
                            Err(e) => warn!(error = %e, "undecodable reply target"),
                        }
                    }
                }
                Err(e) => warn!(error = %e, count = unknown.len(), "failed to fetch reply targets"),
            }
        }

        for message in waiting {
            let Some(preview) = message.reply_to_id.as_ref().and_then(|id| previews.get(id)) else {
                continue;
            };
            self.store.modify(&message.id, |m| m.reply_to = Some(preview.clone()));
        }
    }
}

/// Chat feed for one conversation at a time, oldest message first.
pub struct MessageFeed {
    ctx: FeedContext,
    user_id: String,
    store: ReconcilingStore<Message>,
    subscription: Mutex<ScopedSubscription>,
    conversation: watch::Sender<Option<String>>,
    pager: Pager,
    /// Bumped on every conversation switch; results fetched for an older
    /// epoch are discarded.
    epoch: AtomicU64,
}

impl MessageFeed {
    pub fn new(ctx: FeedContext, user_id: impl Into<String>) -> Self {
        let subscription = Mutex::new(ScopedSubscription::idle(ctx.manager()));
        let pager = Pager::new("created_at", ctx.page_size());
        let (conversation, _) = watch::channel(None);
        Self {
            ctx,
            user_id: user_id.into(),
            store: ReconcilingStore::new(FeedOrder::OldestFirst),
            subscription,
            conversation,
            pager,
            epoch: AtomicU64::new(0),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn conversation_id(&self) -> Option<String> {
        self.conversation.borrow().clone()
    }

    pub fn watch_conversation(&self) -> watch::Receiver<Option<String>> {
        self.conversation.subscribe()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.store.records()
    }

    pub fn snapshot(&self) -> FeedSnapshot<Message> {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<FeedSnapshot<Message>> {
        self.store.subscribe()
    }

    pub fn store(&self) -> &ReconcilingStore<Message> {
        &self.store
    }

    pub fn page_state(&self) -> PageState {
        self.pager.state()
    }

    pub fn watch_page_state(&self) -> watch::Receiver<PageState> {
        self.pager.subscribe()
    }

    pub fn health(&self) -> watch::Receiver<FeedHealth> {
        lock(&self.subscription).health()
    }

    pub fn is_degraded(&self) -> bool {
        self.health().borrow().is_degraded()
    }

    fn resolver(&self) -> ReplyResolver {
        ReplyResolver {
            client: Arc::clone(self.ctx.client()),
            store: self.store.clone(),
        }
    }

    fn on_event(&self) -> EventCallback {
        let store = self.store.clone();
        let resolver = self.resolver();
        Arc::new(move |event: ChangeEvent| {
            if let Err(e) = store.apply_pushed(&event) {
                warn!(error = %e, "failed to merge pushed message");
                return;
            }
            let has_reply = event
                .column("reply_to_id")
                .is_some_and(|value| !value.is_null());
            if event.event == EventClass::Insert && has_reply {
                let resolver = resolver.clone();
                tokio::spawn(async move { resolver.resolve().await });
            }
        })
    }

    /// Show `conversation_id`, replacing whatever was open.
    pub async fn open_conversation(&self, conversation_id: &str) -> Result<(), FeedError> {
        self.switch_conversation(conversation_id).await
    }

    /// Move the feed to another conversation.
    ///
    /// The previous conversation's subscription is closed before the store is
    /// cleared and the new one opened, so none of its events land afterwards.
    #[instrument(skip(self), fields(user = %self.user_id))]
    pub async fn switch_conversation(&self, conversation_id: &str) -> Result<(), FeedError> {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut subscription = lock(&self.subscription);
            subscription.close();
            self.store.clear();
            self.pager.begin_initial();
            self.conversation.send_replace(Some(conversation_id.to_string()));
            subscription.switch(thread_scope(conversation_id), self.on_event());
        }
        info!(conversation = %conversation_id, "conversation opened");

        let query = self.pager.first_page(
            Select::new(TABLE)
                .columns(COLUMNS)
                .filter(Filter::eq("conversation_id", conversation_id)),
        );
        let result = self.ctx.fetch::<Message>(&query).await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!(conversation = %conversation_id, "conversation switched during load, discarding page");
            return Ok(());
        }

        let page = match result {
            Ok(page) => page,
            Err(e) => {
                self.pager.finish_initial(None);
                return Err(e);
            }
        };
        let fetched = page.len();
        // Pushed messages may have arrived while the page was in flight.
        self.store.merge_fetched(page);
        self.pager.finish_initial(Some(fetched));
        debug!(fetched, "initial page loaded");

        self.resolver().resolve().await;
        Ok(())
    }

    /// Close the conversation and drop its messages.
    pub fn close(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        lock(&self.subscription).close();
        self.store.clear();
        self.pager.reset();
        self.conversation.send_replace(None);
    }

    /// Fetch the page before the oldest loaded message. Returns how many
    /// messages were added; zero without a request once no older page exists.
    #[instrument(skip(self))]
    pub async fn load_older(&self) -> Result<usize, FeedError> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let conversation_id = self.conversation_id().ok_or(FeedError::NoConversation)?;
        if !self.pager.try_begin_older() {
            debug!("no older page to load");
            return Ok(0);
        }

        let cursor = self.oldest_confirmed();
        let query = self.pager.page_before(
            Select::new(TABLE)
                .columns(COLUMNS)
                .filter(Filter::eq("conversation_id", &conversation_id)),
            cursor,
        );
        let result = self.ctx.fetch::<Message>(&query).await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return Ok(0);
        }

        match result {
            Ok(page) => {
                let fetched = page.len();
                let added = self.store.append_older(page);
                self.pager.finish_older(Some(fetched));
                debug!(fetched, added, "older page loaded");
                self.resolver().resolve().await;
                Ok(added)
            }
            Err(e) => {
                self.pager.finish_older(None);
                Err(e)
            }
        }
    }

    fn oldest_confirmed(&self) -> Option<Cursor> {
        Cursor::oldest(
            self.store
                .snapshot()
                .records()
                .iter()
                .filter(|m| !is_provisional(&m.id)),
        )
    }

    /// Send a message to the open conversation.
    ///
    /// The message shows up immediately under a provisional identifier and
    /// is replaced in place by the stored row.
    #[instrument(skip(self, body))]
    pub async fn send(
        &self,
        body: &str,
        reply_to_id: Option<&str>,
    ) -> Result<MutationOutcome<Message>, FeedError> {
        let body = validate_body(body)?;
        let conversation_id = self.conversation_id().ok_or(FeedError::NoConversation)?;
        let client_ref = Uuid::new_v4().to_string();

        let provisional = Message {
            id: provisional_id(&client_ref),
            conversation_id: conversation_id.clone(),
            sender_id: self.user_id.clone(),
            body: body.clone(),
            created_at: Utc::now(),
            read_at: None,
            reply_to_id: reply_to_id.map(str::to_string),
            client_ref: Some(client_ref.clone()),
            sender: None,
            reply_to: reply_to_id
                .and_then(|id| self.store.get(id))
                .map(|m| m.preview()),
        };

        let mut row = Row::new();
        row.insert("conversation_id".into(), json!(conversation_id));
        row.insert("sender_id".into(), json!(self.user_id));
        row.insert("body".into(), json!(body));
        row.insert("reply_to_id".into(), json!(reply_to_id));
        row.insert("client_ref".into(), json!(client_ref));

        let client = Arc::clone(self.ctx.client());
        let command = async move {
            let stored = client.insert(TABLE, row).await?;
            let message: Message = serde_json::from_value(Value::Object(stored))?;
            Ok::<_, ClientError>(Some(message))
        };

        let outcome = self
            .ctx
            .coordinator()
            .apply(&self.store, Mutation::Insert(provisional), "send message", command)
            .await?;
        Ok(outcome)
    }

    /// Mark every message from the other side as read.
    ///
    /// Returns `None` when nothing was unread.
    #[instrument(skip(self))]
    pub async fn mark_read(&self) -> Result<Option<MutationOutcome<Message>>, FeedError> {
        let conversation_id = self.conversation_id().ok_or(FeedError::NoConversation)?;
        let unread: Vec<String> = self
            .store
            .records()
            .into_iter()
            .filter(|m| m.sender_id != self.user_id && !m.is_read() && !is_provisional(&m.id))
            .map(|m| m.id)
            .collect();
        if unread.is_empty() {
            return Ok(None);
        }

        let mut patch = Row::new();
        patch.insert("read_at".into(), json!(Utc::now()));
        let filters = vec![
            Filter::eq("conversation_id", &conversation_id),
            Filter::neq("sender_id", &self.user_id),
            Filter::is_null("read_at"),
        ];

        let client = Arc::clone(self.ctx.client());
        let remote_patch = patch.clone();
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
                "mark messages read",
                command,
            )
            .await?;
        Ok(Some(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("hello", true ; "plain")]
    #[test_case("   ", false ; "blank")]
    #[test_case("", false ; "empty")]
    fn test_validate_body(body: &str, ok: bool) {
        assert_eq!(validate_body(body).is_ok(), ok);
    }

    #[test]
    fn test_validate_body_length_counts_chars() {
        let exact = "é".repeat(MAX_MESSAGE_CHARS);
        assert!(validate_body(&exact).is_ok());
        let over = "é".repeat(MAX_MESSAGE_CHARS + 1);
        assert!(matches!(validate_body(&over), Err(FeedError::Validation(_))));
    }

    #[test]
    fn test_validate_body_trims() {
        assert_eq!(validate_body("  hi \n").unwrap(), "hi");
    }

    #[test]
    fn test_thread_scope_equality() {
        assert_eq!(thread_scope("c1"), thread_scope("c1"));
        assert_ne!(thread_scope("c1"), thread_scope("c2"));
    }
}
