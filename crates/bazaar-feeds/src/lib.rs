//! Domain feeds for Bazaar.
//!
//! Each feed composes one or more subscription scopes, a reconciling store
//! and the feature's own rules:
//!
//! - **Messages**: one conversation at a time, oldest first, with reply
//!   previews and cursor pagination
//! - **Notifications**: newest first, unread count derived from the snapshot
//! - **Likes**: like counts and the user's own like state for a watched set of posts
//! - **Connections**: requests sent and received
//! - **Conversations**: the conversation list ordered by last activity
//! - **Trending**: polled trending posts and suggested users
//! - **Table watcher**: any record type kept live by one caller-chosen scope

mod connections;
mod context;
mod conversations;
mod error;
mod likes;
mod messages;
mod notifications;
mod paging;
pub mod records;
mod trending;
mod watcher;

use std::sync::{Mutex, MutexGuard};

use bazaar_client::ChangeEvent;
use bazaar_sync::{EventCallback, ReconcilingStore, Record};
use tracing::warn;

pub use connections::ConnectionFeed;
pub use context::FeedContext;
pub use conversations::ConversationFeed;
pub use error::FeedError;
pub use likes::LikeFeed;
pub use messages::{MAX_MESSAGE_CHARS, MessageFeed};
pub use notifications::{NotificationFeed, unread_count_of};
pub use paging::PageState;
pub use records::{
    ConnectionRequest, ConnectionStatus, Conversation, Message, Notification, PostLikes, Profile,
    ReplyPreview, SuggestedUser, TrendingPost,
};
pub use trending::{TrendingAggregator, TrendingSnapshot};
pub use watcher::TableWatcher;

const PROVISIONAL_PREFIX: &str = "pending-";

/// Identifier shown for a record until the server assigns one.
pub(crate) fn provisional_id(client_ref: &str) -> String {
    format!("{}{}", PROVISIONAL_PREFIX, client_ref)
}

pub fn is_provisional(id: &str) -> bool {
    id.starts_with(PROVISIONAL_PREFIX)
}

/// Callback merging every pushed event into `store`.
pub(crate) fn merge_into<R: Record>(store: &ReconcilingStore<R>, feed: &'static str) -> EventCallback {
    let store = store.clone();
    std::sync::Arc::new(move |event: ChangeEvent| {
        if let Err(e) = store.apply_pushed(&event) {
            warn!(feed, table = %event.table, error = %e, "failed to merge pushed event");
        }
    })
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
