//! User-visible failure notices.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bazaar_client::ErrorClass;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::info;

/// One failure shown to the user.
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub id: u64,
    /// Action that failed ("send message", "like post").
    pub action: String,
    pub class: ErrorClass,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Bounded list of notices, newest last. Oldest notices fall off once full.
#[derive(Clone)]
pub struct NoticeBoard {
    notices: Arc<watch::Sender<Vec<Notice>>>,
    next_id: Arc<AtomicU64>,
    capacity: usize,
}

impl NoticeBoard {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = watch::channel(Vec::new());
        Self {
            notices: Arc::new(tx),
            next_id: Arc::new(AtomicU64::new(0)),
            capacity: capacity.max(1),
        }
    }

    /// Record a notice and return its id.
    pub fn post(&self, action: &str, class: ErrorClass, message: impl Into<String>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let notice = Notice {
            id,
            action: action.to_string(),
            class,
            message: message.into(),
            at: Utc::now(),
        };
        info!(id, action = %notice.action, class = %class, message = %notice.message, "failure notice");

        let capacity = self.capacity;
        self.notices.send_modify(|notices| {
            notices.push(notice);
            if notices.len() > capacity {
                let overflow = notices.len() - capacity;
                notices.drain(..overflow);
            }
        });
        id
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.notices.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.notices.borrow().is_empty()
    }

    /// Remove a notice. Returns false if it was already gone.
    pub fn dismiss(&self, id: u64) -> bool {
        self.notices.send_if_modified(|notices| {
            let before = notices.len();
            notices.retain(|n| n.id != id);
            notices.len() != before
        })
    }

    pub fn clear(&self) {
        self.notices.send_if_modified(|notices| {
            let had_any = !notices.is_empty();
            notices.clear();
            had_any
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Notice>> {
        self.notices.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_and_dismiss() {
        let board = NoticeBoard::new(5);
        let id = board.post("send message", ErrorClass::AuthorizationDenied, "not allowed");
        assert_eq!(board.len(), 1);
        assert_eq!(board.notices()[0].action, "send message");

        assert!(board.dismiss(id));
        assert!(!board.dismiss(id));
        assert!(board.is_empty());
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let board = NoticeBoard::new(2);
        board.post("a", ErrorClass::TransientNetworkFailure, "1");
        board.post("b", ErrorClass::TransientNetworkFailure, "2");
        board.post("c", ErrorClass::TransientNetworkFailure, "3");

        let actions: Vec<String> = board.notices().into_iter().map(|n| n.action).collect();
        assert_eq!(actions, vec!["b", "c"]);
    }
}
