//! Cursor pagination state shared by the paged feeds.
//!
//! Older pages are requested by keyset, never by offset: rows strictly
//! before the oldest loaded `(timestamp, id)` pair. Concurrent inserts cannot
//! shift a page and rows sharing the boundary timestamp are not skipped.

use bazaar_client::{Filter, Order, Select};
use bazaar_sync::{KEY_COLUMN, Record};
use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// Keyset position of the oldest loaded row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Cursor {
    pub(crate) at: DateTime<Utc>,
    pub(crate) id: String,
}

impl Cursor {
    /// The smallest `(timestamp, id)` among `records`.
    pub(crate) fn oldest<'a, R: Record>(records: impl IntoIterator<Item = &'a R>) -> Option<Self> {
        records
            .into_iter()
            .min_by(|a, b| {
                a.timestamp()
                    .cmp(&b.timestamp())
                    .then_with(|| a.id().cmp(b.id()))
            })
            .map(|r| Cursor {
                at: r.timestamp(),
                id: r.id().to_string(),
            })
    }
}

/// Load state of a paged feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageState {
    /// Initial page in flight.
    pub loading: bool,
    /// Older page in flight.
    pub loading_older: bool,
    /// Whether an older page may exist. Cleared by the first short page.
    pub has_more_older: bool,
}

pub(crate) struct Pager {
    state: watch::Sender<PageState>,
    column: &'static str,
    page_size: usize,
}

impl Pager {
    pub(crate) fn new(column: &'static str, page_size: usize) -> Self {
        let (state, _) = watch::channel(PageState::default());
        Self {
            state,
            column,
            page_size,
        }
    }

    pub(crate) fn state(&self) -> PageState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<PageState> {
        self.state.subscribe()
    }

    pub(crate) fn reset(&self) {
        self.state.send_replace(PageState::default());
    }

    /// The newest page of `base`.
    pub(crate) fn first_page(&self, base: Select) -> Select {
        base.order(Order::desc(self.column))
            .order(Order::desc(KEY_COLUMN))
            .limit(self.page_size)
    }

    /// The page of `base` just before `cursor`.
    pub(crate) fn page_before(&self, base: Select, cursor: Option<Cursor>) -> Select {
        let query = match cursor {
            Some(cursor) => {
                let at = cursor.at.to_rfc3339();
                base.any_of(vec![
                    vec![Filter::lt(self.column, &at)],
                    vec![Filter::eq(self.column, &at), Filter::lt(KEY_COLUMN, &cursor.id)],
                ])
            }
            None => base,
        };
        self.first_page(query)
    }

    pub(crate) fn begin_initial(&self) {
        self.state.send_replace(PageState {
            loading: true,
            loading_older: false,
            has_more_older: false,
        });
    }

    /// Record the size of the initial page, or `None` if it failed.
    pub(crate) fn finish_initial(&self, fetched: Option<usize>) {
        let page_size = self.page_size;
        self.state.send_modify(|state| {
            state.loading = false;
            state.has_more_older = fetched.is_some_and(|n| n >= page_size);
        });
    }

    /// Claim the older-page slot. False if a load is running or nothing older exists.
    pub(crate) fn try_begin_older(&self) -> bool {
        self.state.send_if_modified(|state| {
            if state.loading || state.loading_older || !state.has_more_older {
                return false;
            }
            state.loading_older = true;
            true
        })
    }

    /// Record the size of an older page, or `None` if it failed.
    pub(crate) fn finish_older(&self, fetched: Option<usize>) {
        let page_size = self.page_size;
        self.state.send_modify(|state| {
            state.loading_older = false;
            if let Some(n) = fetched {
                state.has_more_older = n >= page_size;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_short_first_page_ends_paging() {
        let pager = Pager::new("created_at", 50);
        pager.begin_initial();
        assert!(pager.state().loading);
        pager.finish_initial(Some(12));
        assert!(!pager.state().has_more_older);
        assert!(!pager.try_begin_older());
    }

    #[test]
    fn test_older_slot_is_exclusive() {
        let pager = Pager::new("created_at", 50);
        pager.begin_initial();
        pager.finish_initial(Some(50));
        assert!(pager.try_begin_older());
        assert!(!pager.try_begin_older());

        pager.finish_older(None);
        // A failed page keeps the door open.
        assert!(pager.state().has_more_older);
        assert!(pager.try_begin_older());
        pager.finish_older(Some(3));
        assert!(!pager.state().has_more_older);
    }

    #[test]
    fn test_page_before_uses_keyset() {
        let pager = Pager::new("created_at", 50);
        let cursor = Cursor {
            at: DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            id: "m10".into(),
        };
        let query = pager.page_before(Select::new("messages"), Some(cursor));

        assert_eq!(query.limit, Some(50));
        assert!(query.filters.is_empty());
        assert_eq!(
            query.any_of,
            vec![
                vec![Filter::lt("created_at", "2024-05-01T10:00:00+00:00")],
                vec![
                    Filter::eq("created_at", "2024-05-01T10:00:00+00:00"),
                    Filter::lt("id", "m10"),
                ],
            ]
        );
        assert_eq!(query.order, vec![Order::desc("created_at"), Order::desc("id")]);
    }
}
