//! Realtime sync layer for Bazaar.
//!
//! - **Subscription manager**: one shared change-feed stream per scope, with
//!   generation-tagged delivery and backoff re-subscription
//! - **Reconciling store**: ordered, duplicate-free records merged from
//!   fetches, optimistic mutations and pushed events
//! - **Optimistic coordinator**: apply locally, run the command, keep or revert
//! - **Notice board**: user-visible failure notices

mod config;
mod error;
pub mod notice;
pub mod optimistic;
pub mod store;
pub mod subscription;

pub use config::{RetryPolicy, SyncConfig};
pub use error::SyncError;
pub use notice::{Notice, NoticeBoard};
pub use optimistic::{CommandResult, MutationOutcome, OptimisticCoordinator, Transition, settle};
pub use store::{
    EntryId, EntryState, FeedOrder, FeedSnapshot, KEY_COLUMN, Mutation, ReconcilingStore, Record,
    decode_row, merge_fields,
};
pub use subscription::{
    CloseOutcome, EventCallback, FeedHealth, Generation, ScopedSubscription, SubscriptionHandle,
    SubscriptionManager,
};
