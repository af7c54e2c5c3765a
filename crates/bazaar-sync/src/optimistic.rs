//! Optimistic mutation coordinator.
//!
//! A mutation is applied to the store first, then its remote command runs
//! under a timeout. The command's result is settled by [`settle`], a pure
//! transition over the entry's state; the coordinator carries the
//! transition out against the store and the notice board.

use std::future::Future;
use std::time::Duration;

use bazaar_client::{ClientError, ErrorClass};
use tracing::{debug, info, instrument, warn};

use crate::{EntryId, EntryState, Mutation, NoticeBoard, Record, ReconcilingStore, SyncConfig, SyncError};

/// How a remote command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandResult {
    Succeeded,
    Failed(ErrorClass),
    TimedOut,
}

/// What settling an entry does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: EntryState,
    /// Class of the notice to record, if one is due.
    pub notice: Option<ErrorClass>,
}

/// Settle an optimistic entry.
///
/// - a pending entry is confirmed on success or conflict, reverted with a
///   notice otherwise (a timeout counts as a transient failure);
/// - an entry a pushed event already confirmed stays confirmed;
/// - a reverted entry stays reverted and never produces a second notice.
pub fn settle(current: EntryState, result: CommandResult) -> Transition {
    match (current, result) {
        (EntryState::Pending, CommandResult::Succeeded)
        | (EntryState::Pending, CommandResult::Failed(ErrorClass::ConflictOrDuplicate)) => {
            Transition {
                next: EntryState::Confirmed,
                notice: None,
            }
        }
        (EntryState::Pending, CommandResult::Failed(class)) => Transition {
            next: EntryState::Reverted,
            notice: Some(class),
        },
        (EntryState::Pending, CommandResult::TimedOut) => Transition {
            next: EntryState::Reverted,
            notice: Some(ErrorClass::TransientNetworkFailure),
        },
        (EntryState::Confirmed, _) => Transition {
            next: EntryState::Confirmed,
            notice: None,
        },
        (EntryState::Reverted, _) => Transition {
            next: EntryState::Reverted,
            notice: None,
        },
    }
}

/// Result of [`OptimisticCoordinator::apply`].
#[derive(Debug, Clone)]
pub enum MutationOutcome<R> {
    /// The mutation stands. `record` is the server's row, when it returned one.
    Confirmed { entry: EntryId, record: Option<R> },
    /// The mutation was undone.
    Reverted {
        entry: EntryId,
        class: ErrorClass,
        notice: Option<u64>,
    },
}

impl<R> MutationOutcome<R> {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, MutationOutcome::Confirmed { .. })
    }

    pub fn entry(&self) -> EntryId {
        match self {
            MutationOutcome::Confirmed { entry, .. } | MutationOutcome::Reverted { entry, .. } => {
                *entry
            }
        }
    }
}

/// Runs optimistic mutations against stores.
#[derive(Clone)]
pub struct OptimisticCoordinator {
    timeout: Duration,
    notices: NoticeBoard,
}

impl OptimisticCoordinator {
    pub fn new(timeout: Duration, notices: NoticeBoard) -> Self {
        Self { timeout, notices }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config.command_timeout(),
            NoticeBoard::new(config.notice_capacity),
        )
    }

    pub fn notices(&self) -> &NoticeBoard {
        &self.notices
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Apply `mutation` locally, then run `command`.
    ///
    /// `command` is not polled until the mutation is in the store. It resolves
    /// to the server's version of the record when there is one. Errors are
    /// returned only when the local mutation itself cannot be applied;
    /// remote failures end in [`MutationOutcome::Reverted`].
    #[instrument(skip(self, store, mutation, command))]
    pub async fn apply<R, F>(
        &self,
        store: &ReconcilingStore<R>,
        mutation: Mutation<R>,
        action: &str,
        command: F,
    ) -> Result<MutationOutcome<R>, SyncError>
    where
        R: Record,
        F: Future<Output = Result<Option<R>, ClientError>>,
    {
        let entry = store.apply_optimistic(mutation)?;
        debug!(entry = %entry, "mutation applied, issuing command");

        let (result, confirmed, message) = match tokio::time::timeout(self.timeout, command).await {
            Ok(Ok(confirmed)) => (CommandResult::Succeeded, confirmed, None),
            Ok(Err(e)) => {
                let class = e.class();
                (CommandResult::Failed(class), None, Some(e.to_string()))
            }
            Err(_) => (
                CommandResult::TimedOut,
                None,
                Some(format!("no response within {:?}", self.timeout)),
            ),
        };

        // The store may have been cleared meanwhile (scope switch); the
        // notice is still owed.
        let current = store
            .snapshot()
            .entry_state(entry)
            .unwrap_or(EntryState::Pending);
        let transition = settle(current, result);

        match transition.next {
            EntryState::Confirmed => {
                if let CommandResult::Failed(class) = result {
                    debug!(entry = %entry, class = %class, "command conflict treated as success");
                }
                ignore_unknown(store.confirm_optimistic(entry, confirmed.clone()))?;
                Ok(MutationOutcome::Confirmed {
                    entry,
                    record: confirmed,
                })
            }
            EntryState::Reverted | EntryState::Pending => {
                ignore_unknown(store.revert_optimistic(entry))?;
                let class = match result {
                    CommandResult::Failed(class) => class,
                    _ => ErrorClass::TransientNetworkFailure,
                };
                let notice = transition.notice.map(|class| {
                    self.notices.post(
                        action,
                        class,
                        message.unwrap_or_else(|| class.to_string()),
                    )
                });
                warn!(entry = %entry, class = %class, "command failed, mutation reverted");
                Ok(MutationOutcome::Reverted {
                    entry,
                    class,
                    notice,
                })
            }
        }
    }
}

fn ignore_unknown(result: Result<(), SyncError>) -> Result<(), SyncError> {
    match result {
        Err(SyncError::UnknownEntry(entry)) => {
            info!(entry = %entry, "entry gone before settlement");
            Ok(())
        }
        other => other,
    }
}
