//! Subscription manager.
//!
//! Owns the registry from [`Scope`] to the one remote change-feed stream
//! serving it. Opening an equal scope shares the stream; the stream is torn
//! down when the last handle closes. Each live scope has a supervisor task
//! that subscribes, delivers events in transport order, and re-subscribes
//! with exponential backoff when the stream is lost.
//!
//! Every registry entry carries a [`Generation`]. Events are delivered only
//! while the entry that produced them is still the registered one, so a
//! closed or superseded subscription never reaches a listener.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use backoff::backoff::Backoff;
use bazaar_client::{ChangeEvent, ChangeFeed, FeedCallback, FeedMessage, Scope};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::RetryPolicy;

/// Callback receiving change events for one handle.
pub type EventCallback = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

/// Instance number of a registered scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(u64);

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Token for one open of a scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    scope: Scope,
    generation: Generation,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }
}

/// Coarse connection status of a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedHealth {
    /// First subscribe in flight.
    Connecting,
    Live,
    /// Stream lost; waiting to retry.
    Reconnecting { attempt: u32 },
    /// Gave up: retries exhausted or the backend refused the subscription.
    Degraded,
    Closed,
}

impl FeedHealth {
    pub fn is_degraded(&self) -> bool {
        matches!(self, FeedHealth::Degraded)
    }
}

/// Result of [`SubscriptionManager::close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Last handle closed; the remote stream is being torn down.
    TornDown,
    /// Other handles still share the stream.
    StillInUse,
    /// Unknown or already-closed handle.
    NotFound,
}

struct Listener {
    id: u64,
    callback: EventCallback,
    /// Open flag, held across each invocation so a close waits out an
    /// in-flight delivery.
    gate: Arc<Mutex<bool>>,
}

struct ScopeEntry {
    generation: Generation,
    listeners: Vec<Listener>,
    shutdown_tx: watch::Sender<bool>,
    health: Arc<watch::Sender<FeedHealth>>,
}

struct ManagerInner {
    feed: Arc<dyn ChangeFeed>,
    retry: RetryPolicy,
    scopes: DashMap<Scope, ScopeEntry>,
    next_generation: AtomicU64,
    next_handle: AtomicU64,
}

/// Registry of live change-feed subscriptions. Clones share the registry.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

impl SubscriptionManager {
    pub fn new(feed: Arc<dyn ChangeFeed>, retry: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                feed,
                retry,
                scopes: DashMap::new(),
                next_generation: AtomicU64::new(0),
                next_handle: AtomicU64::new(0),
            }),
        }
    }

    /// Open `scope`. Never blocks; must be called inside a tokio runtime.
    ///
    /// `on_event` runs on the scope's supervisor task. It must not close its
    /// own handle synchronously.
    pub fn open(&self, scope: Scope, on_event: EventCallback) -> SubscriptionHandle {
        let id = self.inner.next_handle.fetch_add(1, Ordering::SeqCst) + 1;
        let listener = Listener {
            id,
            callback: on_event,
            gate: Arc::new(Mutex::new(true)),
        };

        let spawn = match self.inner.scopes.entry(scope.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.listeners.push(listener);
                debug!(scope = %scope, handle = id, listeners = entry.listeners.len(), "sharing existing stream");
                return SubscriptionHandle {
                    id,
                    scope,
                    generation: entry.generation,
                };
            }
            Entry::Vacant(vacant) => {
                let generation =
                    Generation(self.inner.next_generation.fetch_add(1, Ordering::SeqCst) + 1);
                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                let (health_tx, _) = watch::channel(FeedHealth::Connecting);
                let health = Arc::new(health_tx);
                vacant.insert(ScopeEntry {
                    generation,
                    listeners: vec![listener],
                    shutdown_tx,
                    health: Arc::clone(&health),
                });
                (generation, shutdown_rx, health)
            }
        };

        let (generation, shutdown_rx, health) = spawn;
        info!(scope = %scope, generation = %generation, "opening subscription");
        tokio::spawn(supervise(
            Arc::clone(&self.inner),
            scope.clone(),
            generation,
            shutdown_rx,
            health,
        ));

        SubscriptionHandle {
            id,
            scope,
            generation,
        }
    }

    /// Close one handle. The remote stream goes away with the last one.
    ///
    /// No event reaches this handle's callback once `close` returns.
    pub fn close(&self, handle: &SubscriptionHandle) -> CloseOutcome {
        let (gate, remaining) = {
            let Some(mut entry) = self.inner.scopes.get_mut(&handle.scope) else {
                return CloseOutcome::NotFound;
            };
            if entry.generation != handle.generation {
                return CloseOutcome::NotFound;
            }
            let Some(pos) = entry.listeners.iter().position(|l| l.id == handle.id) else {
                return CloseOutcome::NotFound;
            };
            let listener = entry.listeners.remove(pos);
            (listener.gate, entry.listeners.len())
        };

        *gate.lock().unwrap_or_else(|e| e.into_inner()) = false;

        if remaining > 0 {
            debug!(scope = %handle.scope, remaining, "handle closed, stream still shared");
            return CloseOutcome::StillInUse;
        }

        let removed = self.inner.scopes.remove_if(&handle.scope, |_, entry| {
            entry.generation == handle.generation && entry.listeners.is_empty()
        });
        match removed {
            Some((_, entry)) => {
                entry.shutdown_tx.send_replace(true);
                entry.health.send_replace(FeedHealth::Closed);
                info!(scope = %handle.scope, generation = %handle.generation, "subscription closed");
                CloseOutcome::TornDown
            }
            // Reopened between releasing the listener and removal.
            None => CloseOutcome::StillInUse,
        }
    }

    /// Move a handle to another scope. The old one is closed first.
    ///
    /// Switching to the scope the handle already has keeps the stream and
    /// replaces the callback.
    pub fn switch(
        &self,
        handle: &SubscriptionHandle,
        scope: Scope,
        on_event: EventCallback,
    ) -> SubscriptionHandle {
        if handle.scope == scope
            && let Some(mut entry) = self.inner.scopes.get_mut(&scope)
            && entry.generation == handle.generation
            && let Some(listener) = entry.listeners.iter_mut().find(|l| l.id == handle.id)
        {
            listener.callback = on_event;
            return handle.clone();
        }

        self.close(handle);
        self.open(scope, on_event)
    }

    /// Health of the handle's scope. A closed handle reports [`FeedHealth::Closed`].
    pub fn health(&self, handle: &SubscriptionHandle) -> watch::Receiver<FeedHealth> {
        match self.inner.scopes.get(&handle.scope) {
            Some(entry) if entry.generation == handle.generation => entry.health.subscribe(),
            _ => watch::channel(FeedHealth::Closed).1,
        }
    }

    pub fn is_open(&self, handle: &SubscriptionHandle) -> bool {
        self.inner.scopes.get(&handle.scope).is_some_and(|entry| {
            entry.generation == handle.generation
                && entry.listeners.iter().any(|l| l.id == handle.id)
        })
    }

    /// Number of distinct live scopes.
    pub fn scope_count(&self) -> usize {
        self.inner.scopes.len()
    }

    /// Number of handles sharing `scope`.
    pub fn listener_count(&self, scope: &Scope) -> usize {
        self.inner
            .scopes
            .get(scope)
            .map(|entry| entry.listeners.len())
            .unwrap_or(0)
    }

    /// Close every scope.
    pub fn close_all(&self) {
        let scopes: Vec<Scope> = self.inner.scopes.iter().map(|e| e.key().clone()).collect();
        for scope in scopes {
            if let Some((_, entry)) = self.inner.scopes.remove(&scope) {
                for listener in &entry.listeners {
                    *listener.gate.lock().unwrap_or_else(|e| e.into_inner()) = false;
                }
                entry.shutdown_tx.send_replace(true);
                entry.health.send_replace(FeedHealth::Closed);
            }
        }
        info!("all subscriptions closed");
    }
}

/// Hand an event to every listener of the current generation.
fn deliver(inner: &ManagerInner, scope: &Scope, generation: Generation, event: &ChangeEvent) {
    let listeners: Vec<(EventCallback, Arc<Mutex<bool>>)> = match inner.scopes.get(scope) {
        Some(entry) if entry.generation == generation => entry
            .listeners
            .iter()
            .map(|l| (Arc::clone(&l.callback), Arc::clone(&l.gate)))
            .collect(),
        _ => {
            trace!(scope = %scope, generation = %generation, "dropping stale event");
            return;
        }
    };

    for (callback, gate) in listeners {
        let open = gate.lock().unwrap_or_else(|e| e.into_inner());
        if *open {
            callback(event.clone());
        }
    }
}

#[instrument(skip_all, fields(scope = %scope, generation = %generation))]
async fn supervise(
    inner: Arc<ManagerInner>,
    scope: Scope,
    generation: Generation,
    mut shutdown_rx: watch::Receiver<bool>,
    health: Arc<watch::Sender<FeedHealth>>,
) {
    let mut backoff = inner.retry.backoff();
    let mut failures: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback: FeedCallback = Arc::new(move |msg| {
            let _ = tx.send(msg);
        });

        // Not raced against shutdown: a confirmation that lands after close
        // still has to be unsubscribed.
        match inner.feed.subscribe(&scope, callback).await {
            Ok(remote) => {
                if *shutdown_rx.borrow() {
                    debug!("closed while subscribing, discarding confirmation");
                    if let Err(e) = inner.feed.unsubscribe(remote).await {
                        warn!(error = %e, "failed to release late subscription");
                    }
                    return;
                }

                health.send_replace(FeedHealth::Live);
                info!("subscription live");
                failures = 0;
                backoff.reset();

                let lost = loop {
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => break None,
                        msg = rx.recv() => match msg {
                            Some(FeedMessage::Change(event)) => {
                                deliver(&inner, &scope, generation, &event);
                            }
                            Some(FeedMessage::Disconnected { reason }) => break Some(reason),
                            None => break Some("feed dropped the stream".to_string()),
                        },
                    }
                };

                if let Err(e) = inner.feed.unsubscribe(remote).await {
                    debug!(error = %e, "unsubscribe failed");
                }
                match lost {
                    None => {
                        debug!("supervisor stopped");
                        return;
                    }
                    Some(reason) => warn!(reason = %reason, "subscription lost"),
                }
            }
            Err(e) if !e.is_transient() => {
                error!(error = %e, class = %e.class(), "subscription refused");
                health.send_replace(FeedHealth::Degraded);
                return;
            }
            Err(e) => warn!(error = %e, "subscribe failed"),
        }

        failures += 1;
        if failures > inner.retry.max_attempts {
            error!(attempts = failures - 1, "retries exhausted, scope degraded");
            health.send_replace(FeedHealth::Degraded);
            return;
        }

        health.send_replace(FeedHealth::Reconnecting { attempt: failures });
        let wait = backoff
            .next_backoff()
            .unwrap_or_else(|| inner.retry.max_interval());
        debug!(attempt = failures, wait_ms = wait.as_millis() as u64, "retrying subscription");

        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => return,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

/// Handle that closes itself when dropped.
pub struct ScopedSubscription {
    manager: SubscriptionManager,
    handle: Option<SubscriptionHandle>,
}

impl ScopedSubscription {
    pub fn open(manager: &SubscriptionManager, scope: Scope, on_event: EventCallback) -> Self {
        let handle = manager.open(scope, on_event);
        Self {
            manager: manager.clone(),
            handle: Some(handle),
        }
    }

    /// A guard holding nothing, for feeds that have not picked a scope yet.
    pub fn idle(manager: &SubscriptionManager) -> Self {
        Self {
            manager: manager.clone(),
            handle: None,
        }
    }

    pub fn handle(&self) -> Option<&SubscriptionHandle> {
        self.handle.as_ref()
    }

    pub fn scope(&self) -> Option<&Scope> {
        self.handle.as_ref().map(|h| h.scope())
    }

    /// Re-point this guard at `scope`, closing the previous one first.
    pub fn switch(&mut self, scope: Scope, on_event: EventCallback) -> &SubscriptionHandle {
        let handle = match self.handle.take() {
            Some(old) => self.manager.switch(&old, scope, on_event),
            None => self.manager.open(scope, on_event),
        };
        self.handle.insert(handle)
    }

    pub fn close(&mut self) -> CloseOutcome {
        match self.handle.take() {
            Some(handle) => self.manager.close(&handle),
            None => CloseOutcome::NotFound,
        }
    }

    pub fn health(&self) -> watch::Receiver<FeedHealth> {
        match &self.handle {
            Some(handle) => self.manager.health(handle),
            None => watch::channel(FeedHealth::Closed).1,
        }
    }
}

impl Drop for ScopedSubscription {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.manager.close(&handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bazaar_client::{EventClass, Filter, MemoryBackend};

    fn manager(backend: &MemoryBackend) -> SubscriptionManager {
        SubscriptionManager::new(Arc::new(backend.clone()), RetryPolicy::default())
    }

    fn noop() -> EventCallback {
        Arc::new(|_| {})
    }

    #[tokio::test]
    async fn test_close_unknown_handle_is_noop() {
        let backend = MemoryBackend::new();
        let manager = manager(&backend);
        let scope = Scope::new("posts", EventClass::Update);

        let handle = manager.open(scope, noop());
        assert_eq!(manager.close(&handle), CloseOutcome::TornDown);
        assert_eq!(manager.close(&handle), CloseOutcome::NotFound);
        assert_eq!(manager.scope_count(), 0);
    }

    #[tokio::test]
    async fn test_switch_to_equal_scope_keeps_handle() {
        let backend = MemoryBackend::new();
        let manager = manager(&backend);
        let scope = Scope::new("messages", EventClass::Insert).with_filter(Filter::eq("c", 1));

        let handle = manager.open(scope.clone(), noop());
        let same = manager.switch(&handle, scope, noop());
        assert_eq!(handle, same);
        assert!(manager.is_open(&same));
    }

    #[tokio::test]
    async fn test_health_of_closed_handle() {
        let backend = MemoryBackend::new();
        let manager = manager(&backend);
        let handle = manager.open(Scope::new("posts", EventClass::Update), noop());
        manager.close(&handle);
        assert_eq!(*manager.health(&handle).borrow(), FeedHealth::Closed);
    }

    #[tokio::test]
    async fn test_scoped_subscription_closes_on_drop() {
        let backend = MemoryBackend::new();
        let manager = manager(&backend);
        {
            let guard = ScopedSubscription::open(&manager, Scope::new("posts", EventClass::Update), noop());
            assert!(guard.handle().is_some());
            assert_eq!(manager.scope_count(), 1);
        }
        assert_eq!(manager.scope_count(), 0);
    }

    #[tokio::test]
    async fn test_reopen_gets_new_generation() {
        let backend = MemoryBackend::new();
        let manager = manager(&backend);
        let scope = Scope::new("posts", EventClass::Update);

        let first = manager.open(scope.clone(), noop());
        manager.close(&first);
        let second = manager.open(scope, noop());
        assert!(second.generation() > first.generation());
        assert!(!manager.is_open(&first));
        assert_eq!(manager.close(&first), CloseOutcome::NotFound);
    }
}
