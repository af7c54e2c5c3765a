//! Reconciling list store.
//!
//! Holds one ordered, duplicate-free list of records and merges three
//! sources into it: fetched pages, local optimistic mutations and pushed
//! change events. Every operation is a synchronous reducer over the current
//! [`FeedSnapshot`] published through a `watch` channel, so readers only ever
//! observe whole merges.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bazaar_client::{ChangeEvent, EventClass, Row, value_text};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, trace, warn};

use crate::SyncError;

/// Column holding a row's identifier.
pub const KEY_COLUMN: &str = "id";

/// A domain row with a stable identifier.
pub trait Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn id(&self) -> &str;

    /// Ordering timestamp (creation or last activity).
    fn timestamp(&self) -> DateTime<Utc>;

    /// Provisional identifier echoed back by the server, if the record carries one.
    fn correlation(&self) -> Option<&str> {
        None
    }
}

/// Declared order of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOrder {
    /// Ascending by timestamp (chat threads).
    OldestFirst,
    /// Descending by timestamp (notifications, conversation lists).
    NewestFirst,
}

/// Identifier of one optimistic mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Settlement state of an optimistic entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Pending,
    Confirmed,
    Reverted,
}

/// A local change applied ahead of its remote command.
#[derive(Debug, Clone)]
pub enum Mutation<R> {
    /// Add a provisional record.
    Insert(R),
    /// Overwrite some fields of one record.
    Patch { id: String, patch: Row },
    /// Overwrite the same fields on several records.
    PatchMany { ids: Vec<String>, patch: Row },
    /// Remove one record.
    Remove { id: String },
}

impl<R: Record> Mutation<R> {
    pub fn patch(id: impl Into<String>, patch: Row) -> Self {
        Mutation::Patch {
            id: id.into(),
            patch,
        }
    }

    pub fn remove(id: impl Into<String>) -> Self {
        Mutation::Remove { id: id.into() }
    }
}

/// Previous values of the fields a patch touched on one record.
#[derive(Debug, Clone)]
struct FieldRestore {
    id: String,
    patch: Row,
    previous: Row,
    absent: Vec<String>,
}

#[derive(Debug, Clone)]
enum Undo<R> {
    RemoveInserted { id: String },
    RestoreFields(Vec<FieldRestore>),
    Reinsert(R),
}

#[derive(Debug, Clone)]
struct Entry<R> {
    state: EntryState,
    undo: Undo<R>,
    /// Correlation reference of an optimistic insert.
    correlation: Option<String>,
}

/// Published state of a store.
#[derive(Debug, Clone)]
pub struct FeedSnapshot<R> {
    records: Vec<R>,
    entries: HashMap<EntryId, Entry<R>>,
    version: u64,
}

impl<R: Record> FeedSnapshot<R> {
    fn empty() -> Self {
        Self {
            records: Vec::new(),
            entries: HashMap::new(),
            version: 0,
        }
    }

    /// Records in declared order.
    pub fn records(&self) -> &[R] {
        &self.records
    }

    pub fn get(&self, id: &str) -> Option<&R> {
        self.records.iter().find(|r| r.id() == id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Incremented on every published change.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether a record has an unsettled optimistic mutation.
    pub fn is_pending(&self, id: &str) -> bool {
        self.entries
            .values()
            .filter(|e| e.state == EntryState::Pending)
            .any(|e| e.touches(id))
    }

    /// Number of unsettled optimistic mutations.
    pub fn pending_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.state == EntryState::Pending)
            .count()
    }

    /// State of an optimistic entry that has not been settled yet.
    pub fn entry_state(&self, entry: EntryId) -> Option<EntryState> {
        self.entries.get(&entry).map(|e| e.state)
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.records.iter().position(|r| r.id() == id)
    }

    fn sort(&mut self, order: FeedOrder) {
        self.records.sort_by(|a, b| {
            let by_time = match order {
                FeedOrder::OldestFirst => a.timestamp().cmp(&b.timestamp()),
                FeedOrder::NewestFirst => b.timestamp().cmp(&a.timestamp()),
            };
            by_time.then_with(|| a.id().cmp(b.id()))
        });
    }

    fn upsert(&mut self, record: R) {
        match self.position(record.id()) {
            Some(pos) => self.records[pos] = record,
            None => self.records.push(record),
        }
    }

    fn remove(&mut self, id: &str) -> Option<R> {
        self.position(id).map(|pos| self.records.remove(pos))
    }

    fn touch(&mut self, order: FeedOrder) {
        self.sort(order);
        self.version += 1;
    }
}

impl<R> Entry<R> {
    fn touches(&self, id: &str) -> bool {
        match &self.undo {
            Undo::RemoveInserted { id: inserted } => inserted == id,
            Undo::RestoreFields(fields) => fields.iter().any(|f| f.id == id),
            Undo::Reinsert(_) => false,
        }
    }
}

/// Shallow-merge `patch` into `record`. Fields the patch does not mention survive.
pub fn merge_fields<R: Record>(record: &R, patch: &Row) -> Result<R, SyncError> {
    let mut value = serde_json::to_value(record)?;
    if let Value::Object(map) = &mut value {
        for (key, field) in patch {
            map.insert(key.clone(), field.clone());
        }
    }
    Ok(serde_json::from_value(value)?)
}

/// Decode a full row into a record.
pub fn decode_row<R: Record>(row: &Row) -> Result<R, SyncError> {
    Ok(serde_json::from_value(Value::Object(row.clone()))?)
}

fn to_row<R: Record>(record: &R) -> Result<Row, SyncError> {
    match serde_json::to_value(record)? {
        Value::Object(row) => Ok(row),
        _ => Ok(Row::new()),
    }
}

fn row_key(row: &Row) -> Option<String> {
    row.get(KEY_COLUMN).and_then(value_text)
}

/// Ordered, reconciling list of records of one kind.
pub struct ReconcilingStore<R: Record> {
    state: Arc<watch::Sender<FeedSnapshot<R>>>,
    order: FeedOrder,
    next_entry: Arc<AtomicU64>,
}

impl<R: Record> Clone for ReconcilingStore<R> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            order: self.order,
            next_entry: Arc::clone(&self.next_entry),
        }
    }
}

impl<R: Record> ReconcilingStore<R> {
    pub fn new(order: FeedOrder) -> Self {
        let (tx, _rx) = watch::channel(FeedSnapshot::empty());
        Self {
            state: Arc::new(tx),
            order,
            next_entry: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn order(&self) -> FeedOrder {
        self.order
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> FeedSnapshot<R> {
        self.state.borrow().clone()
    }

    /// Records in declared order.
    pub fn records(&self) -> Vec<R> {
        self.state.borrow().records.clone()
    }

    pub fn get(&self, id: &str) -> Option<R> {
        self.state.borrow().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.borrow().position(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.state.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().is_empty()
    }

    /// Receiver notified after every published merge.
    pub fn subscribe(&self) -> watch::Receiver<FeedSnapshot<R>> {
        self.state.subscribe()
    }

    /// Snapshots as a stream, starting with the current one.
    pub fn stream(&self) -> WatchStream<FeedSnapshot<R>> {
        WatchStream::new(self.state.subscribe())
    }

    /// Replace the contents with a fetched set.
    ///
    /// Unsettled mutations are laid back over the fetched records: pending
    /// inserts keep their provisional record, pending patches are re-merged
    /// and pending removals stay removed. Undo state is recaptured from the
    /// fetched rows, so a later revert restores the server's values.
    pub fn seed(&self, records: Vec<R>) {
        let order = self.order;
        self.state.send_modify(|state| {
            let provisional: Vec<R> = state
                .entries
                .values()
                .filter(|e| e.state == EntryState::Pending)
                .filter_map(|e| match &e.undo {
                    Undo::RemoveInserted { id } => state.get(id).cloned(),
                    _ => None,
                })
                .collect();

            state.records.clear();
            for record in records {
                state.upsert(record);
            }
            for record in provisional {
                if state.position(record.id()).is_none() {
                    state.records.push(record);
                }
            }
            reapply_pending(state);
            state.touch(order);
            debug!(count = state.records.len(), "store seeded");
        });
    }

    /// Merge a fetched page: add new records, replace known ones with the full fetched version.
    pub fn merge_fetched(&self, records: Vec<R>) {
        if records.is_empty() {
            return;
        }
        let order = self.order;
        self.state.send_modify(|state| {
            for record in records {
                state.upsert(record);
            }
            state.touch(order);
        });
    }

    /// Merge an older page. Known identifiers are left untouched. Returns how many were added.
    pub fn append_older(&self, records: Vec<R>) -> usize {
        let order = self.order;
        let mut added = 0;
        self.state.send_if_modified(|state| {
            for record in records {
                if state.position(record.id()).is_none() {
                    state.records.push(record);
                    added += 1;
                }
            }
            if added > 0 {
                state.touch(order);
            }
            added > 0
        });
        added
    }

    /// Drop every record and optimistic entry.
    pub fn clear(&self) {
        self.state.send_modify(|state| {
            state.records.clear();
            state.entries.clear();
            state.version += 1;
        });
    }

    /// Apply `f` to one record in place. Returns false if the record is unknown.
    pub fn modify(&self, id: &str, f: impl FnOnce(&mut R)) -> bool {
        let order = self.order;
        self.state.send_if_modified(|state| match state.position(id) {
            Some(pos) => {
                f(&mut state.records[pos]);
                state.touch(order);
                true
            }
            None => false,
        })
    }

    /// Apply a local mutation ahead of its remote command.
    pub fn apply_optimistic(&self, mutation: Mutation<R>) -> Result<EntryId, SyncError> {
        let entry_id = EntryId(self.next_entry.fetch_add(1, Ordering::SeqCst) + 1);
        let order = self.order;
        let mut result = Ok(entry_id);

        self.state.send_if_modified(|state| {
            match apply_mutation(state, mutation) {
                Ok(entry) => {
                    state.entries.insert(entry_id, entry);
                    state.touch(order);
                    true
                }
                Err(e) => {
                    result = Err(e);
                    false
                }
            }
        });

        if result.is_ok() {
            trace!(entry = %entry_id, "optimistic mutation applied");
        }
        result
    }

    /// Undo an optimistic mutation exactly.
    ///
    /// An insert already confirmed by a pushed event is left in place.
    pub fn revert_optimistic(&self, entry: EntryId) -> Result<(), SyncError> {
        let order = self.order;
        let mut result = Ok(());

        self.state.send_if_modified(|state| {
            let Some(settled) = state.entries.remove(&entry) else {
                result = Err(SyncError::UnknownEntry(entry));
                return false;
            };

            if settled.state == EntryState::Confirmed {
                debug!(entry = %entry, "entry already confirmed by push, not reverting");
            } else {
                match settled.undo {
                    Undo::RemoveInserted { id } => {
                        state.remove(&id);
                    }
                    Undo::RestoreFields(fields) => {
                        for field in fields {
                            if let Err(e) = restore_fields(state, &field) {
                                warn!(id = %field.id, error = %e, "failed to restore fields");
                            }
                        }
                    }
                    Undo::Reinsert(record) => {
                        if state.position(record.id()).is_none() {
                            state.records.push(record);
                        }
                    }
                }
            }
            state.touch(order);
            true
        });
        result
    }

    /// Keep an optimistic mutation, reconciling it with the server's row when one is given.
    pub fn confirm_optimistic(&self, entry: EntryId, confirmed: Option<R>) -> Result<(), SyncError> {
        let order = self.order;
        let mut result = Ok(());

        self.state.send_if_modified(|state| {
            let Some(settled) = state.entries.remove(&entry) else {
                result = Err(SyncError::UnknownEntry(entry));
                return false;
            };

            if let Some(confirmed) = confirmed
                && let Err(e) = reconcile_confirmed(state, &settled, confirmed)
            {
                result = Err(e);
            }
            state.touch(order);
            true
        });
        result
    }

    /// Merge one pushed change event.
    pub fn apply_pushed(&self, event: &ChangeEvent) -> Result<(), SyncError> {
        let order = self.order;
        let mut result = Ok(());

        self.state.send_if_modified(|state| match merge_pushed(state, event) {
            Ok(changed) => {
                if changed {
                    state.touch(order);
                }
                changed
            }
            Err(e) => {
                result = Err(e);
                false
            }
        });
        result
    }
}

fn apply_mutation<R: Record>(
    state: &mut FeedSnapshot<R>,
    mutation: Mutation<R>,
) -> Result<Entry<R>, SyncError> {
    match mutation {
        Mutation::Insert(record) => {
            if state.position(record.id()).is_some() {
                return Err(SyncError::DuplicateRecord(record.id().to_string()));
            }
            let id = record.id().to_string();
            let correlation = Some(record.correlation().unwrap_or(&id).to_string());
            state.records.push(record);
            Ok(Entry {
                state: EntryState::Pending,
                undo: Undo::RemoveInserted { id },
                correlation,
            })
        }
        Mutation::Patch { id, patch } => {
            if state.position(&id).is_none() {
                return Err(SyncError::UnknownRecord(id));
            }
            let restore = patch_record(state, &id, &patch)?;
            Ok(Entry {
                state: EntryState::Pending,
                undo: Undo::RestoreFields(vec![restore]),
                correlation: None,
            })
        }
        Mutation::PatchMany { ids, patch } => {
            let mut restores = Vec::new();
            for id in ids {
                if state.position(&id).is_some() {
                    restores.push(patch_record(state, &id, &patch)?);
                }
            }
            Ok(Entry {
                state: EntryState::Pending,
                undo: Undo::RestoreFields(restores),
                correlation: None,
            })
        }
        Mutation::Remove { id } => {
            let record = state
                .remove(&id)
                .ok_or_else(|| SyncError::UnknownRecord(id.clone()))?;
            Ok(Entry {
                state: EntryState::Pending,
                undo: Undo::Reinsert(record),
                correlation: None,
            })
        }
    }
}

/// Overwrite the patched fields of one record, remembering what they were.
fn patch_record<R: Record>(
    state: &mut FeedSnapshot<R>,
    id: &str,
    patch: &Row,
) -> Result<FieldRestore, SyncError> {
    let pos = state
        .position(id)
        .ok_or_else(|| SyncError::UnknownRecord(id.to_string()))?;
    let current = to_row(&state.records[pos])?;

    let mut previous = Row::new();
    let mut absent = Vec::new();
    for key in patch.keys() {
        match current.get(key) {
            Some(value) => {
                previous.insert(key.clone(), value.clone());
            }
            None => absent.push(key.clone()),
        }
    }

    state.records[pos] = merge_fields(&state.records[pos], patch)?;
    Ok(FieldRestore {
        id: id.to_string(),
        patch: patch.clone(),
        previous,
        absent,
    })
}

/// Lay unsettled patches and removals back over freshly seeded records, oldest entry first.
fn reapply_pending<R: Record>(state: &mut FeedSnapshot<R>) {
    let mut entries = std::mem::take(&mut state.entries);
    let mut pending: Vec<(&EntryId, &mut Entry<R>)> = entries
        .iter_mut()
        .filter(|(_, e)| e.state == EntryState::Pending)
        .collect();
    pending.sort_by_key(|(entry_id, _)| **entry_id);

    for (entry_id, entry) in pending {
        match &mut entry.undo {
            Undo::RemoveInserted { .. } => {}
            Undo::RestoreFields(fields) => {
                for field in fields.iter_mut() {
                    if state.position(&field.id).is_none() {
                        continue;
                    }
                    match patch_record(state, &field.id, &field.patch) {
                        Ok(restore) => *field = restore,
                        Err(e) => {
                            warn!(entry = %entry_id, id = %field.id, error = %e, "failed to reapply patch");
                        }
                    }
                }
            }
            Undo::Reinsert(record) => {
                if let Some(fresh) = state.remove(record.id()) {
                    *record = fresh;
                }
            }
        }
    }
    state.entries = entries;
}

fn restore_fields<R: Record>(
    state: &mut FeedSnapshot<R>,
    restore: &FieldRestore,
) -> Result<(), SyncError> {
    let Some(pos) = state.position(&restore.id) else {
        return Ok(());
    };
    let mut row = to_row(&state.records[pos])?;
    for (key, value) in &restore.previous {
        row.insert(key.clone(), value.clone());
    }
    for key in &restore.absent {
        row.remove(key);
    }
    state.records[pos] = decode_row(&row)?;
    Ok(())
}

fn reconcile_confirmed<R: Record>(
    state: &mut FeedSnapshot<R>,
    entry: &Entry<R>,
    confirmed: R,
) -> Result<(), SyncError> {
    let confirmed_row = to_row(&confirmed)?;

    if let Undo::RemoveInserted { id: provisional } = &entry.undo
        && provisional != confirmed.id()
    {
        let provisional_record = state.remove(provisional);
        if let Some(pos) = state.position(confirmed.id()) {
            // A pushed insert got here first.
            state.records[pos] = merge_fields(&state.records[pos], &confirmed_row)?;
        } else {
            let merged = match provisional_record {
                Some(record) => merge_fields(&record, &confirmed_row)?,
                None => confirmed,
            };
            state.records.push(merged);
        }
        return Ok(());
    }

    match state.position(confirmed.id()) {
        Some(pos) => state.records[pos] = merge_fields(&state.records[pos], &confirmed_row)?,
        None => {
            if matches!(entry.undo, Undo::RemoveInserted { .. }) {
                state.records.push(confirmed);
            }
        }
    }
    Ok(())
}

fn merge_pushed<R: Record>(state: &mut FeedSnapshot<R>, event: &ChangeEvent) -> Result<bool, SyncError> {
    match event.event {
        EventClass::Insert => {
            let Some(row) = &event.new_row else {
                return Ok(false);
            };
            let Some(id) = row_key(row) else {
                return Ok(false);
            };
            if state.position(&id).is_some() {
                return Ok(false);
            }

            let record: R = decode_row(row)?;
            let pending = record.correlation().and_then(|correlation| {
                state
                    .entries
                    .iter()
                    .find(|(_, e)| {
                        e.state == EntryState::Pending && e.correlation.as_deref() == Some(correlation)
                    })
                    .map(|(entry_id, _)| *entry_id)
            });

            match pending {
                Some(entry_id) => {
                    let provisional = match state.entries.get(&entry_id).map(|e| &e.undo) {
                        Some(Undo::RemoveInserted { id }) => id.clone(),
                        _ => return Ok(false),
                    };
                    let merged = match state.remove(&provisional) {
                        Some(local) => merge_fields(&local, row)?,
                        None => record,
                    };
                    state.records.push(merged);
                    if let Some(entry) = state.entries.get_mut(&entry_id) {
                        entry.state = EntryState::Confirmed;
                        entry.undo = Undo::RemoveInserted { id: id.clone() };
                    }
                    debug!(entry = %entry_id, id = %id, "pending insert confirmed by push");
                }
                None => state.records.push(record),
            }
            Ok(true)
        }
        EventClass::Update => {
            let Some(row) = &event.new_row else {
                return Ok(false);
            };
            let Some(pos) = row_key(row).and_then(|id| state.position(&id)) else {
                return Ok(false);
            };
            state.records[pos] = merge_fields(&state.records[pos], row)?;
            Ok(true)
        }
        EventClass::Delete => {
            let Some(id) = event
                .old_row
                .as_ref()
                .or(event.new_row.as_ref())
                .and_then(row_key)
            else {
                return Ok(false);
            };
            Ok(state.remove(&id).is_some())
        }
        EventClass::All => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        id: String,
        created_at: DateTime<Utc>,
        #[serde(default)]
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_ref: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        author: Option<String>,
    }

    impl Record for Item {
        fn id(&self) -> &str {
            &self.id
        }

        fn timestamp(&self) -> DateTime<Utc> {
            self.created_at
        }

        fn correlation(&self) -> Option<&str> {
            self.client_ref.as_deref()
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn item(id: &str, secs: i64) -> Item {
        Item {
            id: id.into(),
            created_at: at(secs),
            body: format!("body {}", id),
            client_ref: None,
            author: None,
        }
    }

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn ids(store: &ReconcilingStore<Item>) -> Vec<String> {
        store.records().iter().map(|r| r.id.clone()).collect()
    }

    #[test]
    fn test_seed_sorts_and_dedupes() {
        let store = ReconcilingStore::new(FeedOrder::OldestFirst);
        store.seed(vec![item("b", 2), item("a", 1), item("b", 2), item("c", 0)]);
        assert_eq!(ids(&store), vec!["c", "a", "b"]);

        let store = ReconcilingStore::new(FeedOrder::NewestFirst);
        store.seed(vec![item("b", 2), item("a", 1), item("c", 0)]);
        assert_eq!(ids(&store), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_ties_broken_by_identifier() {
        let store = ReconcilingStore::new(FeedOrder::OldestFirst);
        store.seed(vec![item("z", 1), item("m", 1), item("a", 1)]);
        assert_eq!(ids(&store), vec!["a", "m", "z"]);
    }

    #[test]
    fn test_pushed_insert_is_idempotent() {
        let store = ReconcilingStore::new(FeedOrder::OldestFirst);
        let event = ChangeEvent::insert(
            "items",
            row(json!({"id": "a", "created_at": at(1), "body": "x"})),
        );
        store.apply_pushed(&event).unwrap();
        store.apply_pushed(&event).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_pushed_update_keeps_unmentioned_fields() {
        let store = ReconcilingStore::new(FeedOrder::OldestFirst);
        let mut full = item("a", 1);
        full.author = Some("Ada".into());
        store.seed(vec![full]);

        store
            .apply_pushed(&ChangeEvent::update("items", row(json!({"id": "a", "body": "edited"}))))
            .unwrap();

        let record = store.get("a").unwrap();
        assert_eq!(record.body, "edited");
        assert_eq!(record.author.as_deref(), Some("Ada"));
    }

    #[test]
    fn test_pushed_update_for_unknown_record_is_ignored() {
        let store: ReconcilingStore<Item> = ReconcilingStore::new(FeedOrder::OldestFirst);
        let before = store.snapshot().version();
        store
            .apply_pushed(&ChangeEvent::update("items", row(json!({"id": "ghost", "body": "x"}))))
            .unwrap();
        assert!(store.is_empty());
        assert_eq!(store.snapshot().version(), before);
    }

    #[test]
    fn test_pushed_delete_removes() {
        let store = ReconcilingStore::new(FeedOrder::OldestFirst);
        store.seed(vec![item("a", 1), item("b", 2)]);
        store
            .apply_pushed(&ChangeEvent::delete("items", row(json!({"id": "a"}))))
            .unwrap();
        assert_eq!(ids(&store), vec!["b"]);
    }

    #[test]
    fn test_optimistic_insert_confirmed_by_push_leaves_one_record() {
        let store = ReconcilingStore::new(FeedOrder::OldestFirst);
        let mut provisional = item("pending-1", 5);
        provisional.client_ref = Some("ref-1".into());
        provisional.author = Some("Me".into());
        let entry = store.apply_optimistic(Mutation::Insert(provisional)).unwrap();

        store
            .apply_pushed(&ChangeEvent::insert(
                "items",
                row(json!({"id": "m1", "created_at": at(5), "body": "hi", "client_ref": "ref-1"})),
            ))
            .unwrap();

        assert_eq!(ids(&store), vec!["m1"]);
        // Joined field from the local copy survives the partial push.
        assert_eq!(store.get("m1").unwrap().author.as_deref(), Some("Me"));
        assert_eq!(store.snapshot().entry_state(entry), Some(EntryState::Confirmed));

        let mut confirmed = item("m1", 5);
        confirmed.client_ref = Some("ref-1".into());
        confirmed.body = "hi".into();
        store.confirm_optimistic(entry, Some(confirmed)).unwrap();
        assert_eq!(ids(&store), vec!["m1"]);
        assert_eq!(store.snapshot().pending_count(), 0);
    }

    #[test]
    fn test_confirm_replaces_provisional_identifier() {
        let store = ReconcilingStore::new(FeedOrder::OldestFirst);
        let mut provisional = item("pending-1", 5);
        provisional.client_ref = Some("ref-1".into());
        provisional.author = Some("Me".into());
        let entry = store.apply_optimistic(Mutation::Insert(provisional)).unwrap();
        assert!(store.snapshot().is_pending("pending-1"));

        let mut confirmed = item("m1", 5);
        confirmed.client_ref = Some("ref-1".into());
        store.confirm_optimistic(entry, Some(confirmed)).unwrap();

        assert_eq!(ids(&store), vec!["m1"]);
        assert_eq!(store.get("m1").unwrap().author.as_deref(), Some("Me"));

        // The echo of our own insert arrives afterwards.
        store
            .apply_pushed(&ChangeEvent::insert(
                "items",
                row(json!({"id": "m1", "created_at": at(5), "client_ref": "ref-1"})),
            ))
            .unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_revert_restores_only_touched_fields() {
        let store = ReconcilingStore::new(FeedOrder::OldestFirst);
        store.seed(vec![item("a", 1)]);

        let entry = store
            .apply_optimistic(Mutation::patch("a", row(json!({"body": "optimistic", "author": "Me"}))))
            .unwrap();
        // A concurrent push to an untouched field must survive the revert.
        store
            .apply_pushed(&ChangeEvent::update("items", row(json!({"id": "a", "created_at": at(3)}))))
            .unwrap();

        store.revert_optimistic(entry).unwrap();
        let record = store.get("a").unwrap();
        assert_eq!(record.body, "body a");
        assert_eq!(record.author, None);
        assert_eq!(record.created_at, at(3));
    }

    #[test]
    fn test_revert_of_remove_reinserts_in_order() {
        let store = ReconcilingStore::new(FeedOrder::NewestFirst);
        store.seed(vec![item("a", 1), item("b", 2), item("c", 3)]);
        let entry = store.apply_optimistic(Mutation::remove("b")).unwrap();
        assert_eq!(ids(&store), vec!["c", "a"]);
        store.revert_optimistic(entry).unwrap();
        assert_eq!(ids(&store), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_unknown_targets_are_errors() {
        let store: ReconcilingStore<Item> = ReconcilingStore::new(FeedOrder::OldestFirst);
        assert!(matches!(
            store.apply_optimistic(Mutation::remove("x")),
            Err(SyncError::UnknownRecord(_))
        ));
        assert!(matches!(
            store.revert_optimistic(EntryId(99)),
            Err(SyncError::UnknownEntry(_))
        ));

        store.seed(vec![item("a", 1)]);
        assert!(matches!(
            store.apply_optimistic(Mutation::Insert(item("a", 1))),
            Err(SyncError::DuplicateRecord(_))
        ));
    }

    #[test]
    fn test_seed_keeps_pending_inserts() {
        let store = ReconcilingStore::new(FeedOrder::OldestFirst);
        store.apply_optimistic(Mutation::Insert(item("pending-1", 9))).unwrap();
        store.seed(vec![item("a", 1)]);
        assert_eq!(ids(&store), vec!["a", "pending-1"]);
    }

    #[test]
    fn test_seed_keeps_pending_patches_and_removals() {
        let store = ReconcilingStore::new(FeedOrder::OldestFirst);
        store.seed(vec![item("a", 1), item("b", 2)]);
        let patched = store
            .apply_optimistic(Mutation::PatchMany {
                ids: vec!["a".into()],
                patch: row(json!({"body": "read"})),
            })
            .unwrap();
        let removed = store.apply_optimistic(Mutation::remove("b")).unwrap();

        let mut fresh_a = item("a", 1);
        fresh_a.body = "edited elsewhere".into();
        let mut fresh_b = item("b", 2);
        fresh_b.author = Some("Bo".into());
        store.seed(vec![fresh_a, fresh_b]);

        assert_eq!(ids(&store), vec!["a"]);
        assert_eq!(store.get("a").unwrap().body, "read");
        assert_eq!(store.snapshot().pending_count(), 2);

        // A successful command keeps the local edit.
        store.confirm_optimistic(patched, None).unwrap();
        assert_eq!(store.get("a").unwrap().body, "read");

        // A failed one restores what the refresh fetched.
        store.revert_optimistic(removed).unwrap();
        assert_eq!(ids(&store), vec!["a", "b"]);
        assert_eq!(store.get("b").unwrap().author.as_deref(), Some("Bo"));
    }

    #[test]
    fn test_revert_after_seed_restores_fetched_fields() {
        let store = ReconcilingStore::new(FeedOrder::OldestFirst);
        store.seed(vec![item("a", 1)]);
        let entry = store
            .apply_optimistic(Mutation::patch("a", row(json!({"body": "optimistic"}))))
            .unwrap();

        let mut fresh = item("a", 1);
        fresh.body = "server".into();
        store.seed(vec![fresh]);
        assert_eq!(store.get("a").unwrap().body, "optimistic");

        store.revert_optimistic(entry).unwrap();
        assert_eq!(store.get("a").unwrap().body, "server");
    }

    #[test]
    fn test_append_older_ignores_known() {
        let store = ReconcilingStore::new(FeedOrder::OldestFirst);
        store.seed(vec![item("c", 3)]);
        let added = store.append_older(vec![item("a", 1), item("b", 2), item("c", 3)]);
        assert_eq!(added, 2);
        assert_eq!(ids(&store), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_patch_many_reverts_every_record() {
        let store = ReconcilingStore::new(FeedOrder::OldestFirst);
        store.seed(vec![item("a", 1), item("b", 2)]);
        let entry = store
            .apply_optimistic(Mutation::PatchMany {
                ids: vec!["a".into(), "b".into(), "ghost".into()],
                patch: row(json!({"body": "read"})),
            })
            .unwrap();
        assert!(store.records().iter().all(|r| r.body == "read"));

        store.revert_optimistic(entry).unwrap();
        assert_eq!(store.get("a").unwrap().body, "body a");
        assert_eq!(store.get("b").unwrap().body, "body b");
    }

    #[tokio::test]
    async fn test_subscribers_see_published_snapshots() {
        let store = ReconcilingStore::new(FeedOrder::OldestFirst);
        let mut rx = store.subscribe();
        store.seed(vec![item("a", 1)]);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().len(), 1);
    }
}
