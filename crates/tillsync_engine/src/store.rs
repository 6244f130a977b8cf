//! Durable row store.
//!
//! All rows live in memory in flat tables and every change is journaled as
//! an upsert (or delete) entry before the transaction returns. Opening a
//! store replays the journal; [`SyncStore::compact`] swaps the history for a
//! snapshot of the current rows.
//!
//! Transactions run under one write lock. A closure that fails, or a journal
//! write that fails, rolls the in-memory tables back to where they were.

use crate::config::SyncConfiguration;
use crate::dir::{journal_path, DataDir};
use crate::error::{SyncError, SyncResult};
use crate::log::LogEvent;
use crate::model::{
    BatchOrigin, ResolutionRequest, SyncBatch, SyncConflict, SyncLogEntry, SyncPoint,
    SyncQueueItem, SyncRecord,
};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tillsync_protocol::{
    from_cbor, to_cbor, BatchId, ConflictId, EntityId, EntityType, LogId, QueueItemId, RecordId,
    StoreId, Timestamp,
};
use tillsync_storage::{read_frames, FileBackend, InMemoryBackend, Journal, StorageBackend};
use tracing::{debug, info};

/// One persisted row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Row {
    /// Store configuration.
    Config(SyncConfiguration),
    /// Queue item.
    Item(SyncQueueItem),
    /// Batch.
    Batch(SyncBatch),
    /// Record.
    Record(SyncRecord),
    /// Conflict.
    Conflict(SyncConflict),
    /// Log entry.
    Log(SyncLogEntry),
    /// Common sync point.
    SyncPoint(SyncPoint),
    /// Deferred resolution request.
    Request(ResolutionRequest),
}

impl Row {
    /// Returns the row's key.
    pub fn key(&self) -> RowKey {
        match self {
            Row::Config(c) => RowKey::Config(c.store_id),
            Row::Item(i) => RowKey::Item(i.id),
            Row::Batch(b) => RowKey::Batch(b.id),
            Row::Record(r) => RowKey::Record(r.id),
            Row::Conflict(c) => RowKey::Conflict(c.id),
            Row::Log(l) => RowKey::Log(l.id),
            Row::SyncPoint(p) => {
                RowKey::SyncPoint(p.store_id, p.entity_type.clone(), p.entity_id.clone())
            }
            Row::Request(r) => RowKey::Request(r.id),
        }
    }
}

macro_rules! into_row {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Row {
            fn from(row: $ty) -> Self {
                Row::$variant(row)
            }
        })*
    };
}

into_row! {
    SyncConfiguration => Config,
    SyncQueueItem => Item,
    SyncBatch => Batch,
    SyncRecord => Record,
    SyncConflict => Conflict,
    SyncLogEntry => Log,
    SyncPoint => SyncPoint,
    ResolutionRequest => Request,
}

/// Key of a persisted row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RowKey {
    /// Store configuration.
    Config(StoreId),
    /// Queue item.
    Item(QueueItemId),
    /// Batch.
    Batch(BatchId),
    /// Record.
    Record(RecordId),
    /// Conflict.
    Conflict(ConflictId),
    /// Log entry.
    Log(LogId),
    /// Sync point.
    SyncPoint(StoreId, EntityType, EntityId),
    /// Resolution request.
    Request(u64),
}

#[derive(Debug, Serialize, Deserialize)]
enum JournalEntry {
    Put(Row),
    Delete(RowKey),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Counters {
    item: u64,
    batch: u64,
    record: u64,
    conflict: u64,
    log: u64,
    request: u64,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            item: 1,
            batch: 1,
            record: 1,
            conflict: 1,
            log: 1,
            request: 1,
        }
    }
}

/// Key of a sync point.
pub type SyncPointKey = (StoreId, EntityType, EntityId);

/// In-memory tables.
#[derive(Debug, Clone, Default)]
pub struct Tables {
    /// Store configurations.
    pub configs: BTreeMap<StoreId, SyncConfiguration>,
    /// Queue items in id (FIFO) order.
    pub queue: BTreeMap<QueueItemId, SyncQueueItem>,
    /// Batches.
    pub batches: BTreeMap<BatchId, SyncBatch>,
    /// Records.
    pub records: BTreeMap<RecordId, SyncRecord>,
    /// Conflicts.
    pub conflicts: BTreeMap<ConflictId, SyncConflict>,
    /// Log entries.
    pub logs: BTreeMap<LogId, SyncLogEntry>,
    /// Common sync points.
    pub sync_points: HashMap<SyncPointKey, Timestamp>,
    /// Deferred resolution requests.
    pub requests: BTreeMap<u64, ResolutionRequest>,
    batch_records: HashMap<BatchId, Vec<RecordId>>,
    inbound: HashMap<(StoreId, BatchId), BatchId>,
    counters: Counters,
}

impl Tables {
    /// Returns the records of a batch in position order.
    pub fn records_of(&self, batch: BatchId) -> Vec<&SyncRecord> {
        let mut records: Vec<_> = self
            .batch_records
            .get(&batch)
            .into_iter()
            .flatten()
            .filter_map(|id| self.records.get(id))
            .collect();
        records.sort_by_key(|r| r.position);
        records
    }

    /// Returns the local batch created for a peer's batch.
    pub fn inbound_batch(&self, store: StoreId, remote: BatchId) -> Option<&SyncBatch> {
        self.inbound
            .get(&(store, remote))
            .and_then(|id| self.batches.get(id))
    }

    /// Returns the common sync point, falling back to the rule cursor.
    pub fn common_point(
        &self,
        store: StoreId,
        entity_type: &EntityType,
        entity_id: &EntityId,
    ) -> Timestamp {
        self.sync_points
            .get(&(store, entity_type.clone(), entity_id.clone()))
            .copied()
            .or_else(|| {
                self.configs
                    .get(&store)
                    .and_then(|c| c.rules.rule_for(entity_type))
                    .map(|r| r.sync_cursor)
            })
            .unwrap_or(Timestamp::ZERO)
    }

    /// Returns every row, for snapshots.
    fn rows(&self) -> Vec<Row> {
        let mut rows = Vec::new();
        rows.extend(self.configs.values().cloned().map(Row::from));
        rows.extend(self.queue.values().cloned().map(Row::from));
        rows.extend(self.batches.values().cloned().map(Row::from));
        rows.extend(self.records.values().cloned().map(Row::from));
        rows.extend(self.conflicts.values().cloned().map(Row::from));
        rows.extend(self.logs.values().cloned().map(Row::from));
        rows.extend(self.sync_points.iter().map(|((store_id, ty, id), at)| {
            Row::SyncPoint(SyncPoint {
                store_id: *store_id,
                entity_type: ty.clone(),
                entity_id: id.clone(),
                at: *at,
            })
        }));
        rows.extend(self.requests.values().cloned().map(Row::from));
        rows
    }

    fn apply(&mut self, entry: JournalEntry) -> Option<Row> {
        match entry {
            JournalEntry::Put(row) => self.put(row),
            JournalEntry::Delete(key) => self.delete(&key),
        }
    }

    fn put(&mut self, row: Row) -> Option<Row> {
        let c = &mut self.counters;
        match row {
            Row::Config(config) => self.configs.insert(config.store_id, config).map(Row::from),
            Row::Item(item) => {
                c.item = c.item.max(item.id.get() + 1);
                self.queue.insert(item.id, item).map(Row::from)
            }
            Row::Batch(batch) => {
                c.batch = c.batch.max(batch.id.get() + 1);
                if let BatchOrigin::Inbound { remote_batch_id } = batch.origin {
                    self.inbound.insert((batch.store_id, remote_batch_id), batch.id);
                }
                self.batches.insert(batch.id, batch).map(Row::from)
            }
            Row::Record(record) => {
                c.record = c.record.max(record.id.get() + 1);
                let ids = self.batch_records.entry(record.batch_id).or_default();
                if !ids.contains(&record.id) {
                    ids.push(record.id);
                }
                self.records.insert(record.id, record).map(Row::from)
            }
            Row::Conflict(conflict) => {
                c.conflict = c.conflict.max(conflict.id.get() + 1);
                self.conflicts.insert(conflict.id, conflict).map(Row::from)
            }
            Row::Log(entry) => {
                c.log = c.log.max(entry.id.get() + 1);
                self.logs.insert(entry.id, entry).map(Row::from)
            }
            Row::SyncPoint(point) => {
                let key = (point.store_id, point.entity_type.clone(), point.entity_id.clone());
                self.sync_points
                    .insert(key, point.at)
                    .map(|at| Row::SyncPoint(SyncPoint { at, ..point }))
            }
            Row::Request(request) => {
                c.request = c.request.max(request.id + 1);
                self.requests.insert(request.id, request).map(Row::from)
            }
        }
    }

    fn delete(&mut self, key: &RowKey) -> Option<Row> {
        match key {
            RowKey::Config(id) => self.configs.remove(id).map(Row::from),
            RowKey::Item(id) => self.queue.remove(id).map(Row::from),
            RowKey::Batch(id) => {
                let batch = self.batches.remove(id)?;
                if let BatchOrigin::Inbound { remote_batch_id } = batch.origin {
                    self.inbound.remove(&(batch.store_id, remote_batch_id));
                }
                Some(Row::from(batch))
            }
            RowKey::Record(id) => {
                let record = self.records.remove(id)?;
                if let Some(ids) = self.batch_records.get_mut(&record.batch_id) {
                    ids.retain(|r| r != id);
                }
                Some(Row::from(record))
            }
            RowKey::Conflict(id) => self.conflicts.remove(id).map(Row::from),
            RowKey::Log(id) => self.logs.remove(id).map(Row::from),
            RowKey::SyncPoint(store_id, ty, id) => self
                .sync_points
                .remove(&(*store_id, ty.clone(), id.clone()))
                .map(|at| {
                    Row::SyncPoint(SyncPoint {
                        store_id: *store_id,
                        entity_type: ty.clone(),
                        entity_id: id.clone(),
                        at,
                    })
                }),
            RowKey::Request(id) => self.requests.remove(id).map(Row::from),
        }
    }

    fn from_bodies<'a>(bodies: impl IntoIterator<Item = &'a [u8]>) -> SyncResult<Self> {
        let mut tables = Tables::default();
        for body in bodies {
            let entry: JournalEntry = from_cbor(body)?;
            tables.apply(entry);
        }
        Ok(tables)
    }
}

enum Undo {
    Restore(Row),
    Remove(RowKey),
}

/// A transaction over the tables.
///
/// Reads see the transaction's own writes.
pub struct Txn<'a> {
    tables: &'a mut Tables,
    entries: Vec<JournalEntry>,
    undo: Vec<Undo>,
}

impl Txn<'_> {
    /// Returns the tables.
    pub fn tables(&self) -> &Tables {
        self.tables
    }

    /// Inserts or replaces a row.
    pub fn put(&mut self, row: impl Into<Row>) {
        let row = row.into();
        let key = row.key();
        let undo = match self.tables.put(row.clone()) {
            Some(previous) => Undo::Restore(previous),
            None => Undo::Remove(key),
        };
        self.undo.push(undo);
        self.entries.push(JournalEntry::Put(row));
    }

    /// Deletes a row if present.
    pub fn delete(&mut self, key: RowKey) {
        if let Some(previous) = self.tables.delete(&key) {
            self.undo.push(Undo::Restore(previous));
            self.entries.push(JournalEntry::Delete(key));
        }
    }

    /// Allocates a queue item id.
    pub fn next_item_id(&mut self) -> QueueItemId {
        let id = self.tables.counters.item;
        self.tables.counters.item += 1;
        QueueItemId(id)
    }

    /// Allocates a batch id.
    pub fn next_batch_id(&mut self) -> BatchId {
        let id = self.tables.counters.batch;
        self.tables.counters.batch += 1;
        BatchId(id)
    }

    /// Allocates a record id.
    pub fn next_record_id(&mut self) -> RecordId {
        let id = self.tables.counters.record;
        self.tables.counters.record += 1;
        RecordId(id)
    }

    /// Allocates a conflict id.
    pub fn next_conflict_id(&mut self) -> ConflictId {
        let id = self.tables.counters.conflict;
        self.tables.counters.conflict += 1;
        ConflictId(id)
    }

    /// Allocates a resolution request id.
    pub fn next_request_id(&mut self) -> u64 {
        let id = self.tables.counters.request;
        self.tables.counters.request += 1;
        id
    }

    /// Returns a copy of a queue item.
    pub fn item(&self, id: QueueItemId) -> SyncResult<SyncQueueItem> {
        self.tables.queue.get(&id).cloned().ok_or(SyncError::NotFound {
            kind: "queue item",
            id: id.get(),
        })
    }

    /// Returns a copy of a batch.
    pub fn batch(&self, id: BatchId) -> SyncResult<SyncBatch> {
        self.tables.batches.get(&id).cloned().ok_or(SyncError::NotFound {
            kind: "batch",
            id: id.get(),
        })
    }

    /// Returns a copy of a record.
    pub fn record(&self, id: RecordId) -> SyncResult<SyncRecord> {
        self.tables.records.get(&id).cloned().ok_or(SyncError::NotFound {
            kind: "record",
            id: id.get(),
        })
    }

    /// Returns a copy of a conflict.
    pub fn conflict(&self, id: ConflictId) -> SyncResult<SyncConflict> {
        self.tables
            .conflicts
            .get(&id)
            .cloned()
            .ok_or(SyncError::NotFound {
                kind: "conflict",
                id: id.get(),
            })
    }

    /// Returns a copy of a store configuration.
    pub fn config(&self, store: StoreId) -> SyncResult<SyncConfiguration> {
        self.tables
            .configs
            .get(&store)
            .cloned()
            .ok_or(SyncError::UnknownStore(store))
    }

    /// Raises a sync point; it never moves backward.
    pub fn advance_sync_point(
        &mut self,
        store_id: StoreId,
        entity_type: &EntityType,
        entity_id: &EntityId,
        at: Timestamp,
    ) {
        let key = (store_id, entity_type.clone(), entity_id.clone());
        if self.tables.sync_points.get(&key).is_some_and(|t| *t >= at) {
            return;
        }
        self.put(SyncPoint {
            store_id,
            entity_type: entity_type.clone(),
            entity_id: entity_id.clone(),
            at,
        });
    }

    /// Appends a log entry.
    pub fn log(&mut self, event: LogEvent, at: Timestamp) -> LogId {
        let id = LogId(self.tables.counters.log);
        self.tables.counters.log += 1;
        self.put(SyncLogEntry {
            id,
            store_id: event.store_id,
            operation: event.operation,
            success: event.error.is_none(),
            error: event.error,
            detail: event.detail,
            duration_ms: u64::try_from(event.duration.as_millis()).unwrap_or(u64::MAX),
            at,
        });
        id
    }
}

/// One journal entry, as listed by [`SyncStore::dump_journal`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JournalLine {
    /// Frame offset in the journal file.
    pub offset: u64,
    /// `put` or `delete`.
    pub action: &'static str,
    /// Row affected.
    pub key: RowKey,
}

/// Sizes before and after a compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionStats {
    /// Journal bytes before.
    pub bytes_before: u64,
    /// Journal bytes after.
    pub bytes_after: u64,
    /// Rows written to the snapshot.
    pub rows: usize,
}

/// The durable row store.
pub struct SyncStore {
    tables: RwLock<Tables>,
    journal: Mutex<Journal>,
    dir: Option<DataDir>,
    sync_on_write: bool,
}

impl SyncStore {
    /// Opens the store in `path`, creating it if needed and taking the lock.
    pub fn open(path: &Path, sync_on_write: bool) -> SyncResult<Self> {
        let dir = DataDir::open(path, true)?;
        let backend = FileBackend::open(&dir.journal_path())?;
        let mut store = Self::with_backend(Box::new(backend), sync_on_write)?;
        info!(
            path = %path.display(),
            items = store.read().queue.len(),
            batches = store.read().batches.len(),
            "sync store opened"
        );
        store.dir = Some(dir);
        Ok(store)
    }

    /// Creates a volatile store.
    pub fn open_in_memory() -> SyncResult<Self> {
        Self::with_backend(Box::new(InMemoryBackend::new()), false)
    }

    /// Opens a store over any backend.
    pub fn with_backend(backend: Box<dyn StorageBackend>, sync_on_write: bool) -> SyncResult<Self> {
        let journal = Journal::open(backend, sync_on_write)?;
        let frames = journal.replay()?;
        let tables = Tables::from_bodies(frames.iter().map(|f| f.body.as_slice()))?;
        debug!(entries = frames.len(), "journal replayed");

        Ok(Self {
            tables: RwLock::new(tables),
            journal: Mutex::new(journal),
            dir: None,
            sync_on_write,
        })
    }

    /// Loads the tables of a data directory without locking or repairing it.
    ///
    /// Safe to call while another process owns the directory; a torn tail
    /// is ignored rather than truncated.
    pub fn load_read_only(path: &Path) -> SyncResult<Tables> {
        let journal = journal_path(path);
        if !journal.exists() {
            return Ok(Tables::default());
        }
        let bytes = std::fs::read(journal)?;
        let frames = read_frames(&bytes);
        Tables::from_bodies(frames.iter().map(|f| f.body.as_slice()))
    }

    /// Lists the entries of a data directory's journal, oldest first.
    ///
    /// Reads without locking, like [`load_read_only`](Self::load_read_only).
    pub fn dump_journal(path: &Path) -> SyncResult<Vec<JournalLine>> {
        let journal = journal_path(path);
        if !journal.exists() {
            return Ok(Vec::new());
        }
        let bytes = std::fs::read(journal)?;
        read_frames(&bytes)
            .into_iter()
            .map(|frame| -> SyncResult<JournalLine> {
                let (action, key) = match from_cbor::<JournalEntry>(&frame.body)? {
                    JournalEntry::Put(row) => ("put", row.key()),
                    JournalEntry::Delete(key) => ("delete", key),
                };
                Ok(JournalLine {
                    offset: frame.offset,
                    action,
                    key,
                })
            })
            .collect()
    }

    /// Returns a read guard over the tables.
    pub fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read()
    }

    /// Runs `f` as one atomic, durable transaction.
    pub fn transact<T>(&self, f: impl FnOnce(&mut Txn<'_>) -> SyncResult<T>) -> SyncResult<T> {
        let mut tables = self.tables.write();
        let counters = tables.counters;
        let mut txn = Txn {
            tables: &mut *tables,
            entries: Vec::new(),
            undo: Vec::new(),
        };
        let result = f(&mut txn);
        let Txn { entries, undo, .. } = txn;

        let outcome = result.and_then(|value| {
            if !entries.is_empty() {
                let bodies = entries.iter().map(to_cbor).collect::<Result<Vec<_>, _>>()?;
                self.journal.lock().append_all(&bodies)?;
            }
            Ok(value)
        });

        if outcome.is_err() {
            for step in undo.into_iter().rev() {
                match step {
                    Undo::Restore(row) => {
                        tables.put(row);
                    }
                    Undo::Remove(key) => {
                        tables.delete(&key);
                    }
                }
            }
            tables.counters = counters;
        }
        outcome
    }

    /// Rewrites the journal as a snapshot of the current rows.
    pub fn compact(&self) -> SyncResult<CompactionStats> {
        let tables = self.tables.write();
        let mut journal = self.journal.lock();
        let bytes_before = journal.size()?;

        let rows = tables.rows();
        let bodies = rows
            .iter()
            .map(|row| to_cbor(&JournalEntry::Put(row.clone())))
            .collect::<Result<Vec<_>, _>>()?;

        match &self.dir {
            Some(dir) => {
                let temp = dir.compact_path();
                if temp.exists() {
                    std::fs::remove_file(&temp)?;
                }
                {
                    let scratch = Journal::open(Box::new(FileBackend::open(&temp)?), false)?;
                    scratch.append_all(&bodies)?;
                    scratch.sync()?;
                }
                std::fs::rename(&temp, dir.journal_path())?;
                dir.sync_directory()?;
                *journal = Journal::open(
                    Box::new(FileBackend::open(&dir.journal_path())?),
                    self.sync_on_write,
                )?;
            }
            None => journal.rewrite(&bodies)?,
        }

        let stats = CompactionStats {
            bytes_before,
            bytes_after: journal.size()?,
            rows: rows.len(),
        };
        info!(
            before = stats.bytes_before,
            after = stats.bytes_after,
            rows = stats.rows,
            "journal compacted"
        );
        Ok(stats)
    }

    /// Returns the journal size in bytes.
    pub fn journal_size(&self) -> SyncResult<u64> {
        Ok(self.journal.lock().size()?)
    }
}
