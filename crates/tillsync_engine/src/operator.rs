//! Operator surface over a store: backlog queries and interventions that do
//! not touch the business repository.
//!
//! These work on a bare [`SyncStore`], so the CLI can run them against a
//! data directory while no node is running. Resolutions that need the
//! repository are recorded as [`ResolutionRequest`]s and applied by the
//! node on its next cycle.

use crate::error::{SyncError, SyncResult};
use crate::log::LogEvent;
use crate::model::{
    BatchOrigin, BatchStatus, LogOperation, QueueStatus, ResolutionRequest, SyncConflict,
};
use crate::retry::RetryScheduler;
use crate::store::{SyncStore, Tables, Txn};
use serde::Serialize;
use tillsync_protocol::{BatchId, ConflictId, QueueItemId, StoreId, Timestamp};
use tracing::info;

/// Sync health of one store, as shown to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncHealth {
    /// Store.
    pub store_id: StoreId,
    /// Whether the store's sync is enabled.
    pub enabled: bool,
    /// End of the last clean cycle.
    pub last_successful_sync: Option<Timestamp>,
    /// Start of the last cycle.
    pub last_attempted_sync: Option<Timestamp>,
    /// Error of the last failed cycle.
    pub last_sync_error: Option<String>,
    /// Items waiting to be sent.
    pub pending: usize,
    /// Items inside an unfinished batch.
    pub in_progress: usize,
    /// Items parked by the peer as conflicts.
    pub held: usize,
    /// Dead-lettered items.
    pub dead_letters: usize,
    /// Conflicts needing attention.
    pub open_conflicts: usize,
    /// Enqueue time of the oldest pending item.
    pub oldest_pending: Option<Timestamp>,
}

/// Returns the health of `store_id`.
pub fn health(tables: &Tables, store_id: StoreId) -> SyncResult<SyncHealth> {
    let config = tables
        .configs
        .get(&store_id)
        .ok_or(SyncError::UnknownStore(store_id))?;
    let mut health = SyncHealth {
        store_id,
        enabled: config.enabled,
        last_successful_sync: config.last_successful_sync,
        last_attempted_sync: config.last_attempted_sync,
        last_sync_error: config.last_sync_error.clone(),
        pending: 0,
        in_progress: 0,
        held: 0,
        dead_letters: 0,
        open_conflicts: list_conflicts(tables, store_id).len(),
        oldest_pending: None,
    };
    for item in tables.queue.values().filter(|i| i.store_id == store_id) {
        match item.status {
            QueueStatus::Pending => {
                health.pending += 1;
                health.oldest_pending = Some(
                    health
                        .oldest_pending
                        .map_or(item.enqueued_at, |t| t.min(item.enqueued_at)),
                );
            }
            QueueStatus::InProgress => health.in_progress += 1,
            QueueStatus::Conflict => health.held += 1,
            QueueStatus::Failed => health.dead_letters += 1,
            QueueStatus::Completed | QueueStatus::Cancelled => {}
        }
    }
    Ok(health)
}

/// Returns the conflicts of a store that need an operator, oldest first.
pub fn list_conflicts(tables: &Tables, store_id: StoreId) -> Vec<SyncConflict> {
    tables
        .conflicts
        .values()
        .filter(|c| c.store_id == store_id && c.needs_attention())
        .cloned()
        .collect()
}

/// Records a resolution for the node to apply on its next cycle.
pub fn request_resolution(
    store: &SyncStore,
    conflict_id: ConflictId,
    payload: Option<Vec<u8>>,
    user: &str,
    notes: Option<String>,
    now: Timestamp,
) -> SyncResult<u64> {
    store.transact(|txn| {
        let conflict = txn.conflict(conflict_id)?;
        if conflict.is_resolved {
            return Err(SyncError::ConflictAlreadyResolved(conflict_id));
        }
        if user.trim().is_empty() {
            return Err(SyncError::MissingResolver(conflict_id));
        }
        let id = txn.next_request_id();
        txn.put(ResolutionRequest {
            id,
            conflict_id,
            payload,
            user: user.to_string(),
            notes,
            requested_at: now,
        });
        info!(conflict = %conflict_id, request = id, user, "resolution requested");
        Ok(id)
    })
}

/// Cancels a queue item that has not completed.
pub fn cancel_item(store: &SyncStore, item_id: QueueItemId, now: Timestamp) -> SyncResult<()> {
    store.transact(|txn| {
        let mut item = txn.item(item_id)?;
        let store_id = item.store_id;
        item.transition(QueueStatus::Cancelled)?;
        txn.put(item);
        txn.log(
            LogEvent::new(LogOperation::Cancel, store_id, item_id.to_string()),
            now,
        );
        Ok(())
    })?;
    info!(item = %item_id, "queue item cancelled");
    Ok(())
}

/// Cancels an unfinished batch.
///
/// Processed records keep their outcome. Queue items of unprocessed
/// outbound records go back to `Pending` without spending retry budget.
pub fn cancel_batch(store: &SyncStore, batch_id: BatchId, now: Timestamp) -> SyncResult<usize> {
    let released = store.transact(|txn| {
        let released = release_batch(txn, batch_id, "cancelled by operator", now)?;
        let store_id = txn.batch(batch_id)?.store_id;
        txn.log(
            LogEvent::new(
                LogOperation::Cancel,
                store_id,
                format!("{batch_id} released={released}"),
            ),
            now,
        );
        Ok(released)
    })?;
    info!(batch = %batch_id, released, "batch cancelled");
    Ok(released)
}

/// Cancels `batch_id` and returns its unprocessed outbound items to the
/// queue. Returns the number of items released.
pub(crate) fn release_batch(
    txn: &mut Txn<'_>,
    batch_id: BatchId,
    reason: &str,
    now: Timestamp,
) -> SyncResult<usize> {
    let mut batch = txn.batch(batch_id)?;
    batch.cancel(reason, now)?;
    let origin = batch.origin;
    txn.put(batch);
    if origin != BatchOrigin::Outbound {
        return Ok(0);
    }

    let items: Vec<_> = txn
        .tables()
        .records_of(batch_id)
        .into_iter()
        .filter(|r| !r.is_processed())
        .filter_map(|r| r.queue_item)
        .collect();
    let mut released = 0;
    for item_id in items {
        let mut item = txn.item(item_id)?;
        if item.status == QueueStatus::InProgress && item.batch_id == Some(batch_id) {
            item.transition(QueueStatus::Pending)?;
            txn.put(item);
            released += 1;
        }
    }
    Ok(released)
}

/// Puts a dead-lettered item back in the queue with a fresh retry budget.
pub fn replay_failed(store: &SyncStore, item_id: QueueItemId, now: Timestamp) -> SyncResult<()> {
    store.transact(|txn| {
        let mut item = txn.item(item_id)?;
        let scheduler = RetryScheduler::new(txn.config(item.store_id)?.retry());
        scheduler.replay(&mut item)?;
        let store_id = item.store_id;
        txn.put(item);
        txn.log(
            LogEvent::new(LogOperation::Replay, store_id, item_id.to_string()),
            now,
        );
        Ok(())
    })?;
    info!(item = %item_id, "dead letter replayed");
    Ok(())
}

/// Returns the unfinished batches of a store, oldest first.
pub fn open_batches(tables: &Tables, store_id: StoreId) -> Vec<BatchId> {
    tables
        .batches
        .values()
        .filter(|b| b.store_id == store_id && !b.status.is_terminal())
        .map(|b| b.id)
        .collect()
}

/// Returns the number of batches per status for a store.
pub fn batch_counts(tables: &Tables, store_id: StoreId) -> Vec<(BatchStatus, usize)> {
    let statuses = [
        BatchStatus::Pending,
        BatchStatus::InProgress,
        BatchStatus::Completed,
        BatchStatus::PartiallyCompleted,
        BatchStatus::Failed,
        BatchStatus::Cancelled,
    ];
    statuses
        .into_iter()
        .map(|status| {
            let n = tables
                .batches
                .values()
                .filter(|b| b.store_id == store_id && b.status == status)
                .count();
            (status, n)
        })
        .collect()
}
