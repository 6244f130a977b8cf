//! Batch assembly.
//!
//! Claims run inside a store transaction, so an item can be claimed by at
//! most one batch and a crash never leaves a half-built batch behind.

use crate::error::SyncResult;
use crate::log::LogEvent;
use crate::model::{BatchOrigin, BatchStatus, LogOperation, RecordOutcome, SyncBatch, SyncRecord};
use crate::queue;
use crate::store::{Tables, Txn};
use tillsync_protocol::{BatchDirection, BatchEnvelope, BatchId, EntityType, StoreId, Timestamp};
use tracing::info;

/// A freshly assembled outbound batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledBatch {
    /// Local batch id; also the id on the wire.
    pub batch_id: BatchId,
    /// The envelope to transmit.
    pub envelope: BatchEnvelope,
}

/// Picks the entity type to assemble next for (store, direction).
///
/// Types are ranked by the highest priority among their due items, then by
/// the oldest such item, so a critical change never waits behind a long
/// backlog of another type.
pub fn next_entity_type(
    tables: &Tables,
    store_id: StoreId,
    direction: BatchDirection,
    now: Timestamp,
) -> Option<EntityType> {
    let config = tables.configs.get(&store_id)?;
    tables
        .queue
        .values()
        .filter(|i| i.store_id == store_id && i.direction == direction && i.is_due(now))
        .filter(|i| {
            config
                .rules
                .rule_for(&i.entity_type)
                .is_some_and(|r| r.accepts(direction))
        })
        .min_by(|a, b| queue::queue_order(a, b))
        .map(|i| i.entity_type.clone())
}

/// Builds a batch of up to `max_batch_size` due items for the tuple.
///
/// Returns `None` when nothing is eligible, including when the type's rule
/// is disabled or does not allow `direction`.
pub(crate) fn assemble(
    txn: &mut Txn<'_>,
    store_id: StoreId,
    direction: BatchDirection,
    entity_type: &EntityType,
    now: Timestamp,
) -> SyncResult<Option<AssembledBatch>> {
    let config = txn.config(store_id)?;
    if !config
        .rules
        .rule_for(entity_type)
        .is_some_and(|r| r.accepts(direction))
    {
        return Ok(None);
    }

    let items: Vec<_> = queue::eligible(txn.tables(), store_id, direction, entity_type, now)
        .into_iter()
        .take(config.max_batch_size)
        .cloned()
        .collect();
    if items.is_empty() {
        return Ok(None);
    }

    let batch_id = txn.next_batch_id();
    let mut envelope = BatchEnvelope::new(batch_id, store_id, direction, entity_type.clone());

    for (position, mut item) in items.into_iter().enumerate() {
        let record_id = txn.next_record_id();
        let entity = item.envelope();
        envelope.push(record_id, entity.clone());
        txn.put(SyncRecord {
            id: record_id,
            batch_id,
            position: u32::try_from(position).unwrap_or(u32::MAX),
            queue_item: Some(item.id),
            remote_record_id: None,
            entity,
            outcome: RecordOutcome::Pending,
            processed_at: None,
        });
        item.claim(batch_id)?;
        txn.put(item);
    }

    let record_count = u32::try_from(envelope.len()).unwrap_or(u32::MAX);
    txn.put(SyncBatch {
        id: batch_id,
        store_id,
        direction,
        entity_type: entity_type.clone(),
        origin: BatchOrigin::Outbound,
        record_count,
        success_count: 0,
        failed_count: 0,
        conflict_count: 0,
        status: BatchStatus::Pending,
        created_at: now,
        started_at: None,
        completed_at: None,
        payload: envelope.encode()?,
        error: None,
    });
    txn.log(
        LogEvent::new(
            LogOperation::Assemble,
            store_id,
            format!("{batch_id} {entity_type} {direction:?} records={record_count}"),
        ),
        now,
    );
    info!(batch = %batch_id, store = %store_id, %entity_type, ?direction, records = record_count, "batch assembled");

    Ok(Some(AssembledBatch { batch_id, envelope }))
}
