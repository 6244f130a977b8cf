//! Change queue: enqueue and scheduling order.

use crate::error::SyncResult;
use crate::log::LogEvent;
use crate::model::{LogOperation, QueueStatus, SyncQueueItem};
use crate::retry::RetryScheduler;
use crate::store::{Tables, Txn};
use std::cmp::Ordering;
use tillsync_protocol::{
    BatchDirection, ChangeOperation, EntityEnvelope, EntityId, EntityType, Priority, QueueItemId,
    StoreId, Timestamp,
};
use tracing::debug;

/// A local mutation handed over by a business subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity id.
    pub entity_id: EntityId,
    /// Mutation kind.
    pub operation: ChangeOperation,
    /// Serialized entity; `None` for deletes.
    pub payload: Option<Vec<u8>>,
    /// Logical version of the change.
    pub timestamp: Timestamp,
    /// Overrides the rule's default priority.
    pub priority: Option<Priority>,
}

impl Change {
    /// A create.
    pub fn create(
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<EntityId>,
        payload: impl Into<Vec<u8>>,
        timestamp: Timestamp,
    ) -> Self {
        Self::with_payload(entity_type, entity_id, ChangeOperation::Create, payload, timestamp)
    }

    /// An update.
    pub fn update(
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<EntityId>,
        payload: impl Into<Vec<u8>>,
        timestamp: Timestamp,
    ) -> Self {
        Self::with_payload(entity_type, entity_id, ChangeOperation::Update, payload, timestamp)
    }

    /// A delete.
    pub fn delete(
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<EntityId>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation: ChangeOperation::Delete,
            payload: None,
            timestamp,
            priority: None,
        }
    }

    fn with_payload(
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<EntityId>,
        operation: ChangeOperation,
        payload: impl Into<Vec<u8>>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation,
            payload: Some(payload.into()),
            timestamp,
            priority: None,
        }
    }

    /// Sets an explicit priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    fn envelope(&self) -> EntityEnvelope {
        EntityEnvelope::new(
            self.entity_type.clone(),
            self.entity_id.clone(),
            self.operation,
            self.timestamp,
            self.payload.clone(),
        )
    }
}

/// Scheduling order: priority descending, then enqueue sequence ascending.
pub fn queue_order(a: &SyncQueueItem, b: &SyncQueueItem) -> Ordering {
    b.priority.cmp(&a.priority).then(a.id.cmp(&b.id))
}

/// Adds a change to a store's queue inside `txn`.
///
/// The store's rule for the type must exist, be enabled and allow
/// `direction`.
pub(crate) fn enqueue(
    txn: &mut Txn<'_>,
    store_id: StoreId,
    direction: BatchDirection,
    change: Change,
    now: Timestamp,
) -> SyncResult<QueueItemId> {
    let config = txn.config(store_id)?;
    let rule = config.rules.check_enqueue(&change.entity_type, direction)?;
    change.envelope().validate()?;

    let id = txn.next_item_id();
    let item = SyncQueueItem {
        id,
        store_id,
        direction,
        priority: change.priority.unwrap_or(rule.priority),
        entity_type: change.entity_type,
        entity_id: change.entity_id,
        operation: change.operation,
        status: QueueStatus::Pending,
        payload: change.payload,
        entity_timestamp: change.timestamp,
        enqueued_at: now,
        retry_count: 0,
        max_retries: config.retry_attempts,
        last_error: None,
        next_retry_at: None,
        batch_id: None,
    };
    debug!(
        item = %id,
        store = %store_id,
        entity_type = %item.entity_type,
        entity_id = %item.entity_id,
        priority = ?item.priority,
        "change enqueued"
    );
    let detail = format!("{id} {} {}", item.entity_type, item.entity_id);
    txn.put(item);
    txn.log(LogEvent::new(LogOperation::Enqueue, store_id, detail), now);
    Ok(id)
}

/// Returns the items of one (store, direction, type) due at `now`, in
/// scheduling order.
pub fn eligible<'a>(
    tables: &'a Tables,
    store_id: StoreId,
    direction: BatchDirection,
    entity_type: &EntityType,
    now: Timestamp,
) -> Vec<&'a SyncQueueItem> {
    let mut items: Vec<_> = RetryScheduler::sweep(tables.queue.values(), now)
        .filter(|i| {
            i.store_id == store_id && i.direction == direction && &i.entity_type == entity_type
        })
        .collect();
    items.sort_by(|a, b| queue_order(a, b));
    items
}

/// Returns every queue item of a store in scheduling order.
pub fn snapshot(tables: &Tables, store_id: StoreId) -> Vec<SyncQueueItem> {
    let mut items: Vec<_> = tables
        .queue
        .values()
        .filter(|i| i.store_id == store_id)
        .cloned()
        .collect();
    items.sort_by(queue_order);
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfiguration;
    use crate::error::SyncError;
    use crate::store::SyncStore;
    use proptest::prelude::*;
    use tillsync_protocol::{SyncDirection, SyncEntityRule};

    fn store() -> SyncStore {
        let store = SyncStore::open_in_memory().unwrap();
        store
            .transact(|txn| {
                txn.put(
                    SyncConfiguration::new(StoreId(1))
                        .with_rule(SyncEntityRule::new("Product"))
                        .with_rule(
                            SyncEntityRule::new("TaxInvoice")
                                .with_direction(SyncDirection::Upload)
                                .with_priority(Priority::High),
                        ),
                );
                Ok(())
            })
            .unwrap();
        store
    }

    fn add(store: &SyncStore, change: Change) -> SyncResult<QueueItemId> {
        store.transact(|txn| {
            enqueue(txn, StoreId(1), BatchDirection::Upload, change, Timestamp::ZERO)
        })
    }

    #[test]
    fn rule_default_priority_applies() {
        let store = store();
        let id = add(
            &store,
            Change::create("TaxInvoice", "INV-1", b"i".to_vec(), Timestamp::from_millis(1)),
        )
        .unwrap();
        let tables = store.read();
        assert_eq!(tables.queue[&id].priority, Priority::High);
        assert_eq!(tables.queue[&id].max_retries, 5);
        assert_eq!(tables.logs.len(), 1);
    }

    #[test]
    fn rejected_changes_leave_no_trace() {
        let store = store();
        assert!(matches!(
            add(&store, Change::delete("Payroll", "1", Timestamp::ZERO)),
            Err(SyncError::UnknownEntityType(_))
        ));

        let mut bad = Change::delete("Product", "1", Timestamp::ZERO);
        bad.payload = Some(b"x".to_vec());
        assert!(matches!(add(&store, bad), Err(SyncError::Protocol(_))));

        let tables = store.read();
        assert!(tables.queue.is_empty());
        assert!(tables.logs.is_empty());
    }

    #[test]
    fn critical_before_normal_fifo_within_tier() {
        let store = store();
        let ts = Timestamp::from_millis(1);
        let a = add(&store, Change::update("Product", "42", b"a".to_vec(), ts)).unwrap();
        let b = add(
            &store,
            Change::update("Product", "7", b"b".to_vec(), ts).with_priority(Priority::Critical),
        )
        .unwrap();
        let c = add(&store, Change::update("Product", "9", b"c".to_vec(), ts)).unwrap();

        let tables = store.read();
        let order: Vec<_> = eligible(&tables, StoreId(1), BatchDirection::Upload, &"Product".into(), ts)
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(order, vec![b, a, c]);
    }

    fn priority() -> impl Strategy<Value = Priority> {
        prop_oneof![
            Just(Priority::Low),
            Just(Priority::Normal),
            Just(Priority::High),
            Just(Priority::Critical),
        ]
    }

    proptest! {
        #[test]
        fn order_is_priority_then_fifo(tiers in proptest::collection::vec(priority(), 1..40)) {
            let store = store();
            for (n, tier) in tiers.iter().enumerate() {
                add(
                    &store,
                    Change::update("Product", n.to_string().as_str(), b"x".to_vec(), Timestamp::ZERO)
                        .with_priority(*tier),
                )
                .unwrap();
            }
            let tables = store.read();
            let items = eligible(&tables, StoreId(1), BatchDirection::Upload, &"Product".into(), Timestamp::ZERO);
            prop_assert_eq!(items.len(), tiers.len());
            for pair in items.windows(2) {
                prop_assert!(
                    pair[0].priority > pair[1].priority
                        || (pair[0].priority == pair[1].priority && pair[0].id < pair[1].id)
                );
            }
        }
    }
}
