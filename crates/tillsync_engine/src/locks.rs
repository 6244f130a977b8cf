//! Entity-level locks.
//!
//! HQ applies batches from many stores at once. Two records touching the
//! same entity must not interleave their read-detect-write sequence; records
//! of different entities proceed in parallel.

use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use tillsync_protocol::{EntityId, EntityType};

type EntityKey = (EntityType, EntityId);

/// A set of held entity locks.
#[derive(Debug, Default)]
pub struct EntityLockTable {
    held: Mutex<HashSet<EntityKey>>,
    released: Condvar,
}

impl EntityLockTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the entity is free, then holds it until the guard drops.
    pub fn lock(&self, entity_type: &EntityType, entity_id: &EntityId) -> EntityGuard<'_> {
        let key = (entity_type.clone(), entity_id.clone());
        let mut held = self.held.lock();
        while held.contains(&key) {
            self.released.wait(&mut held);
        }
        held.insert(key.clone());
        EntityGuard { table: self, key }
    }

    /// Returns the number of entities currently held.
    pub fn held(&self) -> usize {
        self.held.lock().len()
    }
}

/// Holds one entity lock.
#[derive(Debug)]
pub struct EntityGuard<'a> {
    table: &'a EntityLockTable,
    key: EntityKey,
}

impl Drop for EntityGuard<'_> {
    fn drop(&mut self) {
        self.table.held.lock().remove(&self.key);
        self.table.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn distinct_entities_do_not_block() {
        let table = EntityLockTable::new();
        let ty = EntityType::new("Product");
        let _a = table.lock(&ty, &EntityId::from(1u64));
        let _b = table.lock(&ty, &EntityId::from(2u64));
        assert_eq!(table.held(), 2);
    }

    #[test]
    fn same_entity_is_exclusive() {
        let table = Arc::new(EntityLockTable::new());
        let inside = Arc::new(AtomicU32::new(0));
        let max_inside = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _guard = table.lock(&"Product".into(), &"42".into());
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(table.held(), 0);
    }
}
