//! Local repository contract.
//!
//! The repository is the business data the engine replicates. The engine
//! reads the current version of an entity before applying a remote change and
//! writes the winner back. A tombstone version means "delete".

use crate::error::{SyncError, SyncResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tillsync_protocol::{EntityId, EntityType, Version};

/// Access to the local replica of the business data.
pub trait LocalRepository: Send + Sync {
    /// Returns the current version of an entity, or `None` if it never existed.
    fn get(&self, entity_type: &EntityType, entity_id: &EntityId) -> SyncResult<Option<Version>>;

    /// Stores `version` as the entity's current state.
    fn put(
        &self,
        entity_type: &EntityType,
        entity_id: &EntityId,
        version: &Version,
    ) -> SyncResult<()>;
}

/// An in-memory repository for tests and demos.
///
/// Deletes are kept as tombstones so a later stale create is detected.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    rows: RwLock<HashMap<(EntityType, EntityId), Version>>,
    fail_next: AtomicU32,
    fail_permanently: AtomicBool,
}

impl MemoryRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a row without going through the engine.
    pub fn insert(
        &self,
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<EntityId>,
        version: Version,
    ) {
        self.rows
            .write()
            .insert((entity_type.into(), entity_id.into()), version);
    }

    /// Returns the payload of a live row.
    pub fn payload(
        &self,
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<EntityId>,
    ) -> Option<Vec<u8>> {
        self.rows
            .read()
            .get(&(entity_type.into(), entity_id.into()))
            .and_then(|v| v.payload.clone())
    }

    /// Returns the number of rows, tombstones included.
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    /// Returns true if the repository holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Makes the next `n` writes fail.
    pub fn fail_next_writes(&self, n: u32, permanent: bool) {
        self.fail_permanently.store(permanent, Ordering::SeqCst);
        self.fail_next.store(n, Ordering::SeqCst);
    }
}

impl LocalRepository for MemoryRepository {
    fn get(&self, entity_type: &EntityType, entity_id: &EntityId) -> SyncResult<Option<Version>> {
        Ok(self
            .rows
            .read()
            .get(&(entity_type.clone(), entity_id.clone()))
            .cloned())
    }

    fn put(
        &self,
        entity_type: &EntityType,
        entity_id: &EntityId,
        version: &Version,
    ) -> SyncResult<()> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            let permanent = self.fail_permanently.load(Ordering::SeqCst);
            return Err(SyncError::repository(
                format!("write to {entity_type} {entity_id} rejected"),
                !permanent,
            ));
        }
        self.rows
            .write()
            .insert((entity_type.clone(), entity_id.clone()), version.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tillsync_protocol::Timestamp;

    #[test]
    fn put_then_get() {
        let repo = MemoryRepository::new();
        let ty = EntityType::new("Product");
        let id = EntityId::from(42u64);
        assert!(repo.get(&ty, &id).unwrap().is_none());

        let v = Version::new(b"P1".to_vec(), Timestamp::from_millis(3));
        repo.put(&ty, &id, &v).unwrap();
        assert_eq!(repo.get(&ty, &id).unwrap(), Some(v));

        repo.put(&ty, &id, &Version::tombstone(Timestamp::from_millis(4)))
            .unwrap();
        assert_eq!(repo.len(), 1);
        assert!(repo.payload("Product", 42u64).is_none());
    }

    #[test]
    fn injected_failures() {
        let repo = MemoryRepository::new();
        let ty = EntityType::new("Product");
        let v = Version::new(b"x".to_vec(), Timestamp::from_millis(1));
        repo.fail_next_writes(1, false);

        let err = repo.put(&ty, &EntityId::from(1u64), &v).unwrap_err();
        assert!(err.is_retryable());
        assert!(repo.put(&ty, &EntityId::from(1u64), &v).is_ok());
    }
}
