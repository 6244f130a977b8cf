//! Typed envelopes carried between stores and HQ.
//!
//! Payloads stay opaque bytes; everything the engine needs to route, order
//! and compare a change lives in typed fields so schema problems surface as
//! [`ProtocolError`]s before anything is applied.

use crate::codec::{from_cbor, to_cbor};
use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::{BatchId, EntityId, EntityType, RecordId, StoreId, Timestamp};
use serde::{Deserialize, Serialize};

/// Envelope schema version understood by this build.
pub const SCHEMA_VERSION: u16 = 1;

/// Kind of mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOperation {
    /// New entity.
    Create,
    /// Changed entity.
    Update,
    /// Removed entity.
    Delete,
}

impl ChangeOperation {
    /// Returns true if the operation carries a payload.
    #[must_use]
    pub fn has_payload(&self) -> bool {
        !matches!(self, ChangeOperation::Delete)
    }
}

/// Direction a batch travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchDirection {
    /// Store → HQ.
    Upload,
    /// HQ → store.
    Download,
}

/// One versioned entity mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityEnvelope {
    /// Schema version of this envelope.
    pub schema_version: u16,
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity id.
    pub entity_id: EntityId,
    /// Mutation kind.
    pub operation: ChangeOperation,
    /// Logical version of the change.
    pub timestamp: Timestamp,
    /// Serialized entity; absent for deletes.
    pub payload: Option<Vec<u8>>,
}

impl EntityEnvelope {
    /// Creates an envelope at the current schema version.
    pub fn new(
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<EntityId>,
        operation: ChangeOperation,
        timestamp: Timestamp,
        payload: Option<Vec<u8>>,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation,
            timestamp,
            payload,
        }
    }

    /// Checks the schema version and the payload/operation pairing.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(ProtocolError::SchemaMismatch {
                expected: SCHEMA_VERSION,
                found: self.schema_version,
            });
        }
        if self.entity_type.as_str().is_empty() {
            return Err(ProtocolError::InvalidEnvelope("empty entity type".into()));
        }
        if self.entity_id.as_str().is_empty() {
            return Err(ProtocolError::InvalidEnvelope(format!(
                "empty entity id for {}",
                self.entity_type
            )));
        }
        match (self.operation.has_payload(), self.payload.is_some()) {
            (true, false) => Err(ProtocolError::InvalidEnvelope(format!(
                "{:?} of {}/{} carries no payload",
                self.operation, self.entity_type, self.entity_id
            ))),
            (false, true) => Err(ProtocolError::InvalidEnvelope(format!(
                "delete of {}/{} carries a payload",
                self.entity_type, self.entity_id
            ))),
            _ => Ok(()),
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR and validates.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let envelope: Self = from_cbor(bytes)?;
        envelope.validate()?;
        Ok(envelope)
    }
}

/// A record inside a batch: the sender's record id plus the mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEnvelope {
    /// Record id on the sending node.
    pub record_id: RecordId,
    /// The mutation.
    pub entity: EntityEnvelope,
}

/// A batch as transmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchEnvelope {
    /// Schema version of the batch framing.
    pub schema_version: u16,
    /// Batch id on the sending node.
    pub batch_id: BatchId,
    /// Store the batch belongs to (sender for uploads, target for downloads).
    pub store_id: StoreId,
    /// Travel direction.
    pub direction: BatchDirection,
    /// Entity type shared by every record.
    pub entity_type: EntityType,
    /// Records in assembly order.
    pub records: Vec<RecordEnvelope>,
}

impl BatchEnvelope {
    /// Creates an empty batch envelope.
    pub fn new(
        batch_id: BatchId,
        store_id: StoreId,
        direction: BatchDirection,
        entity_type: impl Into<EntityType>,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            batch_id,
            store_id,
            direction,
            entity_type: entity_type.into(),
            records: Vec::new(),
        }
    }

    /// Appends a record.
    pub fn push(&mut self, record_id: RecordId, entity: EntityEnvelope) {
        self.records.push(RecordEnvelope { record_id, entity });
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the batch has no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Validates the framing and every record.
    ///
    /// A schema mismatch anywhere rejects the whole batch.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(ProtocolError::SchemaMismatch {
                expected: SCHEMA_VERSION,
                found: self.schema_version,
            });
        }
        for record in &self.records {
            if record.entity.schema_version != SCHEMA_VERSION {
                return Err(ProtocolError::SchemaMismatch {
                    expected: SCHEMA_VERSION,
                    found: record.entity.schema_version,
                });
            }
            if record.entity.entity_type != self.entity_type {
                return Err(ProtocolError::InvalidEnvelope(format!(
                    "{} holds a {} record in a {} batch",
                    record.record_id, record.entity.entity_type, self.entity_type
                )));
            }
        }
        Ok(())
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR and validates the framing.
    ///
    /// Per-record payload problems are left to the receiver so they fail
    /// individually instead of rejecting the batch.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let envelope: Self = from_cbor(bytes)?;
        envelope.validate()?;
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(id: u64, at: u64) -> EntityEnvelope {
        EntityEnvelope::new(
            "Product",
            id,
            ChangeOperation::Update,
            Timestamp::from_millis(at),
            Some(format!("{{\"sku\":{id}}}").into_bytes()),
        )
    }

    #[test]
    fn batch_survives_the_wire() {
        let mut batch = BatchEnvelope::new(BatchId(4), StoreId(1), BatchDirection::Upload, "Product");
        batch.push(RecordId(10), product(7, 100));
        batch.push(RecordId(11), product(42, 90));

        let decoded = BatchEnvelope::decode(&batch.encode().unwrap()).unwrap();
        assert_eq!(decoded, batch);
        assert_eq!(decoded.records[0].entity.entity_id.as_str(), "7");
    }

    #[test]
    fn schema_mismatch_is_rejected() {
        let mut batch = BatchEnvelope::new(BatchId(1), StoreId(1), BatchDirection::Upload, "Product");
        batch.schema_version = SCHEMA_VERSION + 1;
        let err = BatchEnvelope::decode(&batch.encode().unwrap()).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::SchemaMismatch {
                expected: SCHEMA_VERSION,
                found: SCHEMA_VERSION + 1
            }
        );

        let mut record = product(1, 1);
        record.schema_version = 0;
        assert!(matches!(
            record.validate(),
            Err(ProtocolError::SchemaMismatch { found: 0, .. })
        ));
    }

    #[test]
    fn mixed_entity_types_are_invalid() {
        let mut batch = BatchEnvelope::new(BatchId(1), StoreId(1), BatchDirection::Upload, "Product");
        let mut stray = product(1, 1);
        stray.entity_type = EntityType::new("Customer");
        batch.push(RecordId(1), stray);
        assert!(matches!(
            batch.validate(),
            Err(ProtocolError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn payload_must_match_operation() {
        let delete = EntityEnvelope::new(
            "Product",
            9u64,
            ChangeOperation::Delete,
            Timestamp::from_millis(5),
            None,
        );
        assert!(delete.validate().is_ok());

        let mut bad_delete = delete.clone();
        bad_delete.payload = Some(vec![1]);
        assert!(bad_delete.validate().is_err());

        let mut empty_update = product(9, 5);
        empty_update.payload = None;
        assert!(empty_update.validate().is_err());
    }
}
