//! Per-record acknowledgements returned for an applied batch.

use crate::codec::{from_cbor, to_cbor};
use crate::conflict::ConflictWinner;
use crate::error::ProtocolResult;
use crate::ids::{BatchId, ConflictId, EntityId, RecordId, StoreId};
use serde::{Deserialize, Serialize};

/// What the receiver did with one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckOutcome {
    /// Applied without a conflict (or was already in sync).
    Applied,
    /// A conflict was detected and settled automatically.
    Resolved {
        /// Winning side from the receiver's point of view.
        winner: ConflictWinner,
    },
    /// A conflict is waiting for an operator on the receiver.
    ConflictPending {
        /// Conflict row on the receiver.
        conflict_id: ConflictId,
    },
    /// The record could not be applied.
    Failed {
        /// Error detail.
        message: String,
        /// True if retrying the same record cannot succeed.
        permanent: bool,
    },
}

impl AckOutcome {
    /// Returns true for `Applied` and `Resolved`.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, AckOutcome::Applied | AckOutcome::Resolved { .. })
    }
}

/// Outcome for one record of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordAck {
    /// Record id on the sender.
    pub record_id: RecordId,
    /// Entity the record carried.
    pub entity_id: EntityId,
    /// What happened.
    pub outcome: AckOutcome,
}

/// Acknowledgement for a whole batch, in record order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchAck {
    /// Batch id on the sender.
    pub batch_id: BatchId,
    /// Store the batch belonged to.
    pub store_id: StoreId,
    /// One entry per record.
    pub outcomes: Vec<RecordAck>,
}

impl BatchAck {
    /// Creates an empty ack.
    pub fn new(batch_id: BatchId, store_id: StoreId) -> Self {
        Self {
            batch_id,
            store_id,
            outcomes: Vec::new(),
        }
    }

    /// Returns the outcome for `record_id`.
    #[must_use]
    pub fn outcome_for(&self, record_id: RecordId) -> Option<&AckOutcome> {
        self.outcomes
            .iter()
            .find(|ack| ack.record_id == record_id)
            .map(|ack| &ack.outcome)
    }

    /// Returns `(success, failed, conflict)` counts.
    #[must_use]
    pub fn tally(&self) -> (usize, usize, usize) {
        self.outcomes
            .iter()
            .fold((0, 0, 0), |(ok, failed, conflict), ack| match ack.outcome {
                AckOutcome::Applied | AckOutcome::Resolved { .. } => (ok + 1, failed, conflict),
                AckOutcome::Failed { .. } => (ok, failed + 1, conflict),
                AckOutcome::ConflictPending { .. } => (ok, failed, conflict + 1),
            })
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tally_and_lookup() {
        let mut ack = BatchAck::new(BatchId(2), StoreId(3));
        ack.outcomes.push(RecordAck {
            record_id: RecordId(1),
            entity_id: EntityId::from(7u64),
            outcome: AckOutcome::Applied,
        });
        ack.outcomes.push(RecordAck {
            record_id: RecordId(2),
            entity_id: EntityId::from(8u64),
            outcome: AckOutcome::Resolved {
                winner: ConflictWinner::Local,
            },
        });
        ack.outcomes.push(RecordAck {
            record_id: RecordId(3),
            entity_id: EntityId::from(9u64),
            outcome: AckOutcome::ConflictPending {
                conflict_id: ConflictId(1),
            },
        });
        ack.outcomes.push(RecordAck {
            record_id: RecordId(4),
            entity_id: EntityId::from(10u64),
            outcome: AckOutcome::Failed {
                message: "bad payload".into(),
                permanent: true,
            },
        });

        assert_eq!(ack.tally(), (2, 1, 1));
        assert!(ack.outcome_for(RecordId(2)).unwrap().is_success());
        assert!(ack.outcome_for(RecordId(99)).is_none());

        let decoded = BatchAck::decode(&ack.encode().unwrap()).unwrap();
        assert_eq!(decoded, ack);
    }
}
