//! Persisted rows.
//!
//! Rows live in flat tables keyed by id; relationships (a record's batch, a
//! conflict's record) are ids resolved through the store, never pointers.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use tillsync_protocol::{
    AckOutcome, BatchDirection, BatchId, ChangeOperation, ConflictId, ConflictPolicy,
    ConflictWinner, EntityEnvelope, EntityId, EntityType, LogId, Priority, QueueItemId,
    RecordAck, RecordId, Resolution, StoreId, Timestamp, Version,
};

/// Lifecycle of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueStatus {
    /// Waiting for assembly, possibly until `next_retry_at`.
    Pending,
    /// Claimed by a batch.
    InProgress,
    /// Applied and acknowledged by the peer.
    Completed,
    /// Dead-lettered.
    Failed,
    /// Cancelled by an operator.
    Cancelled,
    /// Held while the peer waits for a conflict resolution.
    Conflict,
}

impl QueueStatus {
    /// Returns true for states that are never left automatically.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueStatus::Completed | QueueStatus::Failed | QueueStatus::Cancelled
        )
    }

    /// Returns the lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::InProgress => "in-progress",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
            QueueStatus::Cancelled => "cancelled",
            QueueStatus::Conflict => "conflict",
        }
    }

    fn allows(self, to: QueueStatus) -> bool {
        use QueueStatus::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (Pending, Cancelled)
                | (InProgress, Pending)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Cancelled)
                | (InProgress, Conflict)
                | (Conflict, Completed)
                | (Conflict, Cancelled)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A local mutation waiting to be sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    /// Row id; monotonic, so it doubles as the FIFO sequence.
    pub id: QueueItemId,
    /// Store the change belongs to (the target store on HQ).
    pub store_id: StoreId,
    /// Direction the change travels.
    pub direction: BatchDirection,
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity id.
    pub entity_id: EntityId,
    /// Mutation kind.
    pub operation: ChangeOperation,
    /// Scheduling tier.
    pub priority: Priority,
    /// Lifecycle state.
    pub status: QueueStatus,
    /// Serialized entity; `None` for deletes.
    pub payload: Option<Vec<u8>>,
    /// Logical version of the change.
    pub entity_timestamp: Timestamp,
    /// When the producer enqueued it.
    pub enqueued_at: Timestamp,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Attempts allowed before dead-lettering.
    pub max_retries: u32,
    /// Detail of the last failure.
    pub last_error: Option<String>,
    /// Earliest time of the next attempt; `None` for a first attempt.
    pub next_retry_at: Option<Timestamp>,
    /// Batch holding the item while in progress.
    pub batch_id: Option<BatchId>,
}

impl SyncQueueItem {
    /// Returns true if the item may be assembled at `now`.
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.status == QueueStatus::Pending && self.next_retry_at.map_or(true, |at| at <= now)
    }

    /// Returns true once the retry budget is spent.
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Builds the envelope carried in a batch.
    pub fn envelope(&self) -> EntityEnvelope {
        EntityEnvelope::new(
            self.entity_type.clone(),
            self.entity_id.clone(),
            self.operation,
            self.entity_timestamp,
            self.payload.clone(),
        )
    }

    /// Moves to `to`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, to: QueueStatus) -> SyncResult<()> {
        if !self.status.allows(to) {
            return Err(SyncError::InvalidStateTransition {
                from: format!("{} {}", self.id, self.status),
                to: to.to_string(),
            });
        }
        self.status = to;
        if to != QueueStatus::InProgress {
            self.batch_id = None;
        }
        Ok(())
    }

    /// Claims a pending item for `batch`.
    pub fn claim(&mut self, batch: BatchId) -> SyncResult<()> {
        self.transition(QueueStatus::InProgress)?;
        self.batch_id = Some(batch);
        Ok(())
    }
}

/// Lifecycle of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchStatus {
    /// Assembled, not yet started.
    Pending,
    /// Being sent or applied.
    InProgress,
    /// Every record succeeded.
    Completed,
    /// Mixed outcomes.
    PartiallyCompleted,
    /// Every record failed.
    Failed,
    /// Cancelled between records.
    Cancelled,
}

impl BatchStatus {
    /// Returns true once the batch is immutable.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchStatus::Pending | BatchStatus::InProgress)
    }

    /// Returns the lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::InProgress => "in-progress",
            BatchStatus::Completed => "completed",
            BatchStatus::PartiallyCompleted => "partially-completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a batch came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOrigin {
    /// Assembled on this node from the queue.
    Outbound,
    /// Received from the peer.
    Inbound {
        /// Batch id on the sender.
        remote_batch_id: BatchId,
    },
}

/// A unit of transmission for one (store, direction, entity type).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncBatch {
    /// Row id.
    pub id: BatchId,
    /// Store the batch belongs to.
    pub store_id: StoreId,
    /// Travel direction.
    pub direction: BatchDirection,
    /// Entity type of every record.
    pub entity_type: EntityType,
    /// Outbound or inbound.
    pub origin: BatchOrigin,
    /// Number of records.
    pub record_count: u32,
    /// Records that succeeded.
    pub success_count: u32,
    /// Records that failed.
    pub failed_count: u32,
    /// Records that were parked for a manual resolution when the batch was
    /// applied.
    ///
    /// This is a historical count: it is not decremented when an operator
    /// later resolves one of those conflicts. Open conflicts are the
    /// `SyncConflict` rows with `is_resolved == false`.
    pub conflict_count: u32,
    /// Lifecycle state.
    pub status: BatchStatus,
    /// Creation time.
    pub created_at: Timestamp,
    /// When sending or applying began.
    pub started_at: Option<Timestamp>,
    /// When the batch became terminal.
    pub completed_at: Option<Timestamp>,
    /// Encoded batch envelope.
    pub payload: Vec<u8>,
    /// Batch-level error, if any.
    pub error: Option<String>,
}

impl SyncBatch {
    /// Returns `success_count + failed_count`.
    pub fn processed_count(&self) -> u32 {
        self.success_count + self.failed_count
    }

    /// Returns the number of records with an outcome.
    pub fn settled_count(&self) -> u32 {
        self.success_count + self.failed_count + self.conflict_count
    }

    /// Moves a pending batch to in progress.
    pub fn start(&mut self, now: Timestamp) -> SyncResult<()> {
        match self.status {
            BatchStatus::Pending => {
                self.status = BatchStatus::InProgress;
                self.started_at = Some(now);
                Ok(())
            }
            BatchStatus::InProgress => Ok(()),
            other => Err(SyncError::InvalidStateTransition {
                from: format!("{} {other}", self.id),
                to: BatchStatus::InProgress.to_string(),
            }),
        }
    }

    /// Counts one newly settled record; finishes the batch on the last one.
    pub fn count(&mut self, outcome: &RecordOutcome, now: Timestamp) {
        if self.status.is_terminal() {
            return;
        }
        match outcome {
            RecordOutcome::Pending => return,
            RecordOutcome::Succeeded { .. } => self.success_count += 1,
            RecordOutcome::Failed { .. } => self.failed_count += 1,
            RecordOutcome::ConflictPending { .. } => self.conflict_count += 1,
        }
        if self.settled_count() >= self.record_count {
            self.status = if self.success_count == self.record_count {
                BatchStatus::Completed
            } else if self.failed_count == self.record_count {
                BatchStatus::Failed
            } else {
                BatchStatus::PartiallyCompleted
            };
            self.completed_at = Some(now);
        }
    }

    /// Cancels a batch that has not finished.
    pub fn cancel(&mut self, reason: impl Into<String>, now: Timestamp) -> SyncResult<()> {
        if self.status.is_terminal() {
            return Err(SyncError::InvalidStateTransition {
                from: format!("{} {}", self.id, self.status),
                to: BatchStatus::Cancelled.to_string(),
            });
        }
        self.status = BatchStatus::Cancelled;
        self.error = Some(reason.into());
        self.completed_at = Some(now);
        Ok(())
    }
}

/// Outcome of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordOutcome {
    /// Not processed yet.
    Pending,
    /// Applied; `resolution` is set when a conflict was settled.
    Succeeded {
        /// Winning side, from the applying node's point of view.
        resolution: Option<ConflictWinner>,
    },
    /// Could not be applied.
    Failed {
        /// Error detail.
        error: String,
        /// True if retrying cannot help.
        permanent: bool,
    },
    /// Waiting for an operator.
    ConflictPending {
        /// Conflict row on the node that detected it.
        conflict_id: ConflictId,
    },
}

impl RecordOutcome {
    /// Returns true for `Succeeded`.
    pub fn is_success(&self) -> bool {
        matches!(self, RecordOutcome::Succeeded { .. })
    }

    /// Returns the equivalent ack outcome.
    pub fn to_ack(&self) -> AckOutcome {
        match self {
            RecordOutcome::Succeeded { resolution: None } => AckOutcome::Applied,
            RecordOutcome::Succeeded {
                resolution: Some(winner),
            } => AckOutcome::Resolved { winner: *winner },
            RecordOutcome::Failed { error, permanent } => AckOutcome::Failed {
                message: error.clone(),
                permanent: *permanent,
            },
            RecordOutcome::ConflictPending { conflict_id } => AckOutcome::ConflictPending {
                conflict_id: *conflict_id,
            },
            RecordOutcome::Pending => AckOutcome::Failed {
                message: "record not processed".into(),
                permanent: false,
            },
        }
    }

    /// Converts a peer's ack outcome for the sending side.
    pub fn from_ack(outcome: &AckOutcome) -> Self {
        match outcome {
            AckOutcome::Applied => RecordOutcome::Succeeded { resolution: None },
            AckOutcome::Resolved { winner } => RecordOutcome::Succeeded {
                resolution: Some(flip(*winner)),
            },
            AckOutcome::ConflictPending { conflict_id } => RecordOutcome::ConflictPending {
                conflict_id: *conflict_id,
            },
            AckOutcome::Failed { message, permanent } => RecordOutcome::Failed {
                error: message.clone(),
                permanent: *permanent,
            },
        }
    }
}

/// Swaps the point of view of a winner.
fn flip(winner: ConflictWinner) -> ConflictWinner {
    match winner {
        ConflictWinner::Local => ConflictWinner::Remote,
        ConflictWinner::Remote => ConflictWinner::Local,
        ConflictWinner::Manual => ConflictWinner::Manual,
    }
}

/// One entity mutation inside a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Row id.
    pub id: RecordId,
    /// Owning batch.
    pub batch_id: BatchId,
    /// Position in the batch.
    pub position: u32,
    /// Source queue item for outbound records.
    pub queue_item: Option<QueueItemId>,
    /// Sender's record id for inbound records.
    pub remote_record_id: Option<RecordId>,
    /// The mutation.
    pub entity: EntityEnvelope,
    /// Outcome.
    pub outcome: RecordOutcome,
    /// Set exactly once, when the record is first settled.
    pub processed_at: Option<Timestamp>,
}

impl SyncRecord {
    /// Returns true once the record has an outcome.
    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }

    /// Records the outcome. Returns false, changing nothing, if the record
    /// was already processed.
    pub fn settle(&mut self, outcome: RecordOutcome, now: Timestamp) -> bool {
        if self.is_processed() || outcome == RecordOutcome::Pending {
            return false;
        }
        self.outcome = outcome;
        self.processed_at = Some(now);
        true
    }

    /// Turns a conflict-pending outcome into success once resolved.
    pub fn settle_conflict(&mut self, winner: ConflictWinner) -> SyncResult<()> {
        match self.outcome {
            RecordOutcome::ConflictPending { .. } => {
                self.outcome = RecordOutcome::Succeeded {
                    resolution: Some(winner),
                };
                Ok(())
            }
            _ => Err(SyncError::InvalidStateTransition {
                from: format!("{} {:?}", self.id, self.outcome),
                to: "resolved".into(),
            }),
        }
    }

    /// Builds the ack entry returned to the sender.
    pub fn ack(&self) -> RecordAck {
        RecordAck {
            record_id: self.remote_record_id.unwrap_or(self.id),
            entity_id: self.entity.entity_id.clone(),
            outcome: self.outcome.to_ack(),
        }
    }
}

/// A detected divergence for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Row id.
    pub id: ConflictId,
    /// Store whose replica diverged from HQ.
    pub store_id: StoreId,
    /// Batch carrying the remote version.
    pub batch_id: BatchId,
    /// Record carrying the remote version.
    pub record_id: RecordId,
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity id.
    pub entity_id: EntityId,
    /// This node's version at detection.
    pub local: Version,
    /// The incoming version.
    pub remote: Version,
    /// Policy in force at detection.
    pub policy: ConflictPolicy,
    /// Winning side, once resolved.
    pub resolution: Option<ConflictWinner>,
    /// Resolver's reason tag.
    pub reason: Option<String>,
    /// Value chosen by an operator.
    pub resolved_payload: Option<Vec<u8>>,
    /// Operator who resolved a manual conflict.
    pub resolved_by: Option<String>,
    /// Operator notes.
    pub notes: Option<String>,
    /// Immutable once true.
    pub is_resolved: bool,
    /// Auto-resolved but kept in the review backlog.
    pub flagged_for_review: bool,
    /// Detection time.
    pub detected_at: Timestamp,
    /// Resolution time.
    pub resolved_at: Option<Timestamp>,
}

impl SyncConflict {
    /// Returns true if an operator should look at the conflict.
    pub fn needs_attention(&self) -> bool {
        !self.is_resolved || self.flagged_for_review
    }

    /// Records an automatic resolution.
    pub fn resolve_automatically(
        &mut self,
        resolution: &Resolution,
        now: Timestamp,
    ) -> SyncResult<()> {
        self.ensure_open()?;
        if !resolution.is_automatic() {
            return Err(SyncError::MissingResolver(self.id));
        }
        self.resolution = Some(resolution.winner);
        self.reason = Some(resolution.reason.to_string());
        self.is_resolved = true;
        self.resolved_at = Some(now);
        Ok(())
    }

    /// Records an operator's resolution.
    pub fn resolve_manually(
        &mut self,
        payload: Option<Vec<u8>>,
        user: &str,
        notes: Option<String>,
        now: Timestamp,
    ) -> SyncResult<()> {
        self.ensure_open()?;
        if user.trim().is_empty() {
            return Err(SyncError::MissingResolver(self.id));
        }
        self.resolution = Some(ConflictWinner::Manual);
        self.reason = Some("operator".into());
        self.resolved_payload = payload;
        self.resolved_by = Some(user.to_string());
        self.notes = notes;
        self.is_resolved = true;
        self.resolved_at = Some(now);
        Ok(())
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.is_resolved {
            Err(SyncError::ConflictAlreadyResolved(self.id))
        } else {
            Ok(())
        }
    }
}

/// Operation named in a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogOperation {
    /// A change entered the queue.
    Enqueue,
    /// A batch was assembled.
    Assemble,
    /// A batch was sent and acknowledged.
    Send,
    /// An incoming batch was applied.
    Apply,
    /// A conflict was resolved.
    Resolve,
    /// A queue item was scheduled for retry.
    Retry,
    /// A queue item was dead-lettered.
    DeadLetter,
    /// An operator cancelled an item or batch.
    Cancel,
    /// An operator replayed a dead-lettered item.
    Replay,
    /// Interrupted work was recovered at open.
    Recover,
    /// A full sync cycle.
    Cycle,
    /// The journal was compacted.
    Compact,
}

impl LogOperation {
    /// Returns the lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogOperation::Enqueue => "enqueue",
            LogOperation::Assemble => "assemble",
            LogOperation::Send => "send",
            LogOperation::Apply => "apply",
            LogOperation::Resolve => "resolve",
            LogOperation::Retry => "retry",
            LogOperation::DeadLetter => "dead-letter",
            LogOperation::Cancel => "cancel",
            LogOperation::Replay => "replay",
            LogOperation::Recover => "recover",
            LogOperation::Cycle => "cycle",
            LogOperation::Compact => "compact",
        }
    }
}

/// Append-only audit row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    /// Row id.
    pub id: LogId,
    /// Store concerned, if any.
    pub store_id: Option<StoreId>,
    /// Operation.
    pub operation: LogOperation,
    /// Whether it succeeded.
    pub success: bool,
    /// Error detail on failure.
    pub error: Option<String>,
    /// Free-form detail (batch id, counts).
    pub detail: String,
    /// Duration in milliseconds.
    pub duration_ms: u64,
    /// When it was written.
    pub at: Timestamp,
}

/// Last confirmed common sync point of one entity for one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPoint {
    /// Store.
    pub store_id: StoreId,
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity id.
    pub entity_id: EntityId,
    /// Timestamp both replicas agreed on.
    pub at: Timestamp,
}

/// An operator resolution recorded for the next cycle to apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionRequest {
    /// Row id.
    pub id: u64,
    /// Conflict to resolve.
    pub conflict_id: ConflictId,
    /// Chosen value; `None` resolves to a delete.
    pub payload: Option<Vec<u8>>,
    /// Resolving user.
    pub user: String,
    /// Notes.
    pub notes: Option<String>,
    /// When it was recorded.
    pub requested_at: Timestamp,
}
