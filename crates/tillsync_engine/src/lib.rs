//! # tillsync engine
//!
//! Store ↔ HQ synchronization and conflict handling for retail nodes.
//!
//! This crate provides:
//! - Per-store change queue with priority tiers and retry state
//! - Batch assembly, one (store, direction, entity type) at a time
//! - Record-by-record batch apply with conflict detection and resolution
//! - Exponential backoff and dead-lettering
//! - A durable, journaled sync store with crash recovery
//! - Store-side sync engine and a tokio worker pool
//! - Operator queries and interventions
//!
//! ## Architecture
//!
//! A [`SyncNode`] is one replica (HQ or a store). Local changes enter its
//! queue through [`SyncNode::enqueue`]; the assembler claims due items into
//! a batch; the transport carries the batch to the peer, whose
//! [`SyncNode::apply_batch`] applies it and answers with a per-record ack;
//! [`SyncNode::finalize_ack`] settles the sender's queue from that ack.
//!
//! ## Key Invariants
//!
//! - A queue item is claimed by at most one unfinished batch
//! - A record's outcome is written exactly once; replays return it unchanged
//! - `success_count + failed_count <= record_count` for every batch
//! - Per-entity sync points only move forward
//! - A conflict never resolves to `Manual` without a user

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod assembler;
mod clock;
mod config;
mod dir;
mod engine;
mod error;
mod locks;
mod log;
mod model;
mod node;
mod operator;
mod processor;
mod queue;
mod repository;
mod retry;
mod rules;
mod store;
mod transport;
mod worker;

pub use assembler::AssembledBatch;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{NodeConfig, NodeKind, RetryConfig, SyncConfiguration, CONFIG_FILE};
pub use dir::JOURNAL_FILE;
pub use engine::{SyncCycleResult, SyncEngine, SyncState, SyncStats, MAX_DOWNLOADS_PER_CYCLE};
pub use error::{ErrorClass, SyncError, SyncResult};
pub use log::{LogEvent, MetricsSnapshot, SyncMetrics};
pub use model::{
    BatchOrigin, BatchStatus, LogOperation, QueueStatus, RecordOutcome, ResolutionRequest,
    SyncBatch, SyncConflict, SyncLogEntry, SyncPoint, SyncQueueItem, SyncRecord,
};
pub use node::{AckSummary, RecoveryReport, SyncNode};
pub use operator::{batch_counts, open_batches, SyncHealth};
pub use processor::{reject_all, ApplyReport};
pub use queue::{queue_order, Change};
pub use repository::{LocalRepository, MemoryRepository};
pub use retry::{RetryDecision, RetryScheduler};
pub use rules::RuleTable;
pub use store::{CompactionStats, JournalLine, Row, RowKey, SyncStore, Tables, Txn};
pub use transport::{ack_all, BatchTransport, MockReply, MockTransport};
pub use worker::SyncWorkerPool;

/// Operator functions that work on a bare [`SyncStore`].
pub mod ops {
    pub use crate::operator::{
        cancel_batch, cancel_item, health, list_conflicts, replay_failed, request_resolution,
    };
    pub use crate::queue::snapshot as queue_snapshot;
}
