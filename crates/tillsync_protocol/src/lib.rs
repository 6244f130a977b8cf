//! # tillsync protocol
//!
//! Types shared by store nodes and HQ.
//!
//! This crate provides:
//! - Identifiers and the logical [`Timestamp`]
//! - [`SyncEntityRule`] with direction, [`ConflictPolicy`] and [`Priority`]
//! - The typed [`EntityEnvelope`] / [`BatchEnvelope`] and [`BatchAck`]
//!   with CBOR codecs
//! - The conflict [`detect`]or and the [`ConflictResolver`] strategies
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod ack;
mod codec;
mod conflict;
mod envelope;
mod error;
mod ids;
mod rule;

pub use ack::{AckOutcome, BatchAck, RecordAck};
pub use codec::{from_cbor, to_cbor};
pub use conflict::{
    detect, ConflictContext, ConflictResolver, ConflictWinner, Detection, HqWins,
    LatestTimestampWins, ManualReview, NodeRole, Resolution, StoreWins, Version,
};
pub use envelope::{
    BatchDirection, BatchEnvelope, ChangeOperation, EntityEnvelope, RecordEnvelope,
    SCHEMA_VERSION,
};
pub use error::{ProtocolError, ProtocolResult};
pub use ids::{BatchId, ConflictId, EntityId, EntityType, LogId, QueueItemId, RecordId, StoreId, Timestamp};
pub use rule::{ConflictPolicy, Priority, SyncDirection, SyncEntityRule};
