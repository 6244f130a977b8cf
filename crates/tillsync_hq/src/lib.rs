//! # tillsync HQ
//!
//! The HQ side of store synchronization.
//!
//! This crate provides:
//! - Upload handling: batches from many stores applied concurrently
//! - Download pulls with ack timeouts
//! - Per-store session tracking
//! - An in-process loopback transport for store engines
//!
//! # Architecture
//!
//! HQ runs the same engine as the stores: an HQ [`SyncNode`] holds the
//! durable sync state and the processor that applies uploads. The
//! [`HqServer`] only adds admission checks and the request surface a
//! network front end would call.
//!
//! [`SyncNode`]: tillsync_engine::SyncNode
//!
//! # Protocol
//!
//! Each store cycle against HQ is:
//! 1. Upload: the store sends one batch per entity type, HQ answers with a
//!    per-record [`BatchAck`](tillsync_protocol::BatchAck)
//! 2. Pull: the store asks for download batches until none is left
//! 3. Ack: the store returns the per-record outcome of each download

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod handler;
mod loopback;
mod server;

pub use config::HqConfig;
pub use error::{HqError, HqResult};
pub use handler::{HandlerContext, RequestHandler, StoreSession};
pub use loopback::LoopbackTransport;
pub use server::{HqRequest, HqResponse, HqServer};
