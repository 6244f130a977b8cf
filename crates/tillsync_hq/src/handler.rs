//! Request handlers for store uploads, download pulls and acks.

use crate::config::HqConfig;
use crate::error::{HqError, HqResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tillsync_engine::{AckSummary, ApplyReport, LocalRepository, SyncError, SyncNode};
use tillsync_protocol::{BatchAck, BatchDirection, BatchEnvelope, StoreId, Timestamp};
use tracing::{debug, info, warn};

/// Context for request handling.
pub struct HandlerContext<R: LocalRepository> {
    /// Handler configuration.
    pub config: HqConfig,
    /// The HQ node (shared across all handlers).
    pub node: Arc<SyncNode<R>>,
    sessions: RwLock<HashMap<StoreId, StoreSession>>,
}

/// What HQ has seen of one store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSession {
    /// Last request from the store.
    pub last_seen: Option<Timestamp>,
    /// Upload batches applied (replays excluded).
    pub uploads: u64,
    /// Download batches handed out.
    pub downloads: u64,
    /// Download acks settled.
    pub acks: u64,
}

impl<R: LocalRepository> HandlerContext<R> {
    /// Creates a new handler context.
    pub fn new(config: HqConfig, node: Arc<SyncNode<R>>) -> Self {
        Self {
            config,
            node,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the session of a store, if it ever called in.
    pub fn session(&self, store_id: StoreId) -> Option<StoreSession> {
        self.sessions.read().get(&store_id).cloned()
    }

    fn touch(&self, store_id: StoreId, update: impl FnOnce(&mut StoreSession)) {
        let now = self.node.now();
        let mut sessions = self.sessions.write();
        let session = sessions.entry(store_id).or_default();
        session.last_seen = Some(now);
        update(session);
    }

    /// Checks that the store is configured and enabled.
    fn admit(&self, store_id: StoreId) -> HqResult<()> {
        match self.node.configuration(store_id) {
            Ok(config) if config.enabled => Ok(()),
            Ok(_) => Err(HqError::StoreDisabled(store_id)),
            Err(SyncError::UnknownStore(_)) => Err(HqError::UnknownStore(store_id)),
            Err(e) => Err(e.into()),
        }
    }
}

/// Handler for store requests.
///
/// Handlers for different stores run concurrently; records of one entity
/// are serialized by the node's entity locks.
pub struct RequestHandler<R: LocalRepository> {
    context: Arc<HandlerContext<R>>,
}

impl<R: LocalRepository> RequestHandler<R> {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext<R>>) -> Self {
        Self { context }
    }

    /// Applies an upload batch and returns its report.
    ///
    /// A batch delivered again returns the stored outcomes.
    pub fn handle_upload(&self, batch: &BatchEnvelope) -> HqResult<ApplyReport> {
        if batch.direction != BatchDirection::Upload {
            return Err(HqError::InvalidRequest(format!(
                "{} is not an upload",
                batch.batch_id
            )));
        }
        let max = self.context.config.max_upload_records;
        if batch.len() > max {
            return Err(HqError::InvalidRequest(format!(
                "too many records: {} > {max}",
                batch.len()
            )));
        }
        self.context.admit(batch.store_id)?;

        let report = self.context.node.apply_batch(batch)?;
        self.context.touch(batch.store_id, |s| {
            if !report.replayed {
                s.uploads += 1;
            }
        });
        if report.replayed {
            debug!(store = %batch.store_id, batch = %batch.batch_id, "upload replayed");
        }
        Ok(report)
    }

    /// Returns the next download batch for a store, marked as sent.
    ///
    /// Downloads whose ack is overdue are failed first so their items can
    /// be sent again.
    pub fn handle_pull(&self, store_id: StoreId) -> HqResult<Option<BatchEnvelope>> {
        self.context.admit(store_id)?;
        let node = &self.context.node;

        let expired = node.expire_in_flight(self.context.config.ack_timeout)?;
        if expired > 0 {
            warn!(store = %store_id, expired, "download acks overdue");
        }

        let Some(batch) = node.assemble_next(store_id)? else {
            self.context.touch(store_id, |_| {});
            return Ok(None);
        };
        node.begin_send(batch.batch_id)?;
        self.context.touch(store_id, |s| s.downloads += 1);
        info!(
            store = %store_id,
            batch = %batch.batch_id,
            records = batch.envelope.len(),
            "download handed out"
        );
        Ok(Some(batch.envelope))
    }

    /// Settles a download batch from the store's ack.
    ///
    /// The ack must come from a configured, enabled store that owns the
    /// batch.
    pub fn handle_ack(&self, ack: &BatchAck) -> HqResult<AckSummary> {
        self.context.admit(ack.store_id)?;
        let summary = self.context.node.finalize_ack(ack)?;
        if !summary.duplicate {
            self.context.touch(ack.store_id, |s| s.acks += 1);
        }
        Ok(summary)
    }
}
