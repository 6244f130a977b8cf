//! In-process transport from a store engine to an [`HqServer`].

use crate::server::HqServer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tillsync_engine::{BatchTransport, LocalRepository, SyncError, SyncResult};
use tillsync_protocol::{BatchAck, BatchEnvelope, StoreId};

/// Connects a store's [`SyncEngine`](tillsync_engine::SyncEngine) to an HQ
/// server in the same process.
///
/// Batches are round-tripped through their CBOR encoding so the store sees
/// exactly what a network peer would.
pub struct LoopbackTransport<R: LocalRepository> {
    server: Arc<HqServer<R>>,
    connected: AtomicBool,
}

impl<R: LocalRepository> LoopbackTransport<R> {
    /// Creates a transport to `server`.
    pub fn new(server: Arc<HqServer<R>>) -> Self {
        Self {
            server,
            connected: AtomicBool::new(true),
        }
    }

    /// Simulates the link going down or coming back.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn ensure_connected(&self) -> SyncResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SyncError::transport_retryable("HQ link down"))
        }
    }
}

fn wire(batch: &BatchEnvelope) -> SyncResult<BatchEnvelope> {
    Ok(BatchEnvelope::decode(&batch.encode()?)?)
}

impl<R: LocalRepository> BatchTransport for LoopbackTransport<R> {
    fn send(&self, batch: &BatchEnvelope) -> SyncResult<BatchAck> {
        self.ensure_connected()?;
        let report = self
            .server
            .handle_upload(&wire(batch)?)
            .map_err(|e| e.into_sync_error())?;
        Ok(BatchAck::decode(&report.ack.encode()?)?)
    }

    fn receive(&self, store: StoreId) -> SyncResult<Option<BatchEnvelope>> {
        self.ensure_connected()?;
        match self.server.handle_pull(store).map_err(|e| e.into_sync_error())? {
            Some(batch) => Ok(Some(wire(&batch)?)),
            None => Ok(None),
        }
    }

    fn acknowledge(&self, ack: &BatchAck) -> SyncResult<()> {
        self.ensure_connected()?;
        let ack = BatchAck::decode(&ack.encode()?)?;
        self.server
            .handle_ack(&ack)
            .map(|_| ())
            .map_err(|e| e.into_sync_error())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
