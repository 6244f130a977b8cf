//! Store-side sync engine.
//!
//! One cycle applies deferred operator resolutions, uploads the queue batch by
//! batch, then applies whatever the peer has waiting for this store.

use crate::error::{SyncError, SyncResult};
use crate::model::BatchStatus;
use crate::node::{AckSummary, SyncNode};
use crate::processor::{reject_all, ApplyReport};
use crate::repository::LocalRepository;
use crate::transport::BatchTransport;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tillsync_protocol::StoreId;
use tracing::{error, info, warn};

/// Upper bound on download batches applied in one cycle.
pub const MAX_DOWNLOADS_PER_CYCLE: usize = 64;

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Engine is idle, not syncing.
    Idle,
    /// Engine is applying recorded operator resolutions.
    Resolving,
    /// Engine is sending queued changes.
    Uploading,
    /// Engine is applying batches from the peer.
    Downloading,
    /// Engine has completed a sync cycle.
    Synced,
    /// Engine encountered an error.
    Error,
}

impl SyncState {
    /// Returns true if the engine is in an active sync state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Resolving | SyncState::Uploading | SyncState::Downloading
        )
    }

    /// Returns true if the engine can start a new sync.
    pub fn can_start_sync(&self) -> bool {
        matches!(self, SyncState::Idle | SyncState::Synced | SyncState::Error)
    }
}

/// Statistics about sync cycles.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Total number of sync cycles completed.
    pub cycles_completed: u64,
    /// Outbound batches acknowledged.
    pub batches_sent: u64,
    /// Inbound batches applied.
    pub batches_received: u64,
    /// Queue items completed by the peer.
    pub records_uploaded: u64,
    /// Inbound records applied.
    pub records_downloaded: u64,
    /// Records left waiting on an operator, on either side.
    pub conflicts_held: u64,
    /// Retries scheduled.
    pub retries: u64,
    /// Last successful sync time.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Result of a sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncCycleResult {
    /// The store's sync is disabled; nothing ran.
    pub skipped: bool,
    /// Deferred resolutions applied.
    pub resolutions_applied: usize,
    /// Outbound batches sent.
    pub batches_sent: u32,
    /// Effect of the acks on the queue.
    pub upload: AckSummary,
    /// Inbound batches applied.
    pub batches_received: u32,
    /// Inbound records applied.
    pub applied: u32,
    /// Inbound records failed.
    pub failed: u32,
    /// Inbound records waiting on an operator.
    pub conflicts: u32,
    /// Duration of the sync cycle.
    pub duration: Duration,
}

impl SyncCycleResult {
    fn add_upload(&mut self, summary: AckSummary) {
        self.upload.completed += summary.completed;
        self.upload.held += summary.held;
        self.upload.retried += summary.retried;
        self.upload.dead_lettered += summary.dead_lettered;
    }

    fn add_download(&mut self, report: &ApplyReport) {
        if !report.replayed {
            self.applied += report.applied;
            self.failed += report.failed;
            self.conflicts += report.conflicts;
        }
        self.batches_received += 1;
    }
}

/// The sync engine drives one store node against HQ.
pub struct SyncEngine<T: BatchTransport, R: LocalRepository> {
    store_id: StoreId,
    node: Arc<SyncNode<R>>,
    transport: Arc<T>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
}

impl<T: BatchTransport, R: LocalRepository> SyncEngine<T, R> {
    /// Creates an engine for a store node.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Config` for an HQ node.
    pub fn new(node: Arc<SyncNode<R>>, transport: Arc<T>) -> SyncResult<Self> {
        let store_id = node
            .kind()
            .store_id()
            .ok_or_else(|| SyncError::Config("the sync engine runs on store nodes".into()))?;
        Ok(Self {
            store_id,
            node,
            transport,
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
        })
    }

    /// Returns the store this engine syncs.
    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    /// Returns the node.
    pub fn node(&self) -> &Arc<SyncNode<R>> {
        &self.node
    }

    /// Returns the transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Cancels any ongoing sync at the next record or batch boundary.
    pub fn cancel(&self) {
        self.node.cancel();
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.node.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    /// Claims the engine for one cycle; a second caller gets an error.
    fn begin_cycle(&self) -> SyncResult<()> {
        let mut state = self.state.write();
        if !state.can_start_sync() {
            return Err(SyncError::InvalidStateTransition {
                from: format!("{:?}", *state),
                to: "sync".into(),
            });
        }
        *state = SyncState::Resolving;
        Ok(())
    }

    /// Performs a full sync cycle: resolve, upload, download.
    ///
    /// The outcome is recorded in the store's configuration
    /// (`last_attempted_sync`, `last_successful_sync`, `last_sync_error`)
    /// and in the sync log.
    pub fn sync(&self) -> SyncResult<SyncCycleResult> {
        if !self.node.configuration(self.store_id)?.enabled {
            return Ok(SyncCycleResult {
                skipped: true,
                ..SyncCycleResult::default()
            });
        }
        self.begin_cycle()?;
        self.node.reset_cancel();

        let start = Instant::now();
        let attempted_at = self.node.now();
        let mut result = SyncCycleResult::default();
        let outcome = self.run_cycle(&mut result);
        result.duration = start.elapsed();

        match outcome {
            Ok(()) => {
                self.node
                    .record_cycle(self.store_id, attempted_at, None, result.duration)?;
                self.set_state(SyncState::Synced);
                {
                    let mut stats = self.stats.write();
                    stats.cycles_completed += 1;
                    stats.last_sync_time = Some(Instant::now());
                    stats.last_error = None;
                }
                info!(
                    store = %self.store_id,
                    sent = result.batches_sent,
                    received = result.batches_received,
                    completed = result.upload.completed,
                    applied = result.applied,
                    duration_ms = result.duration.as_millis() as u64,
                    "sync cycle finished"
                );
                Ok(result)
            }
            Err(e) => {
                self.set_state(SyncState::Error);
                self.stats.write().last_error = Some(e.to_string());
                if let Err(log_err) =
                    self.node
                        .record_cycle(self.store_id, attempted_at, Some(&e), result.duration)
                {
                    warn!(store = %self.store_id, error = %log_err, "could not record cycle");
                }
                error!(store = %self.store_id, error = %e, "sync cycle failed");
                Err(e)
            }
        }
    }

    fn run_cycle(&self, result: &mut SyncCycleResult) -> SyncResult<()> {
        self.set_state(SyncState::Resolving);
        result.resolutions_applied = self.node.apply_pending_resolutions()?;
        self.check_cancelled()?;

        if !self.transport.is_connected() {
            return Err(SyncError::transport_retryable("HQ unreachable"));
        }

        self.set_state(SyncState::Uploading);
        self.upload(result)?;
        self.check_cancelled()?;

        self.set_state(SyncState::Downloading);
        self.download(result)
    }

    /// Sends every item due at the start of the upload phase.
    ///
    /// A retryable transport error ends the cycle after its batch is
    /// scheduled for retry; a permanent one dead-letters the batch and the
    /// phase continues with the next.
    fn upload(&self, result: &mut SyncCycleResult) -> SyncResult<()> {
        let mut budget = self.node.health(self.store_id)?.pending;
        while budget > 0 {
            self.check_cancelled()?;
            let Some(batch) = self.node.assemble_next(self.store_id)? else {
                break;
            };
            budget = budget.saturating_sub(batch.envelope.len());
            self.node.begin_send(batch.batch_id)?;

            match self.transport.send(&batch.envelope) {
                Ok(ack) => {
                    let summary = self.node.finalize_ack(&ack)?;
                    result.batches_sent += 1;
                    result.add_upload(summary);
                    let mut stats = self.stats.write();
                    stats.batches_sent += 1;
                    stats.records_uploaded += u64::from(summary.completed);
                    stats.conflicts_held += u64::from(summary.held);
                    stats.retries += u64::from(summary.retried);
                }
                Err(e) => {
                    let summary = self.node.fail_batch(batch.batch_id, &e)?;
                    result.add_upload(summary);
                    self.stats.write().retries += u64::from(summary.retried);
                    if e.is_retryable() {
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Applies download batches until the peer has none left.
    fn download(&self, result: &mut SyncCycleResult) -> SyncResult<()> {
        for _ in 0..MAX_DOWNLOADS_PER_CYCLE {
            self.check_cancelled()?;
            let Some(envelope) = self.transport.receive(self.store_id)? else {
                return Ok(());
            };

            let (ack, cancelled) = match self.node.apply_batch(&envelope) {
                Ok(report) => {
                    result.add_download(&report);
                    if !report.replayed {
                        let mut stats = self.stats.write();
                        stats.batches_received += 1;
                        stats.records_downloaded += u64::from(report.applied);
                        stats.conflicts_held += u64::from(report.conflicts);
                    }
                    (report.ack, report.status == BatchStatus::Cancelled)
                }
                Err(e) => {
                    warn!(
                        store = %self.store_id,
                        batch = %envelope.batch_id,
                        error = %e,
                        "download batch rejected"
                    );
                    (reject_all(&envelope, &e), false)
                }
            };
            self.transport.acknowledge(&ack)?;
            if cancelled {
                return Err(SyncError::Cancelled);
            }
        }
        Ok(())
    }
}
