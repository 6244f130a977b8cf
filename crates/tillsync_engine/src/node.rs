//! A sync node: one HQ or store replica with its durable sync state.

use crate::assembler::{self, AssembledBatch};
use crate::clock::{Clock, SystemClock};
use crate::config::{NodeConfig, NodeKind, SyncConfiguration};
use crate::error::{SyncError, SyncResult};
use crate::locks::EntityLockTable;
use crate::log::{LogEvent, MetricsSnapshot, SyncMetrics};
use crate::model::{
    BatchOrigin, BatchStatus, LogOperation, QueueStatus, RecordOutcome, SyncConflict,
    SyncQueueItem,
};
use crate::operator::{self, SyncHealth};
use crate::processor::{ApplyReport, BatchProcessor};
use crate::queue::{self, Change};
use crate::repository::LocalRepository;
use crate::retry::{RetryDecision, RetryScheduler};
use crate::store::{CompactionStats, SyncStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tillsync_protocol::{
    BatchAck, BatchDirection, BatchEnvelope, BatchId, ConflictId, ConflictWinner, EntityType,
    NodeRole, ProtocolError, QueueItemId, StoreId, Timestamp,
};
use tracing::{info, warn};

/// What an ack did to the sender's queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckSummary {
    /// Items completed.
    pub completed: u32,
    /// Items parked as conflicts on the peer.
    pub held: u32,
    /// Items scheduled for another attempt.
    pub retried: u32,
    /// Items dead-lettered.
    pub dead_lettered: u32,
    /// The batch was already finished; nothing changed.
    pub duplicate: bool,
}

/// Work found unfinished when the node opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Outbound batches cancelled.
    pub outbound_cancelled: usize,
    /// Queue items returned to `Pending`.
    pub items_released: usize,
    /// Inbound batches resumed.
    pub inbound_resumed: usize,
}

/// One replica: its role, durable sync state and local repository.
pub struct SyncNode<R: LocalRepository> {
    kind: NodeKind,
    store: SyncStore,
    repo: Arc<R>,
    clock: Arc<dyn Clock>,
    metrics: SyncMetrics,
    locks: EntityLockTable,
    cancelled: AtomicBool,
    recovery: RecoveryReport,
}

impl<R: LocalRepository> SyncNode<R> {
    /// Opens the node described by `config`, registering its store
    /// configurations and recovering unfinished work.
    pub fn open(config: &NodeConfig, repo: Arc<R>) -> SyncResult<Self> {
        config.validate()?;
        let store = SyncStore::open(&config.data_dir, config.sync_on_write)?;
        let node = Self::with_store(config.node, store, repo, Arc::new(SystemClock))?;
        for store_config in &config.stores {
            node.configure(store_config.clone())?;
        }
        Ok(node)
    }

    /// Creates a node over an opened store.
    pub fn with_store(
        kind: NodeKind,
        store: SyncStore,
        repo: Arc<R>,
        clock: Arc<dyn Clock>,
    ) -> SyncResult<Self> {
        let mut node = Self {
            kind,
            store,
            repo,
            clock,
            metrics: SyncMetrics::new(),
            locks: EntityLockTable::new(),
            cancelled: AtomicBool::new(false),
            recovery: RecoveryReport::default(),
        };
        node.recovery = node.recover()?;
        Ok(node)
    }

    /// Creates a node with a volatile store.
    pub fn in_memory(kind: NodeKind, repo: Arc<R>, clock: Arc<dyn Clock>) -> SyncResult<Self> {
        Self::with_store(kind, SyncStore::open_in_memory()?, repo, clock)
    }

    /// Returns the node kind.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Returns the role used for conflict resolution.
    pub fn role(&self) -> NodeRole {
        self.kind.role()
    }

    /// Returns the durable store.
    pub fn store(&self) -> &SyncStore {
        &self.store
    }

    /// Returns the local repository.
    pub fn repository(&self) -> &Arc<R> {
        &self.repo
    }

    /// Returns the current time of the node's clock.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Returns the counters since the node opened.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub(crate) fn counters(&self) -> &SyncMetrics {
        &self.metrics
    }

    /// Returns what was recovered at open.
    pub fn recovery(&self) -> RecoveryReport {
        self.recovery
    }

    /// Direction of changes this node sends.
    pub fn outbound_direction(&self) -> BatchDirection {
        match self.kind {
            NodeKind::Hq => BatchDirection::Download,
            NodeKind::Store(_) => BatchDirection::Upload,
        }
    }

    fn processor(&self) -> BatchProcessor<'_, R> {
        BatchProcessor {
            store: &self.store,
            repo: self.repo.as_ref(),
            locks: &self.locks,
            clock: self.clock.as_ref(),
            metrics: &self.metrics,
            role: self.role(),
            cancel: &self.cancelled,
        }
    }

    // ---------------------------------------------------------------
    // Configuration
    // ---------------------------------------------------------------

    /// Adds or replaces a store configuration, keeping its sync health.
    pub fn configure(&self, mut config: SyncConfiguration) -> SyncResult<()> {
        config.validate()?;
        if let NodeKind::Store(own) = self.kind {
            if config.store_id != own {
                return Err(SyncError::Config(format!(
                    "{own} cannot hold the configuration of {}",
                    config.store_id
                )));
            }
        }
        self.store.transact(|txn| {
            if let Ok(previous) = txn.config(config.store_id) {
                config.inherit_health(&previous);
            }
            txn.put(config);
            Ok(())
        })
    }

    /// Returns the configuration of a store.
    pub fn configuration(&self, store_id: StoreId) -> SyncResult<SyncConfiguration> {
        self.store
            .read()
            .configs
            .get(&store_id)
            .cloned()
            .ok_or(SyncError::UnknownStore(store_id))
    }

    /// Enables or disables an entity rule at runtime.
    pub fn set_rule_enabled(
        &self,
        store_id: StoreId,
        entity_type: &EntityType,
        enabled: bool,
    ) -> SyncResult<()> {
        self.store.transact(|txn| {
            let mut config = txn.config(store_id)?;
            config.rules.set_enabled(entity_type, enabled)?;
            txn.put(config);
            Ok(())
        })?;
        info!(store = %store_id, %entity_type, enabled, "rule toggled");
        Ok(())
    }

    // ---------------------------------------------------------------
    // Change producer
    // ---------------------------------------------------------------

    /// Queues a local change of a store node for upload.
    pub fn enqueue(&self, change: Change) -> SyncResult<QueueItemId> {
        match self.kind {
            NodeKind::Store(own) => self.enqueue_for(own, change),
            NodeKind::Hq => Err(SyncError::Config(
                "an HQ node must name the target store".into(),
            )),
        }
    }

    /// Queues a change for one store in this node's outbound direction.
    pub fn enqueue_for(&self, store_id: StoreId, change: Change) -> SyncResult<QueueItemId> {
        let now = self.clock.now();
        let direction = self.outbound_direction();
        self.store
            .transact(|txn| queue::enqueue(txn, store_id, direction, change, now))
    }

    // ---------------------------------------------------------------
    // Inbound
    // ---------------------------------------------------------------

    /// Applies a batch received from the peer.
    pub fn apply_batch(&self, envelope: &BatchEnvelope) -> SyncResult<ApplyReport> {
        if let NodeKind::Store(own) = self.kind {
            if envelope.store_id != own {
                return Err(ProtocolError::InvalidEnvelope(format!(
                    "batch for {} delivered to {own}",
                    envelope.store_id
                ))
                .into());
            }
        }
        self.processor().apply(envelope)
    }

    // ---------------------------------------------------------------
    // Outbound
    // ---------------------------------------------------------------

    /// Assembles the next outbound batch for `store_id`, highest priority
    /// type first. Returns `None` when nothing is due.
    pub fn assemble_next(&self, store_id: StoreId) -> SyncResult<Option<AssembledBatch>> {
        let now = self.clock.now();
        let direction = self.outbound_direction();
        self.store.transact(|txn| {
            match assembler::next_entity_type(txn.tables(), store_id, direction, now) {
                Some(entity_type) => assembler::assemble(txn, store_id, direction, &entity_type, now),
                None => Ok(None),
            }
        })
    }

    /// Assembles a batch for one entity type.
    pub fn assemble(
        &self,
        store_id: StoreId,
        entity_type: &EntityType,
    ) -> SyncResult<Option<AssembledBatch>> {
        let now = self.clock.now();
        let direction = self.outbound_direction();
        self.store
            .transact(|txn| assembler::assemble(txn, store_id, direction, entity_type, now))
    }

    /// Marks an assembled batch as handed to the transport.
    pub fn begin_send(&self, batch_id: BatchId) -> SyncResult<()> {
        let now = self.clock.now();
        self.store.transact(|txn| {
            let mut batch = txn.batch(batch_id)?;
            batch.start(now)?;
            txn.put(batch);
            Ok(())
        })
    }

    /// Settles an outbound batch from the peer's ack.
    ///
    /// Records missing from the ack count as transient failures.
    pub fn finalize_ack(&self, ack: &BatchAck) -> SyncResult<AckSummary> {
        let now = self.clock.now();
        let summary = self.store.transact(|txn| {
            let mut batch = txn.batch(ack.batch_id)?;
            if batch.origin != BatchOrigin::Outbound || batch.store_id != ack.store_id {
                return Err(ProtocolError::InvalidEnvelope(format!(
                    "ack for {} of {} does not match an outbound batch",
                    ack.batch_id, ack.store_id
                ))
                .into());
            }
            if batch.status.is_terminal() {
                return Ok(AckSummary {
                    duplicate: true,
                    ..AckSummary::default()
                });
            }
            batch.start(now)?;
            let scheduler = RetryScheduler::new(txn.config(batch.store_id)?.retry());
            let records: Vec<_> = txn
                .tables()
                .records_of(batch.id)
                .into_iter()
                .filter(|r| !r.is_processed())
                .cloned()
                .collect();

            let mut summary = AckSummary::default();
            for mut record in records {
                let outcome = ack
                    .outcome_for(record.id)
                    .map(RecordOutcome::from_ack)
                    .unwrap_or_else(|| RecordOutcome::Failed {
                        error: "record missing from ack".into(),
                        permanent: false,
                    });
                record.settle(outcome.clone(), now);
                batch.count(&outcome, now);
                let item_id = record.queue_item;
                let entity = record.entity.clone();
                txn.put(record);

                let Some(item_id) = item_id else { continue };
                let mut item = txn.item(item_id)?;
                if item.status != QueueStatus::InProgress || item.batch_id != Some(batch.id) {
                    continue;
                }
                match outcome {
                    RecordOutcome::Succeeded { resolution } => {
                        item.transition(QueueStatus::Completed)?;
                        item.last_error = None;
                        if matches!(resolution, None | Some(ConflictWinner::Local)) {
                            txn.advance_sync_point(
                                batch.store_id,
                                &entity.entity_type,
                                &entity.entity_id,
                                entity.timestamp,
                            );
                        }
                        summary.completed += 1;
                    }
                    RecordOutcome::ConflictPending { conflict_id } => {
                        item.transition(QueueStatus::Conflict)?;
                        item.last_error = Some(format!("held by peer as {conflict_id}"));
                        summary.held += 1;
                    }
                    RecordOutcome::Failed { error, permanent } => {
                        let decision = scheduler.record_failure(&mut item, &error, permanent, now)?;
                        count_decision(txn, &mut summary, item.store_id, item_id, decision, &error, now);
                    }
                    RecordOutcome::Pending => {}
                }
                txn.put(item);
            }

            let detail = format!(
                "{} completed={} held={} retried={} dead={}",
                batch.id, summary.completed, summary.held, summary.retried, summary.dead_lettered
            );
            let store_id = batch.store_id;
            txn.put(batch);
            txn.log(LogEvent::new(LogOperation::Send, store_id, detail), now);
            Ok(summary)
        })?;

        if !summary.duplicate {
            self.metrics.add_batches_sent(1);
            self.metrics.add_retries_scheduled(u64::from(summary.retried));
            self.metrics.add_dead_letters(u64::from(summary.dead_lettered));
            info!(
                batch = %ack.batch_id,
                store = %ack.store_id,
                completed = summary.completed,
                held = summary.held,
                retried = summary.retried,
                dead = summary.dead_lettered,
                "batch acknowledged"
            );
        }
        Ok(summary)
    }

    /// Fails every unsettled record of an outbound batch after a
    /// batch-level error.
    ///
    /// Retryable errors put the items back with backoff; anything else
    /// dead-letters them.
    pub fn fail_batch(&self, batch_id: BatchId, error: &SyncError) -> SyncResult<AckSummary> {
        let now = self.clock.now();
        let permanent = !error.is_retryable();
        let message = error.to_string();
        let summary = self.store.transact(|txn| {
            let mut batch = txn.batch(batch_id)?;
            if batch.status.is_terminal() {
                return Ok(AckSummary {
                    duplicate: true,
                    ..AckSummary::default()
                });
            }
            let scheduler = RetryScheduler::new(txn.config(batch.store_id)?.retry());
            let records: Vec<_> = txn
                .tables()
                .records_of(batch_id)
                .into_iter()
                .filter(|r| !r.is_processed())
                .cloned()
                .collect();

            let mut summary = AckSummary::default();
            for mut record in records {
                let outcome = RecordOutcome::Failed {
                    error: message.clone(),
                    permanent,
                };
                record.settle(outcome.clone(), now);
                batch.count(&outcome, now);
                let item_id = record.queue_item;
                txn.put(record);

                let Some(item_id) = item_id else { continue };
                let mut item = txn.item(item_id)?;
                if item.status != QueueStatus::InProgress || item.batch_id != Some(batch_id) {
                    continue;
                }
                let decision = scheduler.record_failure(&mut item, &message, permanent, now)?;
                count_decision(txn, &mut summary, item.store_id, item_id, decision, &message, now);
                txn.put(item);
            }
            batch.error = Some(message.clone());
            let store_id = batch.store_id;
            txn.put(batch);
            txn.log(
                LogEvent::new(LogOperation::Send, store_id, batch_id.to_string()).failed(&message),
                now,
            );
            Ok(summary)
        })?;

        self.metrics.add_retries_scheduled(u64::from(summary.retried));
        self.metrics.add_dead_letters(u64::from(summary.dead_lettered));
        warn!(batch = %batch_id, error = %message, permanent, "batch failed");
        Ok(summary)
    }

    /// Fails outbound batches that have waited longer than `timeout` for
    /// an ack. Returns how many were expired.
    pub fn expire_in_flight(&self, timeout: Duration) -> SyncResult<usize> {
        let now = self.clock.now();
        let stale: Vec<BatchId> = self
            .store
            .read()
            .batches
            .values()
            .filter(|b| b.origin == BatchOrigin::Outbound && b.status == BatchStatus::InProgress)
            .filter(|b| b.started_at.is_some_and(|t| now.duration_since(t) >= timeout))
            .map(|b| b.id)
            .collect();
        for batch_id in &stale {
            self.fail_batch(*batch_id, &SyncError::Timeout)?;
        }
        Ok(stale.len())
    }

    // ---------------------------------------------------------------
    // Operator
    // ---------------------------------------------------------------

    /// Returns the conflicts of a store that need attention.
    pub fn list_conflicts(&self, store_id: StoreId) -> Vec<SyncConflict> {
        operator::list_conflicts(&self.store.read(), store_id)
    }

    /// Resolves a manual conflict with the operator's chosen value.
    ///
    /// `payload` of `None` resolves to a delete.
    pub fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        payload: Option<Vec<u8>>,
        user: &str,
        notes: Option<String>,
    ) -> SyncResult<SyncConflict> {
        self.processor()
            .resolve_manual(conflict_id, payload, user, notes)
    }

    /// Records a resolution for the next cycle.
    pub fn request_resolution(
        &self,
        conflict_id: ConflictId,
        payload: Option<Vec<u8>>,
        user: &str,
        notes: Option<String>,
    ) -> SyncResult<u64> {
        operator::request_resolution(&self.store, conflict_id, payload, user, notes, self.now())
    }

    /// Applies every recorded resolution request. Returns how many applied.
    ///
    /// Requests for conflicts that no longer exist or are already resolved
    /// are dropped; requests failing on a transient error stay for the next
    /// cycle.
    pub fn apply_pending_resolutions(&self) -> SyncResult<usize> {
        let requests: Vec<_> = self.store.read().requests.values().cloned().collect();
        let mut applied = 0;
        for request in requests {
            let result = self.resolve_conflict(
                request.conflict_id,
                request.payload.clone(),
                &request.user,
                request.notes.clone(),
            );
            let keep = match &result {
                Ok(_) => {
                    applied += 1;
                    false
                }
                Err(e) if e.is_retryable() => true,
                Err(e) => {
                    warn!(request = request.id, conflict = %request.conflict_id, error = %e, "resolution request dropped");
                    false
                }
            };
            if !keep {
                let now = self.now();
                self.store.transact(|txn| {
                    txn.delete(crate::store::RowKey::Request(request.id));
                    if let Err(e) = &result {
                        txn.log(
                            LogEvent::new(
                                LogOperation::Resolve,
                                None,
                                format!("request {} for {}", request.id, request.conflict_id),
                            )
                            .failed(e),
                            now,
                        );
                    }
                    Ok(())
                })?;
            }
        }
        Ok(applied)
    }

    /// Cancels a queue item.
    pub fn cancel_item(&self, item_id: QueueItemId) -> SyncResult<()> {
        operator::cancel_item(&self.store, item_id, self.now())
    }

    /// Cancels an unfinished batch. Returns the queue items released.
    pub fn cancel_batch(&self, batch_id: BatchId) -> SyncResult<usize> {
        operator::cancel_batch(&self.store, batch_id, self.now())
    }

    /// Replays a dead-lettered item with a fresh retry budget.
    pub fn replay_failed(&self, item_id: QueueItemId) -> SyncResult<()> {
        operator::replay_failed(&self.store, item_id, self.now())
    }

    /// Returns the sync health of a store.
    pub fn health(&self, store_id: StoreId) -> SyncResult<SyncHealth> {
        operator::health(&self.store.read(), store_id)
    }

    /// Returns a store's queue in scheduling order.
    pub fn queue_snapshot(&self, store_id: StoreId) -> Vec<SyncQueueItem> {
        queue::snapshot(&self.store.read(), store_id)
    }

    /// Records the end of a cycle in the store's configuration and log.
    pub fn record_cycle(
        &self,
        store_id: StoreId,
        attempted_at: Timestamp,
        error: Option<&SyncError>,
        duration: Duration,
    ) -> SyncResult<()> {
        let now = self.clock.now();
        self.store.transact(|txn| {
            let mut config = txn.config(store_id)?;
            config.last_attempted_sync = Some(attempted_at);
            let mut event = LogEvent::new(LogOperation::Cycle, store_id, "").took(duration);
            match error {
                None => {
                    config.last_successful_sync = Some(now);
                    config.last_sync_error = None;
                }
                Some(e) => {
                    config.last_sync_error = Some(e.to_string());
                    event = event.failed(e);
                }
            }
            txn.put(config);
            txn.log(event, now);
            Ok(())
        })?;
        self.metrics.add_cycles(1);
        if error.is_some() {
            self.metrics.add_cycles_failed(1);
        }
        Ok(())
    }

    /// Compacts the journal.
    pub fn compact(&self) -> SyncResult<CompactionStats> {
        let started = Instant::now();
        let stats = self.store.compact()?;
        let now = self.now();
        self.store.transact(|txn| {
            txn.log(
                LogEvent::new(
                    LogOperation::Compact,
                    None,
                    format!("{} -> {} bytes", stats.bytes_before, stats.bytes_after),
                )
                .took(started.elapsed()),
                now,
            );
            Ok(())
        })?;
        Ok(stats)
    }

    // ---------------------------------------------------------------
    // Cancellation
    // ---------------------------------------------------------------

    /// Asks running work to stop at the next record boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Clears the cancel request.
    pub fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    /// Returns true if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    // ---------------------------------------------------------------
    // Recovery
    // ---------------------------------------------------------------

    /// Settles batches left unfinished by a crash.
    ///
    /// Outbound batches may or may not have reached the peer; they are
    /// cancelled and their items re-queued, which the peer absorbs as an
    /// in-sync replay. Inbound batches resume from their stored payload.
    fn recover(&self) -> SyncResult<RecoveryReport> {
        let now = self.clock.now();
        let (outbound, inbound): (Vec<_>, Vec<_>) = {
            let tables = self.store.read();
            tables
                .batches
                .values()
                .filter(|b| !b.status.is_terminal())
                .map(|b| (b.id, b.origin, b.payload.clone()))
                .partition(|(_, origin, _)| *origin == BatchOrigin::Outbound)
        };

        let mut report = RecoveryReport::default();
        for (batch_id, _, _) in outbound {
            let released = self.store.transact(|txn| {
                let released = operator::release_batch(txn, batch_id, "interrupted", now)?;
                let store_id = txn.batch(batch_id)?.store_id;
                txn.log(
                    LogEvent::new(
                        LogOperation::Recover,
                        store_id,
                        format!("{batch_id} released={released}"),
                    ),
                    now,
                );
                Ok(released)
            })?;
            report.outbound_cancelled += 1;
            report.items_released += released;
        }

        for (batch_id, _, payload) in inbound {
            match BatchEnvelope::decode(&payload) {
                Ok(envelope) => {
                    self.processor().apply(&envelope)?;
                    report.inbound_resumed += 1;
                }
                Err(e) => {
                    warn!(batch = %batch_id, error = %e, "inbound batch payload unreadable");
                    self.store.transact(|txn| {
                        operator::release_batch(txn, batch_id, "payload unreadable", now)?;
                        Ok(())
                    })?;
                }
            }
        }

        if report != RecoveryReport::default() {
            info!(
                outbound = report.outbound_cancelled,
                released = report.items_released,
                inbound = report.inbound_resumed,
                "recovered unfinished batches"
            );
        }
        Ok(report)
    }
}

fn count_decision(
    txn: &mut crate::store::Txn<'_>,
    summary: &mut AckSummary,
    store_id: StoreId,
    item_id: QueueItemId,
    decision: RetryDecision,
    error: &str,
    now: Timestamp,
) {
    let (operation, detail) = match decision {
        RetryDecision::Retry { attempt, at } => {
            summary.retried += 1;
            (LogOperation::Retry, format!("{item_id} attempt={attempt} at={at}"))
        }
        RetryDecision::DeadLetter { attempts, .. } => {
            summary.dead_lettered += 1;
            (LogOperation::DeadLetter, format!("{item_id} attempts={attempts}"))
        }
    };
    txn.log(LogEvent::new(operation, store_id, detail).failed(error), now);
}
