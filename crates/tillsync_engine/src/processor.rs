//! Batch processor: applies an incoming batch record by record.
//!
//! Each record goes through read-local, detect, resolve, write-local and a
//! store transaction that records the outcome. Outcomes are written exactly
//! once; delivering the same batch again returns the stored outcomes, and a
//! batch interrupted by a crash resumes at its first unprocessed record.

use crate::clock::Clock;
use crate::config::SyncConfiguration;
use crate::error::{SyncError, SyncResult};
use crate::locks::EntityLockTable;
use crate::log::{LogEvent, SyncMetrics};
use crate::model::{
    BatchOrigin, BatchStatus, LogOperation, QueueStatus, RecordOutcome, SyncBatch, SyncConflict,
    SyncRecord,
};
use crate::queue::{self, Change};
use crate::repository::LocalRepository;
use crate::store::{SyncStore, Tables, Txn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tillsync_protocol::{
    detect, AckOutcome, BatchAck, BatchDirection, BatchEnvelope, BatchId, ChangeOperation,
    ConflictContext, ConflictId, ConflictPolicy, ConflictWinner, Detection, EntityEnvelope,
    NodeRole, ProtocolError, QueueItemId, RecordAck, Resolution, StoreId, SyncEntityRule,
    Timestamp, Version,
};
use tracing::{debug, info, warn};

/// Summary of one apply call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    /// Local id of the inbound batch.
    pub batch_id: BatchId,
    /// Final (or current, if cancelled) batch status.
    pub status: BatchStatus,
    /// Records that succeeded.
    pub applied: u32,
    /// Records that failed.
    pub failed: u32,
    /// Records waiting on an operator.
    pub conflicts: u32,
    /// True if the batch had already been fully applied before this call.
    pub replayed: bool,
    /// Ack for the sender.
    pub ack: BatchAck,
}

/// What a record's apply decided, before ids are assigned.
enum Verdict {
    Applied,
    KeptLocal,
    Resolved(ConflictWinner),
    Manual,
}

struct ConflictDraft {
    local: Version,
    remote: Version,
    policy: ConflictPolicy,
    resolution: Option<Resolution>,
    flagged: bool,
}

struct Plan {
    verdict: Verdict,
    write: Option<Version>,
    sync_point: Option<Timestamp>,
    conflict: Option<ConflictDraft>,
    corrective: Option<Change>,
    settle_held: Option<QueueItemId>,
}

impl Plan {
    fn new(verdict: Verdict) -> Self {
        Self {
            verdict,
            write: None,
            sync_point: None,
            conflict: None,
            corrective: None,
            settle_held: None,
        }
    }

    fn adopt(mut self, remote: &Version) -> Self {
        self.write = Some(remote.clone());
        self.sync_point = Some(remote.timestamp);
        self
    }
}

/// Applies inbound batches and operator resolutions to the local repository.
pub struct BatchProcessor<'a, R: LocalRepository + ?Sized> {
    pub(crate) store: &'a SyncStore,
    pub(crate) repo: &'a R,
    pub(crate) locks: &'a EntityLockTable,
    pub(crate) clock: &'a dyn Clock,
    pub(crate) metrics: &'a SyncMetrics,
    pub(crate) role: NodeRole,
    pub(crate) cancel: &'a AtomicBool,
}

impl<R: LocalRepository + ?Sized> BatchProcessor<'_, R> {
    /// Direction of batches this node accepts.
    fn inbound_direction(&self) -> BatchDirection {
        match self.role {
            NodeRole::Hq => BatchDirection::Upload,
            NodeRole::Store => BatchDirection::Download,
        }
    }

    /// Direction of changes this node sends.
    fn outbound_direction(&self) -> BatchDirection {
        match self.role {
            NodeRole::Hq => BatchDirection::Download,
            NodeRole::Store => BatchDirection::Upload,
        }
    }

    /// Applies `envelope` and returns the per-record outcomes.
    ///
    /// # Errors
    ///
    /// Batch-level problems (schema mismatch, wrong direction, unknown
    /// store) reject the whole batch; nothing is recorded. Problems with a
    /// single record fail that record and the batch goes on.
    pub fn apply(&self, envelope: &BatchEnvelope) -> SyncResult<ApplyReport> {
        let started = Instant::now();
        envelope.validate()?;
        if envelope.direction != self.inbound_direction() {
            return Err(ProtocolError::InvalidEnvelope(format!(
                "{:?} batch sent to a {:?} node",
                envelope.direction, self.role
            ))
            .into());
        }

        let now = self.clock.now();
        let (batch_id, resumed) = self
            .store
            .transact(|txn| open_batch(txn, envelope, now))?;

        let (config, pending) = {
            let tables = self.store.read();
            let batch = tables.batches.get(&batch_id).ok_or(SyncError::NotFound {
                kind: "batch",
                id: batch_id.get(),
            })?;
            if batch.status.is_terminal() {
                debug!(batch = %batch_id, remote = %envelope.batch_id, "batch already applied");
                return Ok(build_report(&tables, batch, true));
            }
            let config = tables
                .configs
                .get(&envelope.store_id)
                .cloned()
                .ok_or(SyncError::UnknownStore(envelope.store_id))?;
            let pending: Vec<SyncRecord> = tables
                .records_of(batch_id)
                .into_iter()
                .filter(|r| !r.is_processed())
                .cloned()
                .collect();
            (config, pending)
        };
        if resumed {
            info!(batch = %batch_id, remaining = pending.len(), "resuming interrupted batch");
        }

        for record in pending {
            if self.cancel.load(Ordering::SeqCst) {
                let now = self.clock.now();
                self.store.transact(|txn| {
                    let mut batch = txn.batch(batch_id)?;
                    batch.cancel("cancelled between records", now)?;
                    txn.put(batch);
                    txn.log(
                        LogEvent::new(LogOperation::Cancel, envelope.store_id, batch_id.to_string()),
                        now,
                    );
                    Ok(())
                })?;
                warn!(batch = %batch_id, "apply cancelled");
                break;
            }
            self.apply_record(&config, record)?;
        }

        let report = self.report(batch_id, false)?;
        if report.status.is_terminal() && report.status != BatchStatus::Cancelled {
            self.metrics.add_batches_applied(1);
        }
        let now = self.clock.now();
        self.store.transact(|txn| {
            let detail = format!(
                "{batch_id} from {} {} applied={} failed={} conflicts={}",
                envelope.batch_id, envelope.entity_type, report.applied, report.failed, report.conflicts
            );
            txn.log(
                LogEvent::new(LogOperation::Apply, envelope.store_id, detail).took(started.elapsed()),
                now,
            );
            Ok(())
        })?;
        info!(
            batch = %batch_id,
            store = %envelope.store_id,
            status = %report.status,
            applied = report.applied,
            failed = report.failed,
            conflicts = report.conflicts,
            "batch applied"
        );
        Ok(report)
    }

    fn report(&self, batch_id: BatchId, replayed: bool) -> SyncResult<ApplyReport> {
        let tables = self.store.read();
        let batch = tables.batches.get(&batch_id).ok_or(SyncError::NotFound {
            kind: "batch",
            id: batch_id.get(),
        })?;
        Ok(build_report(&tables, batch, replayed))
    }

    fn apply_record(&self, config: &SyncConfiguration, record: SyncRecord) -> SyncResult<()> {
        let entity = record.entity.clone();
        let rule = match check_record(config, self.inbound_direction(), &entity) {
            Ok(rule) => rule.clone(),
            Err(e) => return self.fail_record(config.store_id, &record, &e),
        };

        let _guard = self.locks.lock(&entity.entity_type, &entity.entity_id);
        let remote = Version {
            payload: entity.payload.clone(),
            timestamp: entity.timestamp,
        };
        let plan = match self.plan(config.store_id, &rule, &entity, &remote) {
            Ok(plan) => plan,
            Err(e) => return self.fail_record(config.store_id, &record, &e),
        };
        if let Some(version) = &plan.write {
            if let Err(e) = self
                .repo
                .put(&entity.entity_type, &entity.entity_id, version)
            {
                return self.fail_record(config.store_id, &record, &e);
            }
        }
        self.commit(config.store_id, &record, plan)
    }

    fn plan(
        &self,
        store_id: StoreId,
        rule: &SyncEntityRule,
        entity: &EntityEnvelope,
        remote: &Version,
    ) -> SyncResult<Plan> {
        let (held, common) = {
            let tables = self.store.read();
            let held = held_item(&tables, store_id, self.outbound_direction(), entity);
            let common = tables.common_point(store_id, &entity.entity_type, &entity.entity_id);
            (held, common)
        };

        if let Some(item) = held {
            // The peer answers a change we sent that it parked as a conflict.
            let mut plan = Plan::new(Verdict::Applied).adopt(remote);
            plan.settle_held = Some(item);
            return Ok(plan);
        }

        let local = self.repo.get(&entity.entity_type, &entity.entity_id)?;
        let detection = detect(local.as_ref(), remote, common);
        debug!(
            entity_type = %entity.entity_type,
            entity_id = %entity.entity_id,
            ?detection,
            %common,
            "record compared"
        );

        let plan = match (detection, local) {
            (Detection::ApplyRemote, _) => Plan::new(Verdict::Applied).adopt(remote),
            (Detection::KeepLocal, _) => Plan::new(Verdict::KeptLocal),
            (Detection::InSync, local) => {
                let mut plan = Plan::new(Verdict::Applied);
                let local_ts = local.map_or(Timestamp::ZERO, |l| l.timestamp);
                plan.sync_point = Some(local_ts.max(remote.timestamp));
                plan
            }
            (Detection::Stale, _) => Plan::new(Verdict::Applied),
            (Detection::Conflict, None) => Plan::new(Verdict::Applied).adopt(remote),
            (Detection::Conflict, Some(local)) => self.resolve(store_id, rule, entity, local, remote),
        };
        Ok(plan)
    }

    fn resolve(
        &self,
        store_id: StoreId,
        rule: &SyncEntityRule,
        entity: &EntityEnvelope,
        local: Version,
        remote: &Version,
    ) -> Plan {
        let policy = rule.conflict_policy;
        let mut draft = ConflictDraft {
            local,
            remote: remote.clone(),
            policy,
            resolution: None,
            flagged: rule.flag_conflicts_for_review,
        };
        if !policy.auto_resolves() {
            let mut plan = Plan::new(Verdict::Manual);
            plan.conflict = Some(draft);
            return plan;
        }

        let resolution = policy.resolver().resolve(&ConflictContext {
            role: self.role,
            local: &draft.local,
            remote,
        });
        debug!(
            store = %store_id,
            entity_id = %entity.entity_id,
            winner = ?resolution.winner,
            reason = resolution.reason,
            "conflict auto-resolved"
        );
        let mut plan = match resolution.winner {
            ConflictWinner::Remote => Plan::new(Verdict::Resolved(ConflictWinner::Remote)).adopt(remote),
            _ => {
                let mut plan = Plan::new(Verdict::Resolved(resolution.winner));
                if self.role == NodeRole::Hq && rule.accepts(BatchDirection::Download) {
                    plan.corrective = Some(change_for(entity, &draft.local, rule));
                }
                plan
            }
        };
        draft.resolution = Some(resolution);
        plan.conflict = Some(draft);
        plan
    }

    fn commit(&self, store_id: StoreId, record: &SyncRecord, plan: Plan) -> SyncResult<()> {
        let now = self.clock.now();
        let entity = &record.entity;
        let detected = plan.conflict.is_some();
        let manual = matches!(plan.verdict, Verdict::Manual);

        let committed = self.store.transact(|txn| {
            let mut stored = txn.record(record.id)?;
            if stored.is_processed() {
                return Ok(false);
            }

            let conflict_id = match &plan.conflict {
                Some(draft) => {
                    let id = txn.next_conflict_id();
                    let mut conflict = SyncConflict {
                        id,
                        store_id,
                        batch_id: record.batch_id,
                        record_id: record.id,
                        entity_type: entity.entity_type.clone(),
                        entity_id: entity.entity_id.clone(),
                        local: draft.local.clone(),
                        remote: draft.remote.clone(),
                        policy: draft.policy,
                        resolution: None,
                        reason: None,
                        resolved_payload: None,
                        resolved_by: None,
                        notes: None,
                        is_resolved: false,
                        flagged_for_review: false,
                        detected_at: now,
                        resolved_at: None,
                    };
                    if let Some(resolution) = &draft.resolution {
                        conflict.resolve_automatically(resolution, now)?;
                        conflict.flagged_for_review = draft.flagged;
                    }
                    txn.put(conflict);
                    Some(id)
                }
                None => None,
            };

            let outcome = outcome_of(&plan.verdict, conflict_id);
            stored.settle(outcome, now);
            let mut batch = txn.batch(record.batch_id)?;
            batch.count(&stored.outcome, now);
            txn.put(stored);
            txn.put(batch);

            if let Some(at) = plan.sync_point {
                txn.advance_sync_point(store_id, &entity.entity_type, &entity.entity_id, at);
            }
            if let Some(item_id) = plan.settle_held {
                let mut item = txn.item(item_id)?;
                item.transition(QueueStatus::Completed)?;
                item.last_error = None;
                txn.put(item);
            }
            if let Some(change) = plan.corrective.clone() {
                let item = queue::enqueue(txn, store_id, BatchDirection::Download, change, now)?;
                debug!(item = %item, store = %store_id, "corrective download enqueued");
            }
            Ok(true)
        })?;

        if committed {
            self.metrics.add_records_applied(1);
            if detected {
                self.metrics.add_conflicts_detected(1);
                if manual {
                    self.metrics.add_conflicts_pending(1);
                } else {
                    self.metrics.add_conflicts_auto_resolved(1);
                }
            }
        }
        Ok(())
    }

    fn fail_record(&self, store_id: StoreId, record: &SyncRecord, error: &SyncError) -> SyncResult<()> {
        let now = self.clock.now();
        let outcome = RecordOutcome::Failed {
            error: error.to_string(),
            permanent: !error.is_retryable(),
        };
        warn!(
            store = %store_id,
            record = %record.id,
            entity_id = %record.entity.entity_id,
            %error,
            "record failed"
        );
        let committed = self.store.transact(|txn| {
            let mut stored = txn.record(record.id)?;
            if !stored.settle(outcome.clone(), now) {
                return Ok(false);
            }
            let mut batch = txn.batch(record.batch_id)?;
            batch.count(&stored.outcome, now);
            txn.put(stored);
            txn.put(batch);
            Ok(true)
        })?;
        if committed {
            self.metrics.add_records_failed(1);
        }
        Ok(())
    }

    /// Applies an operator's resolution of a manual conflict.
    ///
    /// The chosen value is written with a timestamp newer than both sides
    /// and queued toward the peer when the rule's direction allows it. The
    /// entity lock is held from the resolved check through the commit, so
    /// of two concurrent resolutions exactly one reaches the repository.
    pub fn resolve_manual(
        &self,
        conflict_id: ConflictId,
        payload: Option<Vec<u8>>,
        user: &str,
        notes: Option<String>,
    ) -> SyncResult<SyncConflict> {
        let started = Instant::now();
        if user.trim().is_empty() {
            return Err(SyncError::MissingResolver(conflict_id));
        }
        let (entity_type, entity_id) = {
            let tables = self.store.read();
            let conflict = tables.conflicts.get(&conflict_id).ok_or(SyncError::NotFound {
                kind: "conflict",
                id: conflict_id.get(),
            })?;
            (conflict.entity_type.clone(), conflict.entity_id.clone())
        };

        let _guard = self.locks.lock(&entity_type, &entity_id);
        let conflict = self
            .store
            .read()
            .conflicts
            .get(&conflict_id)
            .cloned()
            .ok_or(SyncError::NotFound {
                kind: "conflict",
                id: conflict_id.get(),
            })?;
        if conflict.is_resolved {
            return Err(SyncError::ConflictAlreadyResolved(conflict_id));
        }

        let now = self.clock.now();
        let newest = conflict.local.timestamp.max(conflict.remote.timestamp);
        let version = Version {
            payload,
            timestamp: now.max(newest.saturating_add(Duration::from_millis(1))),
        };
        self.repo
            .put(&conflict.entity_type, &conflict.entity_id, &version)?;

        let direction = self.outbound_direction();
        let resolved = self.store.transact(|txn| {
            let mut conflict = txn.conflict(conflict_id)?;
            conflict.resolve_manually(version.payload.clone(), user, notes.clone(), now)?;
            txn.put(conflict.clone());

            if let Ok(mut record) = txn.record(conflict.record_id) {
                if record.settle_conflict(ConflictWinner::Manual).is_ok() {
                    txn.put(record);
                }
            }

            let config = txn.config(conflict.store_id)?;
            if let Some(rule) = config
                .rules
                .rule_for(&conflict.entity_type)
                .filter(|r| r.accepts(direction))
            {
                let entity = EntityEnvelope::new(
                    conflict.entity_type.clone(),
                    conflict.entity_id.clone(),
                    ChangeOperation::Update,
                    version.timestamp,
                    version.payload.clone(),
                );
                queue::enqueue(txn, conflict.store_id, direction, change_for(&entity, &version, rule), now)?;
            }

            txn.log(
                LogEvent::new(
                    LogOperation::Resolve,
                    conflict.store_id,
                    format!("{conflict_id} by {user}"),
                )
                .took(started.elapsed()),
                now,
            );
            Ok(conflict)
        })?;

        self.metrics.add_conflicts_manually_resolved(1);
        info!(conflict = %conflict_id, user, "conflict resolved manually");
        Ok(resolved)
    }
}

/// Creates the local inbound batch for `envelope`, or finds the existing one.
///
/// Returns the local id and whether an unfinished batch is being resumed.
fn open_batch(
    txn: &mut Txn<'_>,
    envelope: &BatchEnvelope,
    now: Timestamp,
) -> SyncResult<(BatchId, bool)> {
    txn.config(envelope.store_id)?;
    if let Some(existing) = txn.tables().inbound_batch(envelope.store_id, envelope.batch_id) {
        let id = existing.id;
        let resumed = !existing.status.is_terminal();
        return Ok((id, resumed));
    }

    let batch_id = txn.next_batch_id();
    for (position, record) in envelope.records.iter().enumerate() {
        let id = txn.next_record_id();
        txn.put(SyncRecord {
            id,
            batch_id,
            position: u32::try_from(position).unwrap_or(u32::MAX),
            queue_item: None,
            remote_record_id: Some(record.record_id),
            entity: record.entity.clone(),
            outcome: RecordOutcome::Pending,
            processed_at: None,
        });
    }
    let empty = envelope.is_empty();
    txn.put(SyncBatch {
        id: batch_id,
        store_id: envelope.store_id,
        direction: envelope.direction,
        entity_type: envelope.entity_type.clone(),
        origin: BatchOrigin::Inbound {
            remote_batch_id: envelope.batch_id,
        },
        record_count: u32::try_from(envelope.len()).unwrap_or(u32::MAX),
        success_count: 0,
        failed_count: 0,
        conflict_count: 0,
        status: if empty {
            BatchStatus::Completed
        } else {
            BatchStatus::InProgress
        },
        created_at: now,
        started_at: Some(now),
        completed_at: empty.then_some(now),
        payload: envelope.encode()?,
        error: None,
    });
    Ok((batch_id, false))
}

fn check_record<'c>(
    config: &'c SyncConfiguration,
    direction: BatchDirection,
    entity: &EntityEnvelope,
) -> SyncResult<&'c SyncEntityRule> {
    entity.validate()?;
    let rule = config.rules.require(&entity.entity_type)?;
    if !rule.direction.permits(direction) {
        return Err(SyncError::DirectionNotAllowed {
            entity_type: entity.entity_type.clone(),
            direction,
        });
    }
    Ok(rule)
}

/// Finds an item this node sent for the entity that the peer parked as a
/// conflict.
fn held_item(
    tables: &Tables,
    store_id: StoreId,
    outbound: BatchDirection,
    entity: &EntityEnvelope,
) -> Option<QueueItemId> {
    tables
        .queue
        .values()
        .find(|i| {
            i.status == QueueStatus::Conflict
                && i.store_id == store_id
                && i.direction == outbound
                && i.entity_type == entity.entity_type
                && i.entity_id == entity.entity_id
        })
        .map(|i| i.id)
}

fn outcome_of(verdict: &Verdict, conflict_id: Option<ConflictId>) -> RecordOutcome {
    match (verdict, conflict_id) {
        (Verdict::Applied, _) => RecordOutcome::Succeeded { resolution: None },
        (Verdict::KeptLocal, _) => RecordOutcome::Succeeded {
            resolution: Some(ConflictWinner::Local),
        },
        (Verdict::Resolved(winner), _) => RecordOutcome::Succeeded {
            resolution: Some(*winner),
        },
        (Verdict::Manual, Some(conflict_id)) => RecordOutcome::ConflictPending { conflict_id },
        (Verdict::Manual, None) => RecordOutcome::Failed {
            error: "conflict row missing".into(),
            permanent: false,
        },
    }
}

fn change_for(entity: &EntityEnvelope, version: &Version, rule: &SyncEntityRule) -> Change {
    let change = match &version.payload {
        Some(payload) => Change::update(
            entity.entity_type.clone(),
            entity.entity_id.clone(),
            payload.clone(),
            version.timestamp,
        ),
        None => Change::delete(
            entity.entity_type.clone(),
            entity.entity_id.clone(),
            version.timestamp,
        ),
    };
    change.with_priority(rule.priority)
}

/// Builds the report (and ack) of an inbound batch from stored rows.
pub(crate) fn build_report(tables: &Tables, batch: &SyncBatch, replayed: bool) -> ApplyReport {
    let remote_batch_id = match batch.origin {
        BatchOrigin::Inbound { remote_batch_id } => remote_batch_id,
        BatchOrigin::Outbound => batch.id,
    };
    let mut ack = BatchAck::new(remote_batch_id, batch.store_id);
    ack.outcomes = tables
        .records_of(batch.id)
        .into_iter()
        .filter(|r| r.is_processed())
        .map(SyncRecord::ack)
        .collect();
    ApplyReport {
        batch_id: batch.id,
        status: batch.status,
        applied: batch.success_count,
        failed: batch.failed_count,
        conflicts: batch.conflict_count,
        replayed,
        ack,
    }
}

/// Builds an ack failing every record of a rejected batch.
pub fn reject_all(envelope: &BatchEnvelope, error: &SyncError) -> BatchAck {
    let mut ack = BatchAck::new(envelope.batch_id, envelope.store_id);
    ack.outcomes = envelope
        .records
        .iter()
        .map(|r| RecordAck {
            record_id: r.record_id,
            entity_id: r.entity.entity_id.clone(),
            outcome: AckOutcome::Failed {
                message: error.to_string(),
                permanent: !error.is_retryable(),
            },
        })
        .collect();
    ack
}
