//! Sync log events and in-process metrics.

use crate::model::LogOperation;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tillsync_protocol::StoreId;

/// A log entry before it gets an id and a timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    /// Store concerned, if any.
    pub store_id: Option<StoreId>,
    /// Operation.
    pub operation: LogOperation,
    /// Error detail on failure.
    pub error: Option<String>,
    /// Free-form detail.
    pub detail: String,
    /// How long it took.
    pub duration: Duration,
}

impl LogEvent {
    /// Creates a successful event.
    pub fn new(
        operation: LogOperation,
        store_id: impl Into<Option<StoreId>>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            store_id: store_id.into(),
            operation,
            error: None,
            detail: detail.into(),
            duration: Duration::ZERO,
        }
    }

    /// Marks the event as failed.
    pub fn failed(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// Sets the duration.
    pub fn took(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }
}

/// Counters since process start.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    cycles: AtomicU64,
    cycles_failed: AtomicU64,
    batches_sent: AtomicU64,
    batches_applied: AtomicU64,
    records_applied: AtomicU64,
    records_failed: AtomicU64,
    conflicts_detected: AtomicU64,
    conflicts_auto_resolved: AtomicU64,
    conflicts_pending: AtomicU64,
    conflicts_manually_resolved: AtomicU64,
    retries_scheduled: AtomicU64,
    dead_letters: AtomicU64,
}

/// A point-in-time copy of [`SyncMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Cycles run.
    pub cycles: u64,
    /// Cycles that ended with an error.
    pub cycles_failed: u64,
    /// Outbound batches acknowledged by the peer.
    pub batches_sent: u64,
    /// Inbound batches applied.
    pub batches_applied: u64,
    /// Inbound records applied.
    pub records_applied: u64,
    /// Inbound records that failed.
    pub records_failed: u64,
    /// Conflicts detected.
    pub conflicts_detected: u64,
    /// Conflicts settled by policy.
    pub conflicts_auto_resolved: u64,
    /// Conflicts deferred to an operator.
    pub conflicts_pending: u64,
    /// Conflicts settled by an operator.
    pub conflicts_manually_resolved: u64,
    /// Retries scheduled.
    pub retries_scheduled: u64,
    /// Queue items dead-lettered.
    pub dead_letters: u64,
}

macro_rules! counter {
    ($($(#[$meta:meta])* $name:ident => $field:ident;)*) => {
        impl SyncMetrics {
            $(
                $(#[$meta])*
                pub fn $name(&self, n: u64) {
                    self.$field.fetch_add(n, Ordering::Relaxed);
                }
            )*
        }
    };
}

counter! {
    /// Counts finished cycles.
    add_cycles => cycles;
    /// Counts failed cycles.
    add_cycles_failed => cycles_failed;
    /// Counts acknowledged outbound batches.
    add_batches_sent => batches_sent;
    /// Counts applied inbound batches.
    add_batches_applied => batches_applied;
    /// Counts applied inbound records.
    add_records_applied => records_applied;
    /// Counts failed inbound records.
    add_records_failed => records_failed;
    /// Counts detected conflicts.
    add_conflicts_detected => conflicts_detected;
    /// Counts policy-settled conflicts.
    add_conflicts_auto_resolved => conflicts_auto_resolved;
    /// Counts conflicts deferred to an operator.
    add_conflicts_pending => conflicts_pending;
    /// Counts operator-settled conflicts.
    add_conflicts_manually_resolved => conflicts_manually_resolved;
    /// Counts scheduled retries.
    add_retries_scheduled => retries_scheduled;
    /// Counts dead letters.
    add_dead_letters => dead_letters;
}

impl SyncMetrics {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            cycles: get(&self.cycles),
            cycles_failed: get(&self.cycles_failed),
            batches_sent: get(&self.batches_sent),
            batches_applied: get(&self.batches_applied),
            records_applied: get(&self.records_applied),
            records_failed: get(&self.records_failed),
            conflicts_detected: get(&self.conflicts_detected),
            conflicts_auto_resolved: get(&self.conflicts_auto_resolved),
            conflicts_pending: get(&self.conflicts_pending),
            conflicts_manually_resolved: get(&self.conflicts_manually_resolved),
            retries_scheduled: get(&self.retries_scheduled),
            dead_letters: get(&self.dead_letters),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = SyncMetrics::new();
        metrics.add_cycles(1);
        metrics.add_cycles(2);
        metrics.add_dead_letters(1);

        let snap = metrics.snapshot();
        assert_eq!(snap.cycles, 3);
        assert_eq!(snap.dead_letters, 1);
        assert_eq!(snap.batches_sent, 0);
    }

    #[test]
    fn event_builder() {
        let event = LogEvent::new(LogOperation::Send, StoreId(2), "batch-4")
            .failed("timeout")
            .took(Duration::from_millis(40));
        assert_eq!(event.store_id, Some(StoreId(2)));
        assert_eq!(event.error.as_deref(), Some("timeout"));

        let global = LogEvent::new(LogOperation::Compact, None, "");
        assert!(global.store_id.is_none());
    }
}
