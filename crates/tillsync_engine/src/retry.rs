//! Retry scheduling for queue items.

use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use crate::model::{QueueStatus, SyncQueueItem};
use tillsync_protocol::Timestamp;
use tracing::warn;

/// What happened to a failed queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `Pending`, not before `at`.
    Retry {
        /// Failures so far.
        attempt: u32,
        /// Earliest next attempt.
        at: Timestamp,
    },
    /// Terminal `Failed`.
    DeadLetter {
        /// Failures counted against the budget.
        attempts: u32,
        /// True if the error was permanent rather than the budget running out.
        permanent: bool,
    },
}

impl RetryDecision {
    /// Returns true if the item was dead-lettered.
    pub fn is_dead_letter(&self) -> bool {
        matches!(self, RetryDecision::DeadLetter { .. })
    }
}

/// Applies the backoff policy of one store to its queue items.
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    config: RetryConfig,
}

impl RetryScheduler {
    /// Creates a scheduler.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the policy.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Records a failed attempt of an in-progress item.
    ///
    /// Transient failures consume one unit of the item's budget and schedule
    /// the next attempt; permanent ones dead-letter at once and leave the
    /// count alone.
    pub fn record_failure(
        &self,
        item: &mut SyncQueueItem,
        error: &str,
        permanent: bool,
        now: Timestamp,
    ) -> SyncResult<RetryDecision> {
        item.last_error = Some(error.to_string());

        if permanent {
            item.transition(QueueStatus::Failed)?;
            item.next_retry_at = None;
            warn!(item = %item.id, error, "permanent failure, dead-lettered");
            return Ok(RetryDecision::DeadLetter {
                attempts: item.retry_count,
                permanent: true,
            });
        }

        item.retry_count = (item.retry_count + 1).min(item.max_retries);
        if item.retry_count < item.max_retries {
            let at = now.saturating_add(self.config.delay_for_attempt(item.retry_count));
            item.transition(QueueStatus::Pending)?;
            item.next_retry_at = Some(at);
            warn!(item = %item.id, attempt = item.retry_count, retry_at = %at, error, "retry scheduled");
            Ok(RetryDecision::Retry {
                attempt: item.retry_count,
                at,
            })
        } else {
            item.transition(QueueStatus::Failed)?;
            item.next_retry_at = None;
            warn!(item = %item.id, attempts = item.retry_count, error, "retries exhausted, dead-lettered");
            Ok(RetryDecision::DeadLetter {
                attempts: item.retry_count,
                permanent: false,
            })
        }
    }

    /// Puts a dead-lettered item back with a fresh budget.
    pub fn replay(&self, item: &mut SyncQueueItem) -> SyncResult<()> {
        if item.status != QueueStatus::Failed {
            return Err(SyncError::InvalidStateTransition {
                from: format!("{} {}", item.id, item.status),
                to: "replayed".to_string(),
            });
        }
        item.transition(QueueStatus::Pending)?;
        item.retry_count = 0;
        item.max_retries = self.config.max_attempts;
        item.next_retry_at = None;
        Ok(())
    }

    /// Returns the items eligible for assembly at `now`.
    pub fn sweep<'a>(
        items: impl IntoIterator<Item = &'a SyncQueueItem>,
        now: Timestamp,
    ) -> impl Iterator<Item = &'a SyncQueueItem> {
        items.into_iter().filter(move |item| item.is_due(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tillsync_protocol::{
        BatchDirection, BatchId, ChangeOperation, EntityId, Priority, QueueItemId, StoreId,
    };

    fn item(max_retries: u32) -> SyncQueueItem {
        SyncQueueItem {
            id: QueueItemId(1),
            store_id: StoreId(1),
            direction: BatchDirection::Upload,
            entity_type: "Product".into(),
            entity_id: EntityId::from(42u64),
            operation: ChangeOperation::Update,
            priority: Priority::Normal,
            status: QueueStatus::Pending,
            payload: Some(b"P".to_vec()),
            entity_timestamp: Timestamp::from_millis(1),
            enqueued_at: Timestamp::from_millis(1),
            retry_count: 0,
            max_retries,
            last_error: None,
            next_retry_at: None,
            batch_id: None,
        }
    }

    fn scheduler() -> RetryScheduler {
        RetryScheduler::new(
            RetryConfig::new(3)
                .with_base_delay(Duration::from_secs(5))
                .with_max_delay(Duration::from_secs(60)),
        )
    }

    #[test]
    fn exhausts_after_max_retries() {
        let scheduler = scheduler();
        let mut item = item(3);
        let now = Timestamp::from_millis(1_000);
        let mut delays = Vec::new();

        for attempt in 1..=3 {
            item.claim(BatchId(attempt)).unwrap();
            let decision = scheduler
                .record_failure(&mut item, "timeout", false, now)
                .unwrap();
            match decision {
                RetryDecision::Retry { at, .. } => delays.push(at.duration_since(now)),
                RetryDecision::DeadLetter { attempts, permanent } => {
                    assert_eq!(attempt, 3);
                    assert_eq!(attempts, 3);
                    assert!(!permanent);
                }
            }
        }

        assert_eq!(item.status, QueueStatus::Failed);
        assert_eq!(item.retry_count, 3);
        assert_eq!(delays, vec![Duration::from_secs(5), Duration::from_secs(10)]);
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn permanent_failure_keeps_budget() {
        let scheduler = scheduler();
        let mut item = item(3);
        item.claim(BatchId(1)).unwrap();

        let decision = scheduler
            .record_failure(&mut item, "schema rejected", true, Timestamp::ZERO)
            .unwrap();
        assert!(decision.is_dead_letter());
        assert_eq!(item.retry_count, 0);
        assert_eq!(item.last_error.as_deref(), Some("schema rejected"));

        scheduler.replay(&mut item).unwrap();
        assert_eq!(item.status, QueueStatus::Pending);
        assert!(item.is_due(Timestamp::ZERO));

        // Only dead letters can be replayed.
        item.claim(BatchId(2)).unwrap();
        assert!(scheduler.replay(&mut item).is_err());
        assert_eq!(item.status, QueueStatus::InProgress);
    }

    #[test]
    fn sweep_honours_next_retry_at() {
        let scheduler = scheduler();
        let mut waiting = item(3);
        waiting.claim(BatchId(1)).unwrap();
        scheduler
            .record_failure(&mut waiting, "timeout", false, Timestamp::ZERO)
            .unwrap();
        let fresh = SyncQueueItem {
            id: QueueItemId(2),
            ..item(3)
        };

        let items = [waiting, fresh];
        let due: Vec<_> = RetryScheduler::sweep(&items, Timestamp::from_millis(4_999))
            .map(|i| i.id)
            .collect();
        assert_eq!(due, vec![QueueItemId(2)]);
        assert_eq!(
            RetryScheduler::sweep(&items, Timestamp::from_millis(5_000)).count(),
            2
        );
    }
}
