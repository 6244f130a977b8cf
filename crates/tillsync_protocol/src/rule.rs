//! Per-entity-type sync rules.

use crate::conflict::{ConflictResolver, HqWins, LatestTimestampWins, ManualReview, StoreWins};
use crate::envelope::BatchDirection;
use crate::ids::{EntityType, Timestamp};
use serde::{Deserialize, Serialize};

/// Which way an entity type flows between stores and HQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncDirection {
    /// Store → HQ only.
    Upload,
    /// HQ → store only.
    Download,
    /// Both ways.
    Bidirectional,
}

impl SyncDirection {
    /// Returns true if batches flowing in `direction` are allowed.
    #[must_use]
    pub fn permits(self, direction: BatchDirection) -> bool {
        matches!(
            (self, direction),
            (SyncDirection::Bidirectional, _)
                | (SyncDirection::Upload, BatchDirection::Upload)
                | (SyncDirection::Download, BatchDirection::Download)
        )
    }
}

/// Policy for conflicts on one entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictPolicy {
    /// HQ's value always wins.
    HqWins,
    /// The store's value always wins.
    StoreWins,
    /// The later timestamp wins; ties go to HQ.
    LatestTimestamp,
    /// An operator picks the winner.
    Manual,
}

impl ConflictPolicy {
    /// Returns true if this policy settles conflicts without an operator.
    #[must_use]
    pub fn auto_resolves(&self) -> bool {
        !matches!(self, ConflictPolicy::Manual)
    }

    /// Returns the strategy implementing this policy.
    #[must_use]
    pub fn resolver(&self) -> &'static dyn ConflictResolver {
        match self {
            ConflictPolicy::HqWins => &HqWins,
            ConflictPolicy::StoreWins => &StoreWins,
            ConflictPolicy::LatestTimestamp => &LatestTimestampWins,
            ConflictPolicy::Manual => &ManualReview,
        }
    }
}

/// Scheduling tier of a queued change.
///
/// Declaration order is the sort order: `Critical` sorts highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// Bulk, deferrable data.
    Low,
    /// Default tier.
    Normal,
    /// Operationally urgent.
    High,
    /// Regulatory-sensitive, e.g. tax-authority-bound.
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Sync rule for one entity type within a store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEntityRule {
    /// Entity type the rule applies to.
    pub entity_type: EntityType,
    /// Allowed flow.
    pub direction: SyncDirection,
    /// Conflict policy.
    pub conflict_policy: ConflictPolicy,
    /// Default priority for changes of this type.
    pub priority: Priority,
    /// Disabled rules stop new changes from being enqueued.
    pub enabled: bool,
    /// Keep auto-resolved conflicts visible in the operator backlog.
    pub flag_conflicts_for_review: bool,
    /// Last confirmed common sync point for the whole type.
    ///
    /// Used for entities that have no per-entity sync point yet.
    pub sync_cursor: Timestamp,
}

impl SyncEntityRule {
    /// Creates a bidirectional, enabled, HQ-wins rule at normal priority.
    pub fn new(entity_type: impl Into<EntityType>) -> Self {
        Self {
            entity_type: entity_type.into(),
            direction: SyncDirection::Bidirectional,
            conflict_policy: ConflictPolicy::HqWins,
            priority: Priority::Normal,
            enabled: true,
            flag_conflicts_for_review: false,
            sync_cursor: Timestamp::ZERO,
        }
    }

    /// Sets the direction.
    pub fn with_direction(mut self, direction: SyncDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Sets the conflict policy.
    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Sets the default priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Enables or disables the rule.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Flags auto-resolved conflicts for operator review.
    pub fn with_review_flag(mut self, flag: bool) -> Self {
        self.flag_conflicts_for_review = flag;
        self
    }

    /// Returns true if new changes flowing in `direction` may be enqueued.
    #[must_use]
    pub fn accepts(&self, direction: BatchDirection) -> bool {
        self.enabled && self.direction.permits(direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_order() {
        let mut tiers = vec![Priority::Normal, Priority::Critical, Priority::Low, Priority::High];
        tiers.sort_by(|a, b| b.cmp(a));
        assert_eq!(
            tiers,
            vec![Priority::Critical, Priority::High, Priority::Normal, Priority::Low]
        );
    }

    #[test]
    fn policy_resolvers() {
        for policy in [
            ConflictPolicy::HqWins,
            ConflictPolicy::StoreWins,
            ConflictPolicy::LatestTimestamp,
            ConflictPolicy::Manual,
        ] {
            assert_eq!(policy.resolver().policy(), policy);
        }
        assert!(!ConflictPolicy::Manual.auto_resolves());
    }

    #[test]
    fn direction_gates_rule() {
        let rule = SyncEntityRule::new("TaxInvoice").with_direction(SyncDirection::Upload);
        assert!(rule.accepts(BatchDirection::Upload));
        assert!(!rule.accepts(BatchDirection::Download));

        let disabled = rule.with_enabled(false);
        assert!(!disabled.accepts(BatchDirection::Upload));
    }
}
