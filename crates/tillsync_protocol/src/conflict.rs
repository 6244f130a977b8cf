//! Conflict detection and resolution.
//!
//! Detection is a pure function of the two versions and the last confirmed
//! common sync point. Resolution is a strategy selected by the entity type's
//! [`ConflictPolicy`]; resolvers see only the two versions and the role of the
//! node doing the comparison, so the same inputs always produce the same winner.

use crate::ids::Timestamp;
use crate::rule::ConflictPolicy;
use serde::{Deserialize, Serialize};

/// Role of the node running the comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRole {
    /// Headquarters, the system of record.
    Hq,
    /// A retail store.
    Store,
}

/// One replica's view of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    /// Serialized entity, `None` for a delete tombstone.
    pub payload: Option<Vec<u8>>,
    /// Logical timestamp of the last change.
    pub timestamp: Timestamp,
}

impl Version {
    /// Creates a live version.
    pub fn new(payload: impl Into<Vec<u8>>, timestamp: Timestamp) -> Self {
        Self {
            payload: Some(payload.into()),
            timestamp,
        }
    }

    /// Creates a delete tombstone.
    pub fn tombstone(timestamp: Timestamp) -> Self {
        Self {
            payload: None,
            timestamp,
        }
    }

    /// Returns true if this version changed after `point`.
    #[inline]
    #[must_use]
    pub fn changed_since(&self, point: Timestamp) -> bool {
        self.timestamp > point
    }
}

/// Outcome of comparing a local and a remote version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    /// No local copy, or only the remote side changed.
    ApplyRemote,
    /// Only the local side changed; the remote value is older news.
    KeepLocal,
    /// Both sides changed to the same content.
    InSync,
    /// Neither side changed since the common point.
    Stale,
    /// Both sides changed to different content.
    Conflict,
}

/// Compares two replicas of one entity against their common sync point.
///
/// A conflict requires both timestamps to be strictly newer than `common` and
/// the payloads to differ.
#[must_use]
pub fn detect(local: Option<&Version>, remote: &Version, common: Timestamp) -> Detection {
    let Some(local) = local else {
        return Detection::ApplyRemote;
    };

    match (local.changed_since(common), remote.changed_since(common)) {
        (true, true) if local.payload == remote.payload => Detection::InSync,
        (true, true) => Detection::Conflict,
        (true, false) => Detection::KeepLocal,
        (false, true) => Detection::ApplyRemote,
        (false, false) => Detection::Stale,
    }
}

/// Inputs to a resolver.
#[derive(Debug, Clone, Copy)]
pub struct ConflictContext<'a> {
    /// Role of the node holding `local`.
    pub role: NodeRole,
    /// This node's version.
    pub local: &'a Version,
    /// The incoming version.
    pub remote: &'a Version,
}

impl ConflictContext<'_> {
    /// Returns the side holding HQ's version.
    fn hq_side(&self) -> ConflictWinner {
        match self.role {
            NodeRole::Hq => ConflictWinner::Local,
            NodeRole::Store => ConflictWinner::Remote,
        }
    }

    /// Returns the side holding the store's version.
    fn store_side(&self) -> ConflictWinner {
        match self.role {
            NodeRole::Hq => ConflictWinner::Remote,
            NodeRole::Store => ConflictWinner::Local,
        }
    }
}

/// Which value a resolution keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictWinner {
    /// Keep this node's value.
    Local,
    /// Adopt the incoming value.
    Remote,
    /// An operator supplied the value.
    Manual,
}

/// A resolver's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    /// Winning side; `Manual` means "defer to an operator".
    pub winner: ConflictWinner,
    /// Short machine-readable reason, recorded on the conflict row.
    pub reason: &'static str,
}

impl Resolution {
    /// Returns true if the conflict was settled without an operator.
    #[must_use]
    pub fn is_automatic(&self) -> bool {
        self.winner != ConflictWinner::Manual
    }
}

/// A conflict resolution strategy.
pub trait ConflictResolver: Send + Sync {
    /// Policy this strategy implements.
    fn policy(&self) -> ConflictPolicy;

    /// Picks a winner for a detected conflict.
    fn resolve(&self, ctx: &ConflictContext<'_>) -> Resolution;
}

/// HQ's value always wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct HqWins;

impl ConflictResolver for HqWins {
    fn policy(&self) -> ConflictPolicy {
        ConflictPolicy::HqWins
    }

    fn resolve(&self, ctx: &ConflictContext<'_>) -> Resolution {
        Resolution {
            winner: ctx.hq_side(),
            reason: "hq-wins",
        }
    }
}

/// The store's value always wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreWins;

impl ConflictResolver for StoreWins {
    fn policy(&self) -> ConflictPolicy {
        ConflictPolicy::StoreWins
    }

    fn resolve(&self, ctx: &ConflictContext<'_>) -> Resolution {
        Resolution {
            winner: ctx.store_side(),
            reason: "store-wins",
        }
    }
}

/// The later timestamp wins; exact ties go to HQ.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatestTimestampWins;

impl ConflictResolver for LatestTimestampWins {
    fn policy(&self) -> ConflictPolicy {
        ConflictPolicy::LatestTimestamp
    }

    fn resolve(&self, ctx: &ConflictContext<'_>) -> Resolution {
        use std::cmp::Ordering;

        match ctx.local.timestamp.cmp(&ctx.remote.timestamp) {
            Ordering::Greater => Resolution {
                winner: ConflictWinner::Local,
                reason: "latest-timestamp",
            },
            Ordering::Less => Resolution {
                winner: ConflictWinner::Remote,
                reason: "latest-timestamp",
            },
            Ordering::Equal => Resolution {
                winner: ctx.hq_side(),
                reason: "timestamp-tie-hq",
            },
        }
    }
}

/// Defers every conflict to an operator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualReview;

impl ConflictResolver for ManualReview {
    fn policy(&self) -> ConflictPolicy {
        ConflictPolicy::Manual
    }

    fn resolve(&self, _ctx: &ConflictContext<'_>) -> Resolution {
        Resolution {
            winner: ConflictWinner::Manual,
            reason: "manual-review",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const T: u64 = 1_000;

    fn v(payload: &[u8], at: u64) -> Version {
        Version::new(payload, Timestamp::from_millis(at))
    }

    fn common() -> Timestamp {
        Timestamp::from_millis(T)
    }

    #[test]
    fn only_local_changed_keeps_local() {
        let local = v(b"local", T + 1);
        let remote = v(b"base", T);
        assert_eq!(detect(Some(&local), &remote, common()), Detection::KeepLocal);
    }

    #[test]
    fn both_changed_with_different_content_conflicts() {
        let local = v(b"P-local", T + 1);
        let remote = v(b"P-remote", T + 2);
        assert_eq!(detect(Some(&local), &remote, common()), Detection::Conflict);
    }

    #[test]
    fn both_changed_to_same_content_is_in_sync() {
        let local = v(b"same", T + 1);
        let remote = v(b"same", T + 5);
        assert_eq!(detect(Some(&local), &remote, common()), Detection::InSync);
    }

    #[test]
    fn missing_local_applies_remote() {
        assert_eq!(detect(None, &v(b"x", 1), common()), Detection::ApplyRemote);
        assert_eq!(
            detect(Some(&v(b"old", T)), &v(b"new", T + 1), common()),
            Detection::ApplyRemote
        );
        assert_eq!(
            detect(Some(&v(b"a", T)), &v(b"b", T - 1), common()),
            Detection::Stale
        );
    }

    #[test]
    fn tombstone_against_live_value_conflicts() {
        let local = Version::tombstone(Timestamp::from_millis(T + 1));
        let remote = v(b"edit", T + 1);
        assert_eq!(detect(Some(&local), &remote, common()), Detection::Conflict);
    }

    #[test]
    fn latest_timestamp_is_deterministic() {
        let resolver = LatestTimestampWins;
        let newer = v(b"a", T + 2);
        let older = v(b"b", T + 1);

        let ctx = ConflictContext {
            role: NodeRole::Hq,
            local: &newer,
            remote: &older,
        };
        assert_eq!(resolver.resolve(&ctx).winner, ConflictWinner::Local);

        let ctx = ConflictContext {
            role: NodeRole::Hq,
            local: &older,
            remote: &newer,
        };
        assert_eq!(resolver.resolve(&ctx).winner, ConflictWinner::Remote);
    }

    #[test]
    fn latest_timestamp_tie_goes_to_hq() {
        let resolver = LatestTimestampWins;
        let a = v(b"a", T + 1);
        let b = v(b"b", T + 1);

        let at_hq = ConflictContext {
            role: NodeRole::Hq,
            local: &a,
            remote: &b,
        };
        let at_store = ConflictContext {
            role: NodeRole::Store,
            local: &a,
            remote: &b,
        };
        assert_eq!(resolver.resolve(&at_hq).winner, ConflictWinner::Local);
        assert_eq!(resolver.resolve(&at_store).winner, ConflictWinner::Remote);
        assert_eq!(resolver.resolve(&at_hq).reason, "timestamp-tie-hq");
    }

    #[test]
    fn hq_and_store_wins_flip_with_role() {
        let a = v(b"a", T + 1);
        let b = v(b"b", T + 9);
        for (role, hq, store) in [
            (NodeRole::Hq, ConflictWinner::Local, ConflictWinner::Remote),
            (NodeRole::Store, ConflictWinner::Remote, ConflictWinner::Local),
        ] {
            let ctx = ConflictContext {
                role,
                local: &a,
                remote: &b,
            };
            assert_eq!(HqWins.resolve(&ctx).winner, hq);
            assert_eq!(StoreWins.resolve(&ctx).winner, store);
        }
    }

    #[test]
    fn manual_defers() {
        let a = v(b"a", T + 1);
        let ctx = ConflictContext {
            role: NodeRole::Store,
            local: &a,
            remote: &a,
        };
        let resolution = ManualReview.resolve(&ctx);
        assert!(!resolution.is_automatic());
    }

    proptest! {
        #[test]
        fn conflict_only_when_both_sides_newer(
            base in 0u64..10_000,
            local_at in 0u64..20_000,
            remote_at in 0u64..20_000,
            same in any::<bool>(),
        ) {
            let local = v(b"L", local_at);
            let remote = if same { v(b"L", remote_at) } else { v(b"R", remote_at) };
            let found = detect(Some(&local), &remote, Timestamp::from_millis(base));

            if found == Detection::Conflict {
                prop_assert!(local_at > base && remote_at > base && !same);
            }
            if local_at > base && remote_at > base && !same {
                prop_assert_eq!(found, Detection::Conflict);
            }
        }
    }
}
