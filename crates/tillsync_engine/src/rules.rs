//! Entity rule table.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tillsync_protocol::{BatchDirection, EntityType, SyncEntityRule, Timestamp};

/// Rules of one store, keyed by entity type.
///
/// Serialized as a list so configuration files stay readable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<SyncEntityRule>", into = "Vec<SyncEntityRule>")]
pub struct RuleTable {
    rules: HashMap<EntityType, SyncEntityRule>,
}

impl RuleTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a rule.
    pub fn insert(&mut self, rule: SyncEntityRule) -> Option<SyncEntityRule> {
        self.rules.insert(rule.entity_type.clone(), rule)
    }

    /// Returns the rule for `entity_type`.
    pub fn rule_for(&self, entity_type: &EntityType) -> Option<&SyncEntityRule> {
        self.rules.get(entity_type)
    }

    /// Returns the rule, or [`SyncError::UnknownEntityType`].
    pub fn require(&self, entity_type: &EntityType) -> SyncResult<&SyncEntityRule> {
        self.rule_for(entity_type)
            .ok_or_else(|| SyncError::UnknownEntityType(entity_type.clone()))
    }

    /// Returns the rule if a new change flowing in `direction` may be queued.
    pub fn check_enqueue(
        &self,
        entity_type: &EntityType,
        direction: BatchDirection,
    ) -> SyncResult<&SyncEntityRule> {
        let rule = self.require(entity_type)?;
        if !rule.enabled {
            return Err(SyncError::RuleDisabled(entity_type.clone()));
        }
        if !rule.direction.permits(direction) {
            return Err(SyncError::DirectionNotAllowed {
                entity_type: entity_type.clone(),
                direction,
            });
        }
        Ok(rule)
    }

    /// Enables or disables a rule.
    ///
    /// Queued items of a disabled type stay queued and batches in flight
    /// finish; only new enqueues and new assembly stop.
    pub fn set_enabled(&mut self, entity_type: &EntityType, enabled: bool) -> SyncResult<()> {
        let rule = self
            .rules
            .get_mut(entity_type)
            .ok_or_else(|| SyncError::UnknownEntityType(entity_type.clone()))?;
        rule.enabled = enabled;
        Ok(())
    }

    /// Moves the type-wide sync cursor forward; never backward.
    pub fn advance_cursor(&mut self, entity_type: &EntityType, at: Timestamp) {
        if let Some(rule) = self.rules.get_mut(entity_type) {
            rule.sync_cursor = rule.sync_cursor.max(at);
        }
    }

    /// Returns the rules sorted by entity type.
    pub fn iter(&self) -> impl Iterator<Item = &SyncEntityRule> {
        let mut rules: Vec<_> = self.rules.values().collect();
        rules.sort_by(|a, b| a.entity_type.cmp(&b.entity_type));
        rules.into_iter()
    }

    /// Returns the number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true if there are no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl From<Vec<SyncEntityRule>> for RuleTable {
    fn from(rules: Vec<SyncEntityRule>) -> Self {
        let mut table = RuleTable::new();
        for rule in rules {
            table.insert(rule);
        }
        table
    }
}

impl From<RuleTable> for Vec<SyncEntityRule> {
    fn from(table: RuleTable) -> Self {
        let mut rules: Vec<_> = table.rules.into_values().collect();
        rules.sort_by(|a, b| a.entity_type.cmp(&b.entity_type));
        rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tillsync_protocol::SyncDirection;

    fn table() -> RuleTable {
        RuleTable::from(vec![
            SyncEntityRule::new("Product").with_direction(SyncDirection::Download),
            SyncEntityRule::new("TaxInvoice").with_direction(SyncDirection::Upload),
        ])
    }

    #[test]
    fn enqueue_checks() {
        let mut rules = table();
        let invoice = EntityType::new("TaxInvoice");

        assert!(rules.check_enqueue(&invoice, BatchDirection::Upload).is_ok());
        assert!(matches!(
            rules.check_enqueue(&invoice, BatchDirection::Download),
            Err(SyncError::DirectionNotAllowed { .. })
        ));
        assert!(matches!(
            rules.check_enqueue(&"Payroll".into(), BatchDirection::Upload),
            Err(SyncError::UnknownEntityType(_))
        ));

        rules.set_enabled(&invoice, false).unwrap();
        assert!(matches!(
            rules.check_enqueue(&invoice, BatchDirection::Upload),
            Err(SyncError::RuleDisabled(_))
        ));
    }

    #[test]
    fn cursor_only_moves_forward() {
        let mut rules = table();
        let product = EntityType::new("Product");
        rules.advance_cursor(&product, Timestamp::from_millis(50));
        rules.advance_cursor(&product, Timestamp::from_millis(20));
        assert_eq!(
            rules.rule_for(&product).unwrap().sync_cursor,
            Timestamp::from_millis(50)
        );
    }

    #[test]
    fn serializes_as_sorted_list() {
        let json = serde_json::to_string(&table()).unwrap();
        assert!(json.starts_with("[{\"entity_type\":\"Product\""));
        let back: RuleTable = serde_json::from_str(&json).unwrap();
        assert_eq!(back, table());
        assert_eq!(back.iter().count(), 2);
    }
}
