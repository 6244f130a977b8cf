//! Configuration for the sync engine.

use crate::error::{SyncError, SyncResult};
use crate::rules::RuleTable;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tillsync_protocol::{NodeRole, StoreId, SyncEntityRule, Timestamp};

/// Name of the node configuration file inside a data directory.
pub const CONFIG_FILE: &str = "tillsync.json";

/// Per-store sync policy and health.
///
/// Policy fields come from configuration; the `last_*` fields are updated by
/// the engine on every cycle and survive restarts with the rest of the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfiguration {
    /// Store the configuration belongs to.
    pub store_id: StoreId,
    /// Disabled stores are skipped by the scheduler.
    pub enabled: bool,
    /// Seconds between background cycles.
    pub sync_interval_seconds: u64,
    /// Run one cycle as soon as the worker starts.
    pub auto_sync_on_startup: bool,
    /// Upper bound on records per batch.
    pub max_batch_size: usize,
    /// Attempts before a queue item is dead-lettered.
    pub retry_attempts: u32,
    /// Base backoff delay.
    pub retry_delay_seconds: u64,
    /// Backoff cap.
    pub max_retry_delay_seconds: u64,
    /// Entity rules for this store.
    pub rules: RuleTable,
    /// End of the last cycle that finished without errors.
    pub last_successful_sync: Option<Timestamp>,
    /// Start of the last cycle.
    pub last_attempted_sync: Option<Timestamp>,
    /// Error of the last failed cycle, cleared on success.
    pub last_sync_error: Option<String>,
}

impl SyncConfiguration {
    /// Creates a configuration with default policy and no rules.
    pub fn new(store_id: StoreId) -> Self {
        Self {
            store_id,
            enabled: true,
            sync_interval_seconds: 60,
            auto_sync_on_startup: true,
            max_batch_size: 100,
            retry_attempts: 5,
            retry_delay_seconds: 5,
            max_retry_delay_seconds: 15 * 60,
            rules: RuleTable::new(),
            last_successful_sync: None,
            last_attempted_sync: None,
            last_sync_error: None,
        }
    }

    /// Adds or replaces an entity rule.
    pub fn with_rule(mut self, rule: SyncEntityRule) -> Self {
        self.rules.insert(rule);
        self
    }

    /// Sets the cycle interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.sync_interval_seconds = interval.as_secs().max(1);
        self
    }

    /// Sets the batch size bound.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Sets the retry budget.
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Sets the base backoff delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_seconds = delay.as_secs();
        self
    }

    /// Sets the backoff cap.
    pub fn with_max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay_seconds = delay.as_secs();
        self
    }

    /// Enables or disables the store.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets whether a cycle runs at worker start.
    pub fn with_auto_sync_on_startup(mut self, auto: bool) -> Self {
        self.auto_sync_on_startup = auto;
        self
    }

    /// Returns the cycle interval.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_seconds.max(1))
    }

    /// Returns the retry policy.
    pub fn retry(&self) -> RetryConfig {
        RetryConfig::new(self.retry_attempts)
            .with_base_delay(Duration::from_secs(self.retry_delay_seconds))
            .with_max_delay(Duration::from_secs(self.max_retry_delay_seconds))
    }

    /// Keeps the health fields of `previous` when replacing a configuration.
    pub(crate) fn inherit_health(&mut self, previous: &SyncConfiguration) {
        self.last_successful_sync = previous.last_successful_sync;
        self.last_attempted_sync = previous.last_attempted_sync;
        self.last_sync_error = previous.last_sync_error.clone();
        for rule in previous.rules.iter() {
            self.rules.advance_cursor(&rule.entity_type, rule.sync_cursor);
        }
    }

    /// Checks the policy values.
    pub fn validate(&self) -> SyncResult<()> {
        if self.max_batch_size == 0 {
            return Err(SyncError::Config(format!(
                "{}: max_batch_size must be positive",
                self.store_id
            )));
        }
        if self.retry_attempts == 0 {
            return Err(SyncError::Config(format!(
                "{}: retry_attempts must be positive",
                self.store_id
            )));
        }
        if self.max_retry_delay_seconds < self.retry_delay_seconds {
            return Err(SyncError::Config(format!(
                "{}: max_retry_delay_seconds is below retry_delay_seconds",
                self.store_id
            )));
        }
        Ok(())
    }
}

impl Default for SyncConfiguration {
    fn default() -> Self {
        Self::new(StoreId(0))
    }
}

/// Configuration for retry behavior.
///
/// Backoff is deterministic: `base_delay * 2^(attempt - 1)`, capped at
/// `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Attempts before dead-lettering.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(15 * 60),
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Calculates the delay after failure number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

/// What this node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Headquarters.
    Hq,
    /// A store with its id.
    Store(StoreId),
}

impl NodeKind {
    /// Returns the role used by conflict resolvers.
    pub fn role(&self) -> NodeRole {
        match self {
            NodeKind::Hq => NodeRole::Hq,
            NodeKind::Store(_) => NodeRole::Store,
        }
    }

    /// Returns the store id for store nodes.
    pub fn store_id(&self) -> Option<StoreId> {
        match self {
            NodeKind::Hq => None,
            NodeKind::Store(id) => Some(*id),
        }
    }
}

/// Process-level configuration, loadable from [`CONFIG_FILE`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Role of this node.
    pub node: NodeKind,
    /// Directory holding the journal and lock file.
    pub data_dir: PathBuf,
    /// Concurrent store workers.
    pub workers: usize,
    /// Fsync the journal after every transaction.
    pub sync_on_write: bool,
    /// Store configurations (one for a store node, many for HQ).
    pub stores: Vec<SyncConfiguration>,
}

impl NodeConfig {
    /// Creates a configuration for `node` rooted at `data_dir`.
    pub fn new(node: NodeKind, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            node,
            data_dir: data_dir.into(),
            workers: 4,
            sync_on_write: true,
            stores: Vec::new(),
        }
    }

    /// Sets the worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the journal sync policy.
    pub fn with_sync_on_write(mut self, sync: bool) -> Self {
        self.sync_on_write = sync;
        self
    }

    /// Adds a store configuration.
    pub fn with_store(mut self, store: SyncConfiguration) -> Self {
        self.stores.push(store);
        self
    }

    /// Loads a JSON configuration file.
    pub fn load(path: &Path) -> SyncResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&text)
            .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration as pretty JSON.
    pub fn save(&self, path: &Path) -> SyncResult<()> {
        let text =
            serde_json::to_string_pretty(self).map_err(|e| SyncError::Config(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Checks the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.workers == 0 {
            return Err(SyncError::Config("workers must be positive".into()));
        }
        if let NodeKind::Store(id) = self.node {
            if !self.stores.iter().any(|s| s.store_id == id) {
                return Err(SyncError::Config(format!(
                    "no store configuration for {id}"
                )));
            }
        }
        for store in &self.stores {
            store.validate()?;
        }
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new(NodeKind::Hq, "tillsync-data")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tillsync_protocol::{ConflictPolicy, SyncDirection};

    #[test]
    fn store_config_builder() {
        let config = SyncConfiguration::new(StoreId(7))
            .with_interval(Duration::from_secs(30))
            .with_max_batch_size(25)
            .with_retry_attempts(3)
            .with_rule(SyncEntityRule::new("Product"));

        assert_eq!(config.sync_interval(), Duration::from_secs(30));
        assert_eq!(config.max_batch_size, 25);
        assert_eq!(config.retry().max_attempts, 3);
        assert!(config.rules.rule_for(&"Product".into()).is_some());
        config.validate().unwrap();
    }

    #[test]
    fn invalid_store_config() {
        let config = SyncConfiguration::new(StoreId(1)).with_max_batch_size(0);
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));

        let config = SyncConfiguration::new(StoreId(1)).with_retry_attempts(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn retry_config_no_retry() {
        let config = RetryConfig::no_retry();
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.delay_for_attempt(1), Duration::ZERO);
    }

    #[test]
    fn retry_delay_doubles() {
        let config = RetryConfig::new(5).with_base_delay(Duration::from_secs(2));

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(8));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(100)
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5));

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(64), Duration::from_secs(5));
    }

    #[test]
    fn node_config_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);

        let config = NodeConfig::new(NodeKind::Store(StoreId(3)), dir.path())
            .with_workers(2)
            .with_store(
                SyncConfiguration::new(StoreId(3)).with_rule(
                    SyncEntityRule::new("TaxInvoice")
                        .with_direction(SyncDirection::Upload)
                        .with_policy(ConflictPolicy::Manual),
                ),
            );
        config.save(&path).unwrap();

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.node.role(), NodeRole::Store);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: NodeConfig = serde_json::from_str(
            r#"{"node":{"Store":4},"stores":[{"store_id":4,"max_batch_size":10}]}"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.stores[0].max_batch_size, 10);
        assert_eq!(config.stores[0].retry_attempts, 5);
    }

    #[test]
    fn store_node_needs_its_configuration() {
        let config = NodeConfig::new(NodeKind::Store(StoreId(9)), "/tmp/x");
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }
}
