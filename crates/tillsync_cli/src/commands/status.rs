//! Status command implementation.

use super::{print_json, require_data_dir, CommandResult};
use serde::Serialize;
use std::path::Path;
use tillsync_engine::{
    batch_counts, ops, open_batches, NodeConfig, SyncHealth, SyncStore, Tables, CONFIG_FILE,
    JOURNAL_FILE,
};
use tillsync_protocol::BatchId;

/// Status of a data directory.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    /// Data directory path.
    pub path: String,
    /// Node role from the configuration file, if present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// Journal size in bytes.
    pub journal_bytes: u64,
    /// Per-store status.
    pub stores: Vec<StoreStatus>,
}

/// Status of one store.
#[derive(Debug, Serialize)]
pub struct StoreStatus {
    /// Sync health.
    pub health: SyncHealth,
    /// Batch count per status, zero counts omitted.
    pub batches: Vec<(String, usize)>,
    /// Unfinished batches.
    pub open_batches: Vec<BatchId>,
}

/// Runs the status command.
pub fn run(path: &Path, format: &str) -> CommandResult<()> {
    require_data_dir(path)?;
    let report = collect(path)?;
    match format {
        "json" => print_json(&report)?,
        _ => print_text_output(&report),
    }
    Ok(())
}

/// Builds the report without taking the directory lock.
pub fn collect(path: &Path) -> CommandResult<StatusReport> {
    let tables = SyncStore::load_read_only(path)?;
    let config_path = path.join(CONFIG_FILE);
    let node = if config_path.exists() {
        Some(format!("{:?}", NodeConfig::load(&config_path)?.node))
    } else {
        None
    };
    Ok(StatusReport {
        path: path.display().to_string(),
        node,
        journal_bytes: std::fs::metadata(path.join(JOURNAL_FILE))?.len(),
        stores: stores(&tables)?,
    })
}

fn stores(tables: &Tables) -> CommandResult<Vec<StoreStatus>> {
    tables
        .configs
        .keys()
        .map(|store_id| {
            Ok(StoreStatus {
                health: ops::health(tables, *store_id)?,
                batches: batch_counts(tables, *store_id)
                    .into_iter()
                    .filter(|(_, n)| *n > 0)
                    .map(|(status, n)| (status.to_string(), n))
                    .collect(),
                open_batches: open_batches(tables, *store_id),
            })
        })
        .collect()
}

fn print_text_output(report: &StatusReport) {
    println!("tillsync data directory: {}", report.path);
    if let Some(node) = &report.node {
        println!("  Node:          {node}");
    }
    println!("  Journal size:  {} bytes", report.journal_bytes);
    println!("  Stores:        {}", report.stores.len());

    for store in &report.stores {
        let h = &store.health;
        println!();
        println!(
            "{} ({})",
            h.store_id,
            if h.enabled { "enabled" } else { "disabled" }
        );
        println!("  Pending:        {}", h.pending);
        println!("  In progress:    {}", h.in_progress);
        println!("  Held:           {}", h.held);
        println!("  Dead letters:   {}", h.dead_letters);
        println!("  Open conflicts: {}", h.open_conflicts);
        if let Some(oldest) = h.oldest_pending {
            println!("  Oldest pending: {oldest}");
        }
        match h.last_successful_sync {
            Some(at) => println!("  Last success:   {at}"),
            None => println!("  Last success:   never"),
        }
        if let Some(at) = h.last_attempted_sync {
            println!("  Last attempt:   {at}");
        }
        if let Some(error) = &h.last_sync_error {
            println!("  Last error:     {error}");
        }
        if !store.batches.is_empty() {
            let counts: Vec<_> = store
                .batches
                .iter()
                .map(|(status, n)| format!("{status}={n}"))
                .collect();
            println!("  Batches:        {}", counts.join(" "));
        }
        if !store.open_batches.is_empty() {
            let ids: Vec<_> = store.open_batches.iter().map(|id| id.to_string()).collect();
            println!("  Unfinished:     {}", ids.join(", "));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tillsync_engine::{
        Change, ManualClock, MemoryRepository, NodeKind, SyncConfiguration, SyncNode,
    };
    use tillsync_protocol::{StoreId, SyncEntityRule, Timestamp};

    #[test]
    fn reports_each_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::new(NodeKind::Store(StoreId(4)), dir.path())
            .with_sync_on_write(false)
            .with_store(
                SyncConfiguration::new(StoreId(4)).with_rule(SyncEntityRule::new("Product")),
            );
        config.save(&dir.path().join(CONFIG_FILE)).unwrap();

        let store = SyncStore::open(dir.path(), false).unwrap();
        let node = SyncNode::with_store(
            NodeKind::Store(StoreId(4)),
            store,
            Arc::new(MemoryRepository::new()),
            Arc::new(ManualClock::new(Timestamp::from_millis(5))),
        )
        .unwrap();
        node.configure(config.stores[0].clone()).unwrap();
        node.enqueue(Change::create("Product", "1", b"a".to_vec(), Timestamp::from_millis(1)))
            .unwrap();
        node.assemble_next(StoreId(4)).unwrap();

        // The node still holds the lock; status reads around it.
        let report = collect(dir.path()).unwrap();
        assert_eq!(report.node.as_deref(), Some("Store(StoreId(4))"));
        assert_eq!(report.stores.len(), 1);
        let store = &report.stores[0];
        assert_eq!(store.health.in_progress, 1);
        assert_eq!(store.open_batches.len(), 1);
        assert_eq!(store.batches, vec![("pending".to_string(), 1)]);
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run(&dir.path().join("nope"), "text").is_err());
    }
}
