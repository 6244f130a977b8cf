//! Compact command implementation.

use super::{print_json, require_data_dir, CommandResult};
use serde::Serialize;
use std::path::Path;
use tillsync_engine::SyncStore;

/// Result of a compaction.
#[derive(Debug, Serialize)]
pub struct CompactOutput {
    /// Journal size before.
    pub bytes_before: u64,
    /// Journal size after.
    pub bytes_after: u64,
    /// Rows in the snapshot.
    pub rows: usize,
}

/// Runs the compact command.
pub fn run(path: &Path, format: &str) -> CommandResult<()> {
    require_data_dir(path)?;
    let store = SyncStore::open(path, true)?;
    let stats = store.compact()?;
    let output = CompactOutput {
        bytes_before: stats.bytes_before,
        bytes_after: stats.bytes_after,
        rows: stats.rows,
    };
    match format {
        "json" => print_json(&output)?,
        _ => {
            println!("Compacted {}", path.display());
            println!("  Rows:   {}", output.rows);
            println!(
                "  Journal: {} -> {} bytes",
                output.bytes_before, output.bytes_after
            );
        }
    }
    Ok(())
}
