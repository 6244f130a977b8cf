//! Conflicts command implementation.

use super::{print_json, require_data_dir, show_payload, CommandResult};
use std::path::Path;
use tillsync_engine::{ops, SyncConflict, SyncStore};
use tillsync_protocol::StoreId;

/// Runs the conflicts command.
pub fn run(path: &Path, store: u32, format: &str) -> CommandResult<()> {
    require_data_dir(path)?;
    let tables = SyncStore::load_read_only(path)?;
    let conflicts = ops::list_conflicts(&tables, StoreId(store));
    match format {
        "json" => print_json(&conflicts)?,
        _ => print_text_output(StoreId(store), &conflicts),
    }
    Ok(())
}

fn print_text_output(store: StoreId, conflicts: &[SyncConflict]) {
    if conflicts.is_empty() {
        println!("No conflicts need attention for {store}");
        return;
    }
    println!("{} conflict(s) need attention for {store}", conflicts.len());
    for c in conflicts {
        println!();
        println!(
            "{} {}/{} ({:?}, detected {})",
            c.id, c.entity_type, c.entity_id, c.policy, c.detected_at
        );
        println!(
            "  local:  {} at {}",
            show_payload(c.local.payload.as_deref()),
            c.local.timestamp
        );
        println!(
            "  remote: {} at {}",
            show_payload(c.remote.payload.as_deref()),
            c.remote.timestamp
        );
        if c.flagged_for_review {
            println!("  flagged for review");
        }
        if let Some(reason) = &c.reason {
            println!("  reason: {reason}");
        }
    }
}
