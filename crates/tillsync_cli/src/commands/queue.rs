//! Queue command implementation.

use super::{print_json, require_data_dir, CommandResult};
use std::path::Path;
use tillsync_engine::{ops, QueueStatus, SyncQueueItem, SyncStore};
use tillsync_protocol::StoreId;

const STATUSES: [QueueStatus; 6] = [
    QueueStatus::Pending,
    QueueStatus::InProgress,
    QueueStatus::Completed,
    QueueStatus::Failed,
    QueueStatus::Cancelled,
    QueueStatus::Conflict,
];

/// Parses a status name as printed by the CLI.
pub fn parse_status(name: &str) -> CommandResult<QueueStatus> {
    STATUSES
        .into_iter()
        .find(|s| s.as_str() == name)
        .ok_or_else(|| format!("Unknown queue status: {name}").into())
}

/// Runs the queue command.
pub fn run(path: &Path, store: u32, status: Option<&str>, format: &str) -> CommandResult<()> {
    require_data_dir(path)?;
    let items = collect(path, StoreId(store), status)?;
    match format {
        "json" => print_json(&items)?,
        _ => print_text_output(StoreId(store), &items),
    }
    Ok(())
}

/// Returns the store's queue in scheduling order, optionally filtered.
pub fn collect(
    path: &Path,
    store: StoreId,
    status: Option<&str>,
) -> CommandResult<Vec<SyncQueueItem>> {
    let filter = status.map(parse_status).transpose()?;
    let tables = SyncStore::load_read_only(path)?;
    let mut items = ops::queue_snapshot(&tables, store);
    if let Some(filter) = filter {
        items.retain(|item| item.status == filter);
    }
    Ok(items)
}

fn print_text_output(store: StoreId, items: &[SyncQueueItem]) {
    println!("Queue of {store}: {} item(s)", items.len());
    for item in items {
        println!(
            "  {:<10} {:<12} {:?} {:?} {}/{} {:?}",
            item.id.to_string(),
            item.status.as_str(),
            item.priority,
            item.operation,
            item.entity_type,
            item.entity_id,
            item.direction,
        );
        if item.retry_count > 0 {
            println!("      retries: {}/{}", item.retry_count, item.max_retries);
        }
        if let Some(at) = item.next_retry_at {
            println!("      next retry at: {at}");
        }
        if let Some(batch) = item.batch_id {
            println!("      batch: {batch}");
        }
        if let Some(error) = &item.last_error {
            println!("      last error: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names_round_trip() {
        for status in STATUSES {
            assert_eq!(parse_status(status.as_str()).unwrap(), status);
        }
        assert!(parse_status("stuck").is_err());
    }
}
