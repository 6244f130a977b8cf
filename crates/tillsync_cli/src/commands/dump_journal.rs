//! Dump-journal command implementation.

use super::{print_json, require_data_dir, CommandResult};
use std::path::Path;
use tillsync_engine::{JournalLine, RowKey, SyncStore};

/// Runs the dump-journal command.
pub fn run(path: &Path, limit: Option<usize>, offset: u64, format: &str) -> CommandResult<()> {
    require_data_dir(path)?;
    let lines = collect(path, limit, offset)?;
    match format {
        "json" => print_json(&lines)?,
        _ => print_text_output(&lines),
    }
    Ok(())
}

/// Returns journal lines at or after `offset`, at most `limit` of them.
pub fn collect(path: &Path, limit: Option<usize>, offset: u64) -> CommandResult<Vec<JournalLine>> {
    let lines = SyncStore::dump_journal(path)?
        .into_iter()
        .filter(|line| line.offset >= offset)
        .take(limit.unwrap_or(usize::MAX))
        .collect();
    Ok(lines)
}

fn print_text_output(lines: &[JournalLine]) {
    println!("{:>10}  {:<6}  ROW", "OFFSET", "ACTION");
    for line in lines {
        println!("{:>10}  {:<6}  {}", line.offset, line.action, describe(&line.key));
    }
    println!("{} entr{}", lines.len(), if lines.len() == 1 { "y" } else { "ies" });
}

fn describe(key: &RowKey) -> String {
    match key {
        RowKey::Config(store) => format!("config {store}"),
        RowKey::Item(id) => id.to_string(),
        RowKey::Batch(id) => id.to_string(),
        RowKey::Record(id) => id.to_string(),
        RowKey::Conflict(id) => id.to_string(),
        RowKey::Log(id) => id.to_string(),
        RowKey::SyncPoint(store, entity_type, entity_id) => {
            format!("sync point {store} {entity_type}/{entity_id}")
        }
        RowKey::Request(id) => format!("request-{id}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tillsync_engine::SyncConfiguration;
    use tillsync_protocol::StoreId;

    #[test]
    fn offset_and_limit_window_the_journal() {
        let dir = tempfile::tempdir().unwrap();
        let store = SyncStore::open(dir.path(), false).unwrap();
        for id in 1..=3 {
            store
                .transact(|txn| {
                    txn.put(SyncConfiguration::new(StoreId(id)));
                    Ok(())
                })
                .unwrap();
        }

        let all = collect(dir.path(), None, 0).unwrap();
        assert!(all.len() >= 3);
        assert!(all.windows(2).all(|w| w[0].offset < w[1].offset));

        let tail = collect(dir.path(), Some(1), all[1].offset).unwrap();
        assert_eq!(tail, vec![all[1].clone()]);
        assert_eq!(describe(&RowKey::Config(StoreId(2))), "config store-2");
    }
}
