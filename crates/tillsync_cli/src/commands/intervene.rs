//! Cancel and replay commands.
//!
//! Both take the directory lock and fail while a node has it open.

use super::{print_json, require_data_dir, CommandResult};
use serde::Serialize;
use std::path::Path;
use tillsync_engine::{ops, SyncStore};
use tillsync_protocol::{BatchId, QueueItemId, Timestamp};

/// Output of an intervention.
#[derive(Debug, Serialize)]
pub struct InterventionOutput {
    /// `cancel-item`, `cancel-batch` or `replay`.
    pub action: &'static str,
    /// Row acted on.
    pub target: String,
    /// Queue items returned to `pending`.
    pub released: usize,
}

/// Runs the cancel command.
pub fn cancel(
    path: &Path,
    item: Option<u64>,
    batch: Option<u64>,
    format: &str,
) -> CommandResult<()> {
    require_data_dir(path)?;
    let store = SyncStore::open(path, true)?;
    let now = Timestamp::now();
    let output = match (item, batch) {
        (Some(item), None) => {
            let item = QueueItemId(item);
            ops::cancel_item(&store, item, now)?;
            InterventionOutput {
                action: "cancel-item",
                target: item.to_string(),
                released: 0,
            }
        }
        (None, Some(batch)) => {
            let batch = BatchId(batch);
            let released = ops::cancel_batch(&store, batch, now)?;
            InterventionOutput {
                action: "cancel-batch",
                target: batch.to_string(),
                released,
            }
        }
        _ => return Err("Exactly one of --item or --batch is required".into()),
    };
    print_output(&output, format)
}

/// Runs the replay command.
pub fn replay(path: &Path, item: u64, format: &str) -> CommandResult<()> {
    require_data_dir(path)?;
    let store = SyncStore::open(path, true)?;
    let item = QueueItemId(item);
    ops::replay_failed(&store, item, Timestamp::now())?;
    print_output(
        &InterventionOutput {
            action: "replay",
            target: item.to_string(),
            released: 1,
        },
        format,
    )
}

fn print_output(output: &InterventionOutput, format: &str) -> CommandResult<()> {
    match format {
        "json" => print_json(output)?,
        _ => {
            println!("{}: {}", output.action, output.target);
            if output.released > 0 {
                println!("  {} item(s) back in the queue", output.released);
            }
        }
    }
    Ok(())
}
