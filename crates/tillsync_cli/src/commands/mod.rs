//! CLI command implementations.

pub mod compact;
pub mod conflicts;
pub mod dump_journal;
pub mod intervene;
pub mod queue;
pub mod resolve;
pub mod status;

use serde::Serialize;
use std::path::Path;
use tillsync_engine::JOURNAL_FILE;
use tracing::debug;

/// Result type shared by the commands.
pub type CommandResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Prints `value` as pretty JSON.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> CommandResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Renders a payload for text output.
pub fn show_payload(payload: Option<&[u8]>) -> String {
    let Some(bytes) = payload else {
        return "<deleted>".to_string();
    };
    match std::str::from_utf8(bytes) {
        Ok(text) => match text.char_indices().nth(60) {
            None => format!("{text:?}"),
            Some((cut, _)) => format!("{:?}... ({} bytes)", &text[..cut], bytes.len()),
        },
        Err(_) => format!("<{} bytes>", bytes.len()),
    }
}

/// Fails unless `path` holds a data directory.
pub fn require_data_dir(path: &Path) -> CommandResult<()> {
    if !path.join(JOURNAL_FILE).exists() {
        return Err(format!("No tillsync data directory at {:?}", path).into());
    }
    debug!(path = %path.display(), "data directory found");
    Ok(())
}
