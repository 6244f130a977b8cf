//! Resolve command implementation.
//!
//! The resolution is recorded as a request; the node applies it on its
//! next cycle. The command takes the directory lock, so it fails while a
//! node has the directory open.

use super::{print_json, require_data_dir, CommandResult};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tillsync_engine::{ops, SyncStore};
use tillsync_protocol::{ConflictId, Timestamp};

/// Which side of a conflict to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The version held by the node that detected the conflict.
    Local,
    /// The incoming version.
    Remote,
}

/// The value an operator chose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Choice {
    /// Keep one side unchanged.
    Take(Side),
    /// Use an explicit payload.
    Payload(Vec<u8>),
    /// Resolve to a delete.
    Delete,
}

impl Choice {
    /// Builds the choice from command-line arguments.
    pub fn from_args(
        take: Option<&str>,
        payload_file: Option<PathBuf>,
        delete: bool,
    ) -> CommandResult<Self> {
        match (take, payload_file, delete) {
            (Some("local"), None, false) => Ok(Choice::Take(Side::Local)),
            (Some("remote"), None, false) => Ok(Choice::Take(Side::Remote)),
            (Some(other), None, false) => Err(format!("Unknown side: {other}").into()),
            (None, Some(file), false) => Ok(Choice::Payload(std::fs::read(file)?)),
            (None, None, true) => Ok(Choice::Delete),
            (None, None, false) => {
                Err("One of --take, --payload-file or --delete is required".into())
            }
            _ => Err("--take, --payload-file and --delete are exclusive".into()),
        }
    }
}

/// Output of the resolve command.
#[derive(Debug, Serialize)]
pub struct ResolveOutput {
    /// Conflict resolved.
    pub conflict: ConflictId,
    /// Request row id.
    pub request: u64,
    /// Resolved value size, `None` for a delete.
    pub payload_bytes: Option<usize>,
    /// Who resolved it.
    pub user: String,
}

/// Runs the resolve command.
pub fn run(
    path: &Path,
    conflict: u64,
    choice: Choice,
    user: &str,
    notes: Option<String>,
    format: &str,
) -> CommandResult<()> {
    let output = record(path, ConflictId(conflict), choice, user, notes)?;
    match format {
        "json" => print_json(&output)?,
        _ => {
            println!(
                "Resolution {} recorded for {} by {}",
                output.request, output.conflict, output.user
            );
            match output.payload_bytes {
                Some(n) => println!("  value: {n} bytes"),
                None => println!("  value: <deleted>"),
            }
            println!("  applied on the node's next cycle");
        }
    }
    Ok(())
}

/// Records the resolution request.
pub fn record(
    path: &Path,
    conflict_id: ConflictId,
    choice: Choice,
    user: &str,
    notes: Option<String>,
) -> CommandResult<ResolveOutput> {
    require_data_dir(path)?;
    let store = SyncStore::open(path, true)?;
    let payload = match choice {
        Choice::Payload(bytes) => Some(bytes),
        Choice::Delete => None,
        Choice::Take(side) => {
            let tables = store.read();
            let conflict = tables
                .conflicts
                .get(&conflict_id)
                .ok_or_else(|| format!("No such conflict: {conflict_id}"))?;
            match side {
                Side::Local => conflict.local.payload.clone(),
                Side::Remote => conflict.remote.payload.clone(),
            }
        }
    };
    let payload_bytes = payload.as_ref().map(Vec::len);
    let request =
        ops::request_resolution(&store, conflict_id, payload, user, notes, Timestamp::now())?;
    Ok(ResolveOutput {
        conflict: conflict_id,
        request,
        payload_bytes,
        user: user.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn choice_from_args() {
        assert_eq!(
            Choice::from_args(Some("local"), None, false).unwrap(),
            Choice::Take(Side::Local)
        );
        assert_eq!(
            Choice::from_args(Some("remote"), None, false).unwrap(),
            Choice::Take(Side::Remote)
        );
        assert_eq!(Choice::from_args(None, None, true).unwrap(), Choice::Delete);
        assert!(Choice::from_args(None, None, false).is_err());
        assert!(Choice::from_args(Some("both"), None, false).is_err());
        assert!(Choice::from_args(Some("local"), None, true).is_err());
    }

    #[test]
    fn payload_comes_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("value.json");
        std::fs::write(&file, br#"{"price":1.49}"#).unwrap();
        assert_eq!(
            Choice::from_args(None, Some(file), false).unwrap(),
            Choice::Payload(br#"{"price":1.49}"#.to_vec())
        );
        assert!(Choice::from_args(None, Some(dir.path().join("missing")), false).is_err());
    }

    #[test]
    fn unknown_conflict_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        drop(SyncStore::open(dir.path(), false).unwrap());
        let result = record(dir.path(), ConflictId(9), Choice::Delete, "ops", None);
        assert!(result.is_err());
    }
}
