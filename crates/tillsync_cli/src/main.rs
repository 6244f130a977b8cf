//! tillsync CLI
//!
//! Operator tools for a tillsync data directory.
//!
//! # Commands
//!
//! - `status` - Sync health of every configured store
//! - `queue` - Queue items of a store in scheduling order
//! - `conflicts` - Conflicts needing an operator
//! - `resolve` - Record a resolution for the node's next cycle
//! - `cancel` - Cancel a queue item or an unfinished batch
//! - `replay` - Put a dead-lettered item back in the queue
//! - `dump-journal` - List journal entries for debugging
//! - `compact` - Rewrite the journal as a snapshot

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// tillsync operator tools.
#[derive(Parser)]
#[command(name = "tillsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the data directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(global = true, short, long, default_value = "text", value_parser = ["text", "json"])]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show sync health of every configured store
    Status,

    /// List queue items of a store
    Queue {
        /// Store id
        #[arg(short, long)]
        store: u32,

        /// Only items with this status (pending, in-progress, completed,
        /// failed, cancelled, conflict)
        #[arg(long)]
        status: Option<String>,
    },

    /// List conflicts needing an operator
    Conflicts {
        /// Store id
        #[arg(short, long)]
        store: u32,
    },

    /// Record a conflict resolution for the node's next cycle
    Resolve {
        /// Conflict id
        conflict: u64,

        /// Keep one side as it is (local, remote)
        #[arg(long, value_parser = ["local", "remote"], conflicts_with_all = ["payload_file", "delete"])]
        take: Option<String>,

        /// Use the contents of a file as the resolved value
        #[arg(long, conflicts_with = "delete")]
        payload_file: Option<PathBuf>,

        /// Resolve to a delete
        #[arg(long)]
        delete: bool,

        /// Who resolved the conflict
        #[arg(short, long)]
        user: String,

        /// Notes kept with the resolution
        #[arg(short, long)]
        notes: Option<String>,
    },

    /// Cancel a queue item or an unfinished batch
    Cancel {
        /// Queue item id
        #[arg(long, conflicts_with = "batch", required_unless_present = "batch")]
        item: Option<u64>,

        /// Batch id
        #[arg(long)]
        batch: Option<u64>,
    },

    /// Replay a dead-lettered queue item with a fresh retry budget
    Replay {
        /// Queue item id
        item: u64,
    },

    /// Dump journal entries for debugging
    DumpJournal {
        /// Maximum number of entries to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Skip entries before this byte offset
        #[arg(short, long, default_value = "0")]
        offset: u64,
    },

    /// Rewrite the journal as a snapshot of current rows
    Compact,

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let format = cli.format.as_str();
    match cli.command {
        Commands::Status => {
            let path = cli.path.ok_or("Data directory required for status")?;
            commands::status::run(&path, format)?;
        }
        Commands::Queue { store, status } => {
            let path = cli.path.ok_or("Data directory required for queue")?;
            commands::queue::run(&path, store, status.as_deref(), format)?;
        }
        Commands::Conflicts { store } => {
            let path = cli.path.ok_or("Data directory required for conflicts")?;
            commands::conflicts::run(&path, store, format)?;
        }
        Commands::Resolve {
            conflict,
            take,
            payload_file,
            delete,
            user,
            notes,
        } => {
            let path = cli.path.ok_or("Data directory required for resolve")?;
            let choice = commands::resolve::Choice::from_args(take.as_deref(), payload_file, delete)?;
            commands::resolve::run(&path, conflict, choice, &user, notes, format)?;
        }
        Commands::Cancel { item, batch } => {
            let path = cli.path.ok_or("Data directory required for cancel")?;
            commands::intervene::cancel(&path, item, batch, format)?;
        }
        Commands::Replay { item } => {
            let path = cli.path.ok_or("Data directory required for replay")?;
            commands::intervene::replay(&path, item, format)?;
        }
        Commands::DumpJournal { limit, offset } => {
            let path = cli.path.ok_or("Data directory required for dump-journal")?;
            commands::dump_journal::run(&path, limit, offset, format)?;
        }
        Commands::Compact => {
            let path = cli.path.ok_or("Data directory required for compact")?;
            commands::compact::run(&path, format)?;
        }
        Commands::Version => {
            println!("tillsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "tillsync protocol schema v{}",
                tillsync_protocol::SCHEMA_VERSION
            );
        }
    }

    Ok(())
}
