//! CLI argument definitions using clap
//!
//! Commands:
//! - seqvault init --config <path> --data-dir <dir>
//! - seqvault ingest --config <path> --file <jsonl>
//! - seqvault read --config <path> --key <key> --at <seq>
//! - seqvault scan --config <path> --at <seq> [--prefix <p>]
//! - seqvault diff --config <path> --from <seq> --to <seq> [--prefix <p>]
//! - seqvault snapshot create|delete|list|diff --config <path>
//! - seqvault snapshot submit-diff|jobs|cancel-diff --config <path>
//! - seqvault compact|image|prune|stats --config <path>

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

const DEFAULT_CONFIG: &str = "./seqvault.json";

/// seqvault - point-in-time reads and diffs over a change feed
#[derive(Parser, Debug)]
#[command(name = "seqvault")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Print engine logs at INFO and above instead of WARN
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Write a config file and create the data directory
    Init {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        /// Directory for engine data
        #[arg(long)]
        data_dir: PathBuf,
    },

    /// Ingest a JSON-lines change feed
    Ingest {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        /// One change record per line
        #[arg(long)]
        file: PathBuf,
        /// Records pulled per batch
        #[arg(long, default_value_t = 256)]
        batch_size: usize,
    },

    /// Value of one key as of a sequence
    Read {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        #[arg(long)]
        key: String,
        #[arg(long)]
        at: u64,
    },

    /// Every live key as of a sequence
    Scan {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        #[arg(long)]
        at: u64,
        #[arg(long)]
        prefix: Option<String>,
    },

    /// Keys changed between two sequences
    Diff {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        #[arg(long)]
        from: u64,
        #[arg(long)]
        to: u64,
        #[arg(long)]
        prefix: Option<String>,
    },

    /// Manage snapshot points
    Snapshot {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        #[command(subcommand)]
        action: SnapshotAction,
    },

    /// Compact the oldest run of delta layers
    Compact {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },

    /// Create an image layer at the flushed watermark
    Image {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },

    /// Reclaim storage no snapshot can read
    Prune {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },

    /// Engine state and counters
    Stats {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
pub enum SnapshotAction {
    /// Freeze the current (or an earlier) sequence
    Create {
        #[arg(long)]
        scope: String,
        /// Restrict diffs from this snapshot to keys under a prefix
        #[arg(long)]
        prefix: Option<String>,
        /// Earlier sequence to freeze instead of the watermark
        #[arg(long)]
        at: Option<u64>,
    },

    /// Mark a snapshot deleted
    Delete {
        #[arg(long)]
        id: Uuid,
    },

    /// List every snapshot
    List,

    /// One page of the diff between two snapshots
    Diff {
        #[arg(long)]
        from: Uuid,
        #[arg(long)]
        to: Uuid,
        #[arg(long)]
        page_token: Option<String>,
        #[arg(long, default_value_t = 100)]
        page_size: usize,
    },

    /// Queue a tracked diff between two snapshots and run it
    SubmitDiff {
        #[arg(long)]
        from: Uuid,
        #[arg(long)]
        to: Uuid,
    },

    /// List tracked diff jobs
    Jobs {
        #[arg(long, value_parser = ["queued", "in_progress", "done", "failed", "cancelled"])]
        state: Option<String>,
    },

    /// Cancel a queued or running diff job
    CancelDiff {
        #[arg(long)]
        from: Uuid,
        #[arg(long)]
        to: Uuid,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
