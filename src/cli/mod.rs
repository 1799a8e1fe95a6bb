//! CLI module for seqvault
//!
//! Operator commands over one data directory. Every command loads the
//! config file, opens the engine (running recovery) and prints one JSON
//! object.

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command, SnapshotAction};
pub use commands::{run, run_command};
pub use errors::{CliError, CliResult};
