//! seqvault operator CLI
//!
//! Prints `<code>: <message>` to stderr and exits 1 on any failure.

use seqvault::cli;

fn main() {
    if let Err(e) = cli::run() {
        eprintln!("{}: {}", e.code_str(), e);
        std::process::exit(1);
    }
}
