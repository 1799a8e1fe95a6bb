//! JSON output for the CLI
//!
//! Every command prints a single JSON object on stdout. Keys and values are
//! rendered as lossy UTF-8 strings.

use std::io::{self, Write};

use serde_json::{json, Value};

use super::errors::CliResult;
use crate::errors::display_key;
use crate::reconstruct::DiffEntry;

/// Write a success response to stdout
pub fn write_response(data: Value) -> CliResult<()> {
    let response = json!({
        "status": "ok",
        "data": data
    });

    let mut stdout = io::stdout();
    serde_json::to_writer(&mut stdout, &response)?;
    writeln!(stdout)?;
    stdout.flush()?;
    Ok(())
}

pub fn render_value(value: Option<&[u8]>) -> Value {
    match value {
        Some(v) => Value::String(display_key(v)),
        None => Value::Null,
    }
}

pub fn render_entry(entry: &DiffEntry) -> Value {
    json!({
        "key": display_key(&entry.key),
        "kind": entry.kind.as_str(),
        "before": render_value(entry.before.as_deref()),
        "after": render_value(entry.after.as_deref()),
    })
}
