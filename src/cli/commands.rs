//! CLI command implementations
//!
//! Every command except `init` opens the engine through the same boot
//! sequence as a long-running process: load and validate config, open the
//! substrate, run recovery. Nothing is served before recovery completes.

use std::fs;
use std::path::Path;

use serde_json::{json, Map, Value};

use super::args::{Cli, Command, SnapshotAction};
use super::errors::{CliError, CliResult};
use super::io::{render_entry, render_value, write_response};
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::errors::{display_key, VaultError};
use crate::ingest::{FeedReader, JsonlFeed};
use crate::observability::{Logger, Severity};
use crate::reconstruct::{CancelToken, DiffJob, DiffJobState};
use crate::record::Sequence;
use crate::snapshot::SnapshotInfo;

/// Parse arguments and run the selected command.
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    Logger::set_min_severity(if cli.verbose {
        Severity::Info
    } else {
        Severity::Warn
    });
    run_command(cli.command)
}

pub fn run_command(command: Command) -> CliResult<()> {
    let data = match command {
        Command::Init { config, data_dir } => init(&config, &data_dir)?,
        Command::Ingest {
            config,
            file,
            batch_size,
        } => ingest(&open_engine(&config)?, &file, batch_size)?,
        Command::Read { config, key, at } => {
            let engine = open_engine(&config)?;
            let value = engine.read_at(key.as_bytes(), Sequence::new(at))?;
            json!({ "key": key, "at": at, "value": render_value(value.as_deref()) })
        }
        Command::Scan { config, at, prefix } => {
            let engine = open_engine(&config)?;
            let state = engine.reconstruct_state(
                Sequence::new(at),
                prefix.as_deref().map(str::as_bytes),
                &CancelToken::new(),
            )?;
            let mut keys = Map::new();
            for (key, value) in &state {
                keys.insert(display_key(key), render_value(Some(value)));
            }
            json!({ "at": at, "count": state.len(), "keys": keys })
        }
        Command::Diff {
            config,
            from,
            to,
            prefix,
        } => {
            let engine = open_engine(&config)?;
            let report = engine.diff(
                Sequence::new(from),
                Sequence::new(to),
                prefix.as_deref().map(str::as_bytes),
            )?;
            json!({
                "from": from,
                "to": to,
                "files": report.files.iter().map(|id| id.value()).collect::<Vec<_>>(),
                "same_files": report.same_files.iter().map(|id| id.value()).collect::<Vec<_>>(),
                "entries": report.entries.iter().map(render_entry).collect::<Vec<_>>(),
            })
        }
        Command::Snapshot { config, action } => snapshot(&open_engine(&config)?, action)?,
        Command::Compact { config } => match open_engine(&config)?.compact()? {
            Some(report) => json!({
                "trigger": report.trigger.as_str(),
                "range": report.range.to_string(),
                "inputs": report.inputs.len(),
                "outputs": report.outputs.len(),
                "records_in": report.records_in,
                "records_out": report.records_out,
                "records_dropped": report.records_dropped,
            }),
            None => json!({ "compacted": false }),
        },
        Command::Image { config } => match open_engine(&config)?.create_image()? {
            Some(report) => json!({
                "image_id": report.image_id.value(),
                "sequence": report.sequence,
                "key_count": report.key_count,
                "byte_size": report.byte_size,
            }),
            None => json!({ "created": false }),
        },
        Command::Prune { config } => serde_json::to_value(open_engine(&config)?.prune_reclaimable()?)?,
        Command::Stats { config } => {
            let engine = open_engine(&config)?;
            json!({
                "engine": serde_json::to_value(engine.stats()?)?,
                "metrics": serde_json::to_value(engine.metrics())?,
                "recovery": serde_json::to_value(engine.recovery_report())?,
            })
        }
    };
    write_response(data)
}

fn open_engine(config_path: &Path) -> CliResult<Engine> {
    if !config_path.exists() {
        return Err(CliError::not_initialized(config_path));
    }
    let config = EngineConfig::load(config_path)?;
    Ok(Engine::open(config)?)
}

/// Write a default config and create the data directory.
pub fn init(config_path: &Path, data_dir: &Path) -> CliResult<Value> {
    if config_path.exists() {
        return Err(CliError::already_initialized(config_path));
    }
    fs::create_dir_all(data_dir)?;
    let config = EngineConfig::new(data_dir);
    config.validate()?;
    config.save(config_path)?;

    // Opening once lays out the substrate
    let engine = Engine::open(config)?;
    Ok(json!({
        "config": config_path.display().to_string(),
        "data_dir": data_dir.display().to_string(),
        "watermark": engine.watermark()?,
    }))
}

fn ingest(engine: &Engine, file: &Path, batch_size: usize) -> CliResult<Value> {
    let feed = JsonlFeed::open(file).map_err(VaultError::from)?;
    let mut reader = FeedReader::new(feed, batch_size);
    let ingested = reader.run_until_drained(engine)?;
    engine.flush()?;
    let pass = engine.run_maintenance()?;
    Ok(json!({
        "ingested": ingested,
        "watermark": engine.watermark()?,
        "compacted": pass.compaction.is_some(),
        "image": pass.image.map(|image| image.sequence),
    }))
}

fn render_snapshot(info: &SnapshotInfo) -> Value {
    json!({
        "id": info.id.to_string(),
        "scope": info.scope,
        "frozen_sequence": info.frozen_sequence,
        "state": info.state.as_str(),
        "created_at": info.created_at.to_rfc3339(),
        "deleted_at": info.deleted_at.map(|t| t.to_rfc3339()),
        "key_prefix": info.key_prefix.as_deref().map(display_key),
    })
}

fn snapshot(engine: &Engine, action: SnapshotAction) -> CliResult<Value> {
    Ok(match action {
        SnapshotAction::Create { scope, prefix, at } => {
            let prefix = prefix.map(String::into_bytes);
            let info = match at {
                Some(at) => engine.create_snapshot_at(&scope, Sequence::new(at), prefix)?,
                None => engine.create_snapshot_point_with_prefix(&scope, prefix)?,
            };
            render_snapshot(&info)
        }
        SnapshotAction::Delete { id } => {
            engine.delete_snapshot_point(id)?;
            json!({ "id": id.to_string(), "deleted": true })
        }
        SnapshotAction::List => {
            let snapshots = engine.list_snapshots()?;
            json!({
                "count": snapshots.len(),
                "snapshots": snapshots.iter().map(render_snapshot).collect::<Vec<_>>(),
            })
        }
        SnapshotAction::Diff {
            from,
            to,
            page_token,
            page_size,
        } => {
            let page = engine.diff_snapshots(from, to, page_token.as_deref(), page_size)?;
            json!({
                "from_snapshot": page.from_snapshot.to_string(),
                "to_snapshot": page.to_snapshot.to_string(),
                "from": page.from,
                "to": page.to,
                "total": page.total,
                "next_page_token": page.next_page_token,
                "entries": page.entries.iter().map(render_entry).collect::<Vec<_>>(),
            })
        }
        SnapshotAction::SubmitDiff { from, to } => {
            engine.submit_snapshot_diff(from, to)?;
            engine.run_snapshot_diff_jobs()?;
            render_job(&engine.snapshot_diff_job(from, to)?)
        }
        SnapshotAction::Jobs { state } => {
            let jobs = engine.list_snapshot_diff_jobs(state.as_deref().and_then(DiffJobState::parse))?;
            json!({
                "count": jobs.len(),
                "jobs": jobs.iter().map(render_job).collect::<Vec<_>>(),
            })
        }
        SnapshotAction::CancelDiff { from, to } => render_job(&engine.cancel_snapshot_diff(from, to)?),
    })
}

fn render_job(job: &DiffJob) -> Value {
    json!({
        "job_id": job.job_id.to_string(),
        "from_snapshot": job.from_snapshot.to_string(),
        "to_snapshot": job.to_snapshot.to_string(),
        "from": job.from,
        "to": job.to,
        "state": job.state.as_str(),
        "submitted_at": job.submitted_at.to_rfc3339(),
        "finished_at": job.finished_at.map(|t| t.to_rfc3339()),
        "total_entries": job.total_entries,
        "error": job.error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_writes_config_once() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("seqvault.json");
        let data = dir.path().join("data");

        let out = init(&config, &data).unwrap();
        assert_eq!(out["watermark"], 0);
        assert!(config.exists());
        assert_eq!(EngineConfig::load(&config).unwrap().data_dir, data);

        let err = init(&config, &data).unwrap_err();
        assert_eq!(err.code_str(), "VAULT_CLI_ALREADY_INITIALIZED");
    }

    #[test]
    fn test_open_without_config() {
        let dir = TempDir::new().unwrap();
        let err = open_engine(&dir.path().join("missing.json")).err().unwrap();
        assert_eq!(err.code_str(), "VAULT_CLI_NOT_INITIALIZED");
    }

    #[test]
    fn test_ingest_file_then_read() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("seqvault.json");
        init(&config, &dir.path().join("data")).unwrap();

        let feed = dir.path().join("feed.jsonl");
        fs::write(
            &feed,
            concat!(
                r#"{"key":"a","sequence":1,"op":"put","value":"x"}"#,
                "\n",
                r#"{"key":"a","sequence":5,"op":"put","value":"y"}"#,
                "\n",
            ),
        )
        .unwrap();

        let engine = open_engine(&config).unwrap();
        let out = ingest(&engine, &feed, 16).unwrap();
        assert_eq!(out["ingested"], 2);
        assert_eq!(engine.read_at(b"a", Sequence::new(3)).unwrap(), Some(b"x".to_vec()));
    }

    #[test]
    fn test_submit_then_list_diff_jobs() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("seqvault.json");
        init(&config, &dir.path().join("data")).unwrap();
        let engine = open_engine(&config).unwrap();

        engine.ingest(crate::record::ChangeRecord::put("a", 1, "x")).unwrap();
        let from = engine.create_snapshot_point("cli").unwrap();
        engine.ingest(crate::record::ChangeRecord::put("b", 2, "y")).unwrap();
        let to = engine.create_snapshot_point("cli").unwrap();

        let out = snapshot(&engine, SnapshotAction::SubmitDiff { from: from.id, to: to.id }).unwrap();
        assert_eq!(out["state"], "done");
        assert_eq!(out["total_entries"], 1);

        let out = snapshot(
            &engine,
            SnapshotAction::Jobs {
                state: Some("done".to_string()),
            },
        )
        .unwrap();
        assert_eq!(out["count"], 1);

        let err = snapshot(&engine, SnapshotAction::CancelDiff { from: from.id, to: to.id }).unwrap_err();
        assert_eq!(err.code_str(), "VAULT_DIFF_JOB_NOT_CANCELLABLE");
    }
}
