//! Background maintenance
//!
//! One worker task drains a task queue and runs each task on the blocking
//! pool, one at a time. A ticker enqueues periodic compaction, image,
//! reclamation and queued diff job runs. Failures are logged and the worker keeps going; the
//! same task is retried on the next tick.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::Core;
use crate::checkpoint::{create_image, image_due};
use crate::compaction::compact;
use crate::errors::VaultResult;
use crate::layer::flush;
use crate::observability::{log_event_with_fields, Event};
use crate::reclaim::prune_reclaimable;
use crate::reconstruct::run_queued;

/// Work the maintenance worker knows how to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceTask {
    Flush,
    Compact { force: bool },
    CreateImage { force: bool },
    Reclaim,
    DiffJobs,
    Shutdown,
}

impl MaintenanceTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaintenanceTask::Flush => "flush",
            MaintenanceTask::Compact { .. } => "compact",
            MaintenanceTask::CreateImage { .. } => "create_image",
            MaintenanceTask::Reclaim => "reclaim",
            MaintenanceTask::DiffJobs => "diff_jobs",
            MaintenanceTask::Shutdown => "shutdown",
        }
    }

    fn execute(self, core: &Core) -> VaultResult<()> {
        match self {
            MaintenanceTask::Flush => flush(core).map(|_| ()),
            MaintenanceTask::Compact { force } => compact(core, force).map(|_| ()),
            MaintenanceTask::CreateImage { force } => {
                if force || image_due(core)? {
                    create_image(core)?;
                }
                Ok(())
            }
            MaintenanceTask::Reclaim => prune_reclaimable(core).map(|_| ()),
            MaintenanceTask::DiffJobs => run_queued(core).map(|_| ()),
            MaintenanceTask::Shutdown => Ok(()),
        }
    }
}

impl fmt::Display for MaintenanceTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub type TaskSender = mpsc::UnboundedSender<MaintenanceTask>;

/// Running worker and ticker.
#[derive(Debug)]
pub(crate) struct MaintenanceHandle {
    pub(crate) sender: TaskSender,
    worker: JoinHandle<()>,
    ticker: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Spawn worker and ticker on the current runtime.
    pub(crate) fn spawn(core: Arc<Core>, interval: Duration) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(core, receiver));
        let ticker = tokio::spawn(run_ticker(sender.clone(), interval));
        Self {
            sender,
            worker,
            ticker,
        }
    }

    /// Stop the ticker, let queued tasks finish, then stop the worker.
    pub(crate) async fn stop(self) {
        self.ticker.abort();
        let _ = self.sender.send(MaintenanceTask::Shutdown);
        let _ = self.worker.await;
    }
}

async fn run_worker(core: Arc<Core>, mut receiver: mpsc::UnboundedReceiver<MaintenanceTask>) {
    while let Some(task) = receiver.recv().await {
        if task == MaintenanceTask::Shutdown {
            break;
        }
        let worker_core = Arc::clone(&core);
        let outcome = tokio::task::spawn_blocking(move || task.execute(&worker_core)).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => log_event_with_fields(
                Event::MaintenanceFailed,
                &[
                    ("task", task.as_str()),
                    ("code", err.code()),
                    ("error", &err.to_string()),
                ],
            ),
            Err(join) => log_event_with_fields(
                Event::MaintenanceFailed,
                &[("task", task.as_str()), ("error", &join.to_string())],
            ),
        }
    }
}

async fn run_ticker(sender: TaskSender, interval: Duration) {
    let mut ticks = tokio::time::interval(interval);
    // The first tick completes immediately
    ticks.tick().await;
    loop {
        ticks.tick().await;
        let periodic = [
            MaintenanceTask::Compact { force: false },
            MaintenanceTask::CreateImage { force: false },
            MaintenanceTask::Reclaim,
            MaintenanceTask::DiffJobs,
        ];
        for task in periodic {
            if sender.send(task).is_err() {
                return;
            }
        }
    }
}
