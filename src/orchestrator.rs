//! Fans a run out over W partitions and collects each worker's outcome.
//!
//! Workers are fail-independent: one worker failing or crashing never stops
//! its siblings, and nothing is retried automatically. Re-invoking the same
//! partition is safe because writes are idempotent and checkpoints resume.

use anyhow::{Context, Result};
use serde::Serialize;
use std::env;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use crate::partition::PartitionSpec;
use crate::pipeline::RunSummary;

/// Terminal status of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerStatus {
    Completed,
    /// Exited with an error (non-zero code, or an error returned in-process).
    Failed { exit_code: Option<i32>, message: String },
    /// Killed by a signal, or the task panicked.
    Crashed { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    pub partition: String,
    #[serde(flatten)]
    pub status: WorkerStatus,
    pub summary: Option<RunSummary>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OrchestratorReport {
    pub workers: Vec<WorkerReport>,
    pub total: RunSummary,
}

impl OrchestratorReport {
    fn from_workers(mut workers: Vec<WorkerReport>) -> Self {
        workers.sort_by_key(|w| {
            w.partition
                .split('/')
                .next()
                .and_then(|i| i.parse::<usize>().ok())
        });
        let mut total = RunSummary::default();
        for w in &workers {
            if let Some(s) = &w.summary {
                if total.provider.is_empty() {
                    total.provider = s.provider.clone();
                }
                total.merge(s);
            }
        }
        total.completed = !workers.is_empty()
            && workers
                .iter()
                .all(|w| w.summary.as_ref().is_some_and(|s| s.completed));
        Self { workers, total }
    }

    pub fn failed_workers(&self) -> impl Iterator<Item = &WorkerReport> {
        self.workers
            .iter()
            .filter(|w| !matches!(w.status, WorkerStatus::Completed))
    }

    pub fn all_completed(&self) -> bool {
        self.failed_workers().next().is_none()
    }
}

/// Worker binary: `INGEST_WORKER_BIN`, else the running executable.
pub fn worker_binary() -> Result<PathBuf> {
    if let Ok(bin) = env::var("INGEST_WORKER_BIN") {
        if !bin.trim().is_empty() {
            return Ok(PathBuf::from(bin));
        }
    }
    env::current_exe().context("resolving current executable for worker spawn")
}

fn inherit_db_env(cmd: &mut Command) {
    for key in ["DATABASE_URL", "DB_URL", "USE_PREPARED", "FAST_INGEST", "RUST_LOG"] {
        if let Ok(v) = env::var(key) {
            cmd.env(key, v);
        }
    }
}

struct RunningWorker {
    partition: PartitionSpec,
    child: Child,
    summary: JoinHandle<Option<RunSummary>>,
}

fn spawn_worker(program: &Path, args: &[String], partition: PartitionSpec) -> Result<RunningWorker> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .arg("--partition")
        .arg(partition.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    inherit_db_env(&mut cmd);
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn worker {} for partition {partition}", program.display()))?;

    let stdout = child.stdout.take();
    let summary = tokio::spawn(async move {
        let stdout = stdout?;
        let mut lines = BufReader::new(stdout).lines();
        let mut found = None;
        while let Ok(Some(line)) = lines.next_line().await {
            match RunSummary::parse_summary_line(&line) {
                Some(s) => found = Some(s),
                None => info!(partition = %partition, "{line}"),
            }
        }
        found
    });
    Ok(RunningWorker {
        partition,
        child,
        summary,
    })
}

fn status_from_exit(exit: ExitStatus) -> WorkerStatus {
    if exit.success() {
        return WorkerStatus::Completed;
    }
    match exit.code() {
        Some(code) => WorkerStatus::Failed {
            exit_code: Some(code),
            message: format!("worker exited with code {code}"),
        },
        None => WorkerStatus::Crashed {
            message: format!("worker terminated abnormally ({exit})"),
        },
    }
}

/// Spawn one child process per partition and poll them until all exit.
///
/// Each child runs `program args... --partition i/W` and is expected to print
/// one summary line on stdout.
pub async fn run_processes(
    program: PathBuf,
    args: Vec<String>,
    workers: usize,
    poll_interval: Duration,
) -> OrchestratorReport {
    let mut running: Vec<RunningWorker> = Vec::new();
    let mut reports: Vec<WorkerReport> = Vec::new();

    for partition in PartitionSpec::all(workers) {
        match spawn_worker(&program, &args, partition) {
            Ok(w) => {
                info!(partition = %partition, pid = ?w.child.id(), "worker started");
                running.push(w);
            }
            Err(e) => {
                error!(partition = %partition, error = %format!("{e:#}"), "worker failed to start");
                reports.push(WorkerReport {
                    partition: partition.to_string(),
                    status: WorkerStatus::Failed {
                        exit_code: None,
                        message: format!("{e:#}"),
                    },
                    summary: None,
                });
            }
        }
    }

    while !running.is_empty() {
        let mut still_running = Vec::with_capacity(running.len());
        for mut w in running {
            match w.child.try_wait() {
                Ok(None) => still_running.push(w),
                Ok(Some(exit)) => {
                    let status = status_from_exit(exit);
                    let summary = w.summary.await.ok().flatten();
                    log_worker_exit(w.partition, &status, summary.as_ref());
                    reports.push(WorkerReport {
                        partition: w.partition.to_string(),
                        status,
                        summary,
                    });
                }
                Err(e) => {
                    error!(partition = %w.partition, error = %e, "lost track of worker");
                    w.summary.abort();
                    reports.push(WorkerReport {
                        partition: w.partition.to_string(),
                        status: WorkerStatus::Crashed {
                            message: e.to_string(),
                        },
                        summary: None,
                    });
                }
            }
        }
        running = still_running;
        if !running.is_empty() {
            tokio::time::sleep(poll_interval).await;
        }
    }

    OrchestratorReport::from_workers(reports)
}

/// Run one task per partition inside this process. `make_worker` builds the
/// partition's pipeline future; each gets its own writer, cache and
/// checkpoint scope.
pub async fn run_in_process<F, Fut>(workers: usize, make_worker: F) -> OrchestratorReport
where
    F: Fn(PartitionSpec) -> Fut,
    Fut: Future<Output = Result<RunSummary>> + Send + 'static,
{
    let mut set = JoinSet::new();
    let mut partitions = std::collections::HashMap::new();
    for partition in PartitionSpec::all(workers) {
        let fut = make_worker(partition);
        let handle = set.spawn(async move { (partition, fut.await) });
        partitions.insert(handle.id(), partition);
        info!(partition = %partition, "worker task started");
    }

    let mut reports = Vec::new();
    while let Some(joined) = set.join_next_with_id().await {
        let (partition, status, summary) = match joined {
            Ok((_, (partition, Ok(summary)))) => (partition, WorkerStatus::Completed, Some(summary)),
            Ok((_, (partition, Err(e)))) => (
                partition,
                WorkerStatus::Failed {
                    exit_code: None,
                    message: format!("{e:#}"),
                },
                None,
            ),
            Err(e) => {
                let Some(partition) = partitions.get(&e.id()).copied() else {
                    warn!(error = %e, "unknown worker task ended");
                    continue;
                };
                (
                    partition,
                    WorkerStatus::Crashed {
                        message: e.to_string(),
                    },
                    None,
                )
            }
        };
        log_worker_exit(partition, &status, summary.as_ref());
        reports.push(WorkerReport {
            partition: partition.to_string(),
            status,
            summary,
        });
    }
    OrchestratorReport::from_workers(reports)
}

fn log_worker_exit(partition: PartitionSpec, status: &WorkerStatus, summary: Option<&RunSummary>) {
    match status {
        WorkerStatus::Completed => info!(
            partition = %partition,
            processed = summary.map(|s| s.processed),
            failed = summary.map(|s| s.failed),
            "worker completed"
        ),
        WorkerStatus::Failed { exit_code, message } => error!(
            partition = %partition,
            exit_code = ?exit_code,
            %message,
            "worker failed; re-run this partition to resume"
        ),
        WorkerStatus::Crashed { message } => error!(
            partition = %partition,
            %message,
            "worker crashed; re-run this partition to resume"
        ),
    }
}
