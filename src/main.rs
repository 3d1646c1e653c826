use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use catalog_ingest::{
    checkpoint::CheckpointStore,
    config::{IngestConfig, WorkerMode},
    database_ops::{MemorySink, PgSink, Sink},
    errors::IngestError,
    orchestrator::{self, OrchestratorReport},
    partition::{partition_range, PartitionSpec},
    pipeline::{IngestionPipeline, RunSummary},
    records::{load_work_list, DumpRecordFetcher, RecordFetcher, WorkEntry},
    tracing::init_tracing,
    util::env::{self as env_util, redact_dsn},
};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "catalog-ingest",
    version,
    about = "Resolve provider game records onto the canonical catalog"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest a work list (fans out over workers when --workers > 1)
    Run(RunArgs),
    /// Print row counts per canonical table
    Counts,
    /// Inspect or remove a checkpoint
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
    /// Show how a work list splits across workers
    Partitions(PartitionArgs),
}

#[derive(Subcommand, Debug)]
enum CheckpointAction {
    Show(CheckpointArgs),
    Clear(CheckpointArgs),
}

#[derive(Debug, Args)]
struct CheckpointArgs {
    #[arg(long)]
    provider: String,
    /// Partition scope, e.g. 2/4
    #[arg(long)]
    partition: Option<PartitionSpec>,
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct PartitionArgs {
    #[arg(long)]
    workers: usize,
    /// Number of work items; read from --input when omitted
    #[arg(long)]
    total: Option<usize>,
    #[arg(long)]
    input: Option<PathBuf>,
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    /// Provider key the work list belongs to
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    provider_name: Option<String>,
    #[arg(long)]
    provider_base_url: Option<String>,
    /// JSON array or NDJSON of ids / records
    #[arg(long)]
    input: Option<PathBuf>,
    /// Provider dump used to resolve bare ids
    #[arg(long)]
    record_dump: Option<PathBuf>,
    /// Resolve everything but write nothing
    #[arg(long, action = ArgAction::SetTrue)]
    dry_run: bool,
    /// Cap on items processed by each worker
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    buffer_size: Option<usize>,
    #[arg(long)]
    max_params: Option<usize>,
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long, value_enum)]
    mode: Option<WorkerMode>,
    /// Ignore any saved checkpoint
    #[arg(long = "no-resume", action = ArgAction::SetTrue)]
    no_resume: bool,
    /// Run a single partition (set by the orchestrator for child workers)
    #[arg(long)]
    partition: Option<PartitionSpec>,
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,
    #[arg(long)]
    checkpoint_secs: Option<u64>,
}

impl RunArgs {
    fn apply(self, cfg: &mut IngestConfig) {
        if let Some(v) = self.provider {
            cfg.provider_key = Some(v);
        }
        if let Some(v) = self.provider_name {
            cfg.provider_name = Some(v);
        }
        if let Some(v) = self.provider_base_url {
            cfg.provider_base_url = Some(v);
        }
        if let Some(v) = self.input {
            cfg.input = Some(v);
        }
        if let Some(v) = self.record_dump {
            cfg.record_dump = Some(v);
        }
        if self.dry_run {
            cfg.dry_run = true;
        }
        if let Some(v) = self.limit {
            cfg.limit = Some(v);
        }
        if let Some(v) = self.buffer_size {
            cfg.buffer_size = v;
        }
        if let Some(v) = self.max_params {
            cfg.max_params = v;
        }
        if let Some(v) = self.workers {
            cfg.workers = v;
        }
        if let Some(v) = self.mode {
            cfg.mode = v;
        }
        if self.no_resume {
            cfg.resume = false;
        }
        if let Some(v) = self.partition {
            cfg.partition = Some(v);
        }
        if let Some(v) = self.checkpoint_dir {
            cfg.checkpoint_dir = v;
        }
        if let Some(v) = self.checkpoint_secs {
            cfg.checkpoint_interval = Duration::from_secs(v);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    init_tracing("info,sqlx=warn")?;

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Counts => counts().await,
        Command::Checkpoint { action } => checkpoint(action),
        Command::Partitions(args) => partitions(args).await,
    }
}

async fn open_sink(cfg: &IngestConfig) -> Result<Arc<dyn Sink>> {
    match &cfg.database_url {
        Some(url) => {
            info!(database = %redact_dsn(url), "connecting sink");
            let sink = PgSink::connect(url, cfg.max_connections).await?;
            Ok(Arc::new(sink))
        }
        None if cfg.dry_run => {
            warn!("no database configured; dry run resolves against an empty catalog");
            Ok(Arc::new(MemorySink::new()))
        }
        None => Err(IngestError::MissingConfig {
            key: "DATABASE_URL".into(),
        }
        .into()),
    }
}

async fn open_fetcher(cfg: &IngestConfig) -> Result<Option<Arc<dyn RecordFetcher>>> {
    let Some(path) = &cfg.record_dump else {
        return Ok(None);
    };
    let fetcher = DumpRecordFetcher::from_file(path).await?;
    info!(path = %path.display(), records = fetcher.len(), "record dump loaded");
    Ok(Some(Arc::new(fetcher)))
}

async fn run(args: RunArgs) -> Result<()> {
    let mut cfg = IngestConfig::from_env()?;
    args.apply(&mut cfg);
    let cfg = cfg.validate()?;

    let input = cfg.input.clone().context("input path missing after validation")?;
    let entries: Arc<[WorkEntry]> = load_work_list(&input).await?.into();
    info!(
        provider = %cfg.provider_key(),
        items = entries.len(),
        workers = cfg.workers,
        mode = ?cfg.mode,
        dry_run = cfg.dry_run,
        "work list loaded"
    );

    // child worker: one partition, summary on stdout
    if let Some(partition) = cfg.partition {
        let summary = run_partition(&cfg, Some(partition), entries).await?;
        println!("{}", summary.summary_line()?);
        return Ok(());
    }

    let sink = open_sink(&cfg).await?;
    if !cfg.dry_run {
        sink.ensure_schema().await?;
    }

    if cfg.workers <= 1 {
        let fetcher = open_fetcher(&cfg).await?;
        let mut pipeline = IngestionPipeline::new(
            sink,
            cfg.writer_config(),
            cfg.pipeline_options(None),
            fetcher,
        )
        .await?;
        let summary = pipeline.run(&entries).await?;
        println!("{}", serde_json::to_string(&summary)?);
        return finish(&summary);
    }

    let report = match cfg.mode {
        WorkerMode::Process => {
            let program = orchestrator::worker_binary()?;
            orchestrator::run_processes(program, cfg.child_args(), cfg.workers, cfg.poll_interval)
                .await
        }
        WorkerMode::InProcess => {
            let fetcher = open_fetcher(&cfg).await?;
            let cfg = Arc::new(cfg.clone());
            orchestrator::run_in_process(cfg.workers, |partition| {
                let sink = Arc::clone(&sink);
                let fetcher = fetcher.clone();
                let entries = Arc::clone(&entries);
                let cfg = Arc::clone(&cfg);
                async move {
                    let mut pipeline = IngestionPipeline::new(
                        sink,
                        cfg.writer_config(),
                        cfg.pipeline_options(Some(partition)),
                        fetcher,
                    )
                    .await?;
                    pipeline.run(&entries).await
                }
            })
            .await
        }
    };
    report_workers(&report)
}

async fn run_partition(
    cfg: &IngestConfig,
    partition: Option<PartitionSpec>,
    entries: Arc<[WorkEntry]>,
) -> Result<RunSummary> {
    let sink = open_sink(cfg).await?;
    let fetcher = open_fetcher(cfg).await?;
    let mut pipeline = IngestionPipeline::new(
        sink,
        cfg.writer_config(),
        cfg.pipeline_options(partition),
        fetcher,
    )
    .await?;
    pipeline.run(&entries).await
}

fn finish(summary: &RunSummary) -> Result<()> {
    if summary.has_write_failures() {
        bail!(
            "{} rows failed to write across {} chunks; re-run to resume from the last checkpoint",
            summary.rows_failed,
            summary.chunks_failed
        );
    }
    Ok(())
}

fn report_workers(report: &OrchestratorReport) -> Result<()> {
    println!("{}", serde_json::to_string(report)?);
    let failed: Vec<&str> = report
        .failed_workers()
        .map(|w| w.partition.as_str())
        .collect();
    if !failed.is_empty() {
        error!(partitions = ?failed, "some workers did not complete");
        bail!("{} of {} workers failed: {}", failed.len(), report.workers.len(), failed.join(", "));
    }
    info!(
        processed = report.total.processed,
        created = report.total.created,
        matched = report.total.matched,
        skipped = report.total.skipped,
        failed = report.total.failed,
        "all workers completed"
    );
    finish(&report.total)
}

async fn counts() -> Result<()> {
    let url = env_util::db_url()?;
    let sink = PgSink::connect(&url, 1).await?;
    let counts = sink.counts().await?;
    println!("{}", serde_json::to_string_pretty(&counts)?);
    Ok(())
}

fn checkpoint(action: CheckpointAction) -> Result<()> {
    let (args, clear) = match action {
        CheckpointAction::Show(a) => (a, false),
        CheckpointAction::Clear(a) => (a, true),
    };
    let dir = match args.checkpoint_dir {
        Some(dir) => dir,
        None => IngestConfig::from_env()?.checkpoint_dir,
    };
    let store = CheckpointStore::for_scope(&dir, &args.provider, args.partition, Duration::ZERO);
    if clear {
        store.clear()?;
        println!("cleared {}", store.path().display());
        return Ok(());
    }
    match store.load()? {
        Some(cp) => println!("{}", serde_json::to_string_pretty(&cp)?),
        None => println!("no checkpoint at {}", store.path().display()),
    }
    Ok(())
}

async fn partitions(args: PartitionArgs) -> Result<()> {
    let total = match (args.total, &args.input) {
        (Some(total), _) => total,
        (None, Some(path)) => load_work_list(path).await?.len(),
        (None, None) => bail!("pass --total or --input"),
    };
    let workers = args.workers.max(1);
    for index in 1..=workers {
        let range = partition_range(total, workers, index);
        println!(
            "{index}/{workers}\t[{}, {})\t{} items",
            range.start,
            range.end,
            range.len()
        );
    }
    Ok(())
}
