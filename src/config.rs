//! Run configuration: `INGEST_*` environment over built-in defaults, with CLI
//! flags applied on top by the binary.

use clap::ValueEnum;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::database_ops::sink::NewSource;
use crate::database_ops::writer::{WriterConfig, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_PARAMS, PARAM_HARD_CAP};
use crate::errors::IngestError;
use crate::partition::PartitionSpec;
use crate::pipeline::PipelineOptions;
use crate::records::FetchPolicy;
use crate::util::env::{env_flag, env_opt, env_parse};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum WorkerMode {
    /// One OS process per partition.
    #[default]
    Process,
    /// One tokio task per partition inside this process.
    InProcess,
}

impl WorkerMode {
    fn from_env_value(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "process" => Some(WorkerMode::Process),
            "in-process" | "inprocess" | "task" => Some(WorkerMode::InProcess),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct IngestConfig {
    pub provider_key: Option<String>,
    pub provider_name: Option<String>,
    pub provider_base_url: Option<String>,
    pub input: Option<PathBuf>,
    pub record_dump: Option<PathBuf>,
    pub dry_run: bool,
    pub limit: Option<usize>,
    pub buffer_size: usize,
    pub max_params: usize,
    pub workers: usize,
    pub mode: WorkerMode,
    pub resume: bool,
    pub partition: Option<PartitionSpec>,
    pub checkpoint_dir: PathBuf,
    pub checkpoint_interval: Duration,
    pub fetch_timeout: Duration,
    pub fetch_attempts: u32,
    pub fetch_backoff: Duration,
    pub poll_interval: Duration,
    pub database_url: Option<String>,
    pub max_connections: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        let fetch = FetchPolicy::default();
        Self {
            provider_key: None,
            provider_name: None,
            provider_base_url: None,
            input: None,
            record_dump: None,
            dry_run: false,
            limit: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_params: DEFAULT_MAX_PARAMS,
            workers: 1,
            mode: WorkerMode::Process,
            resume: true,
            partition: None,
            checkpoint_dir: PathBuf::from(".checkpoints"),
            checkpoint_interval: Duration::from_secs(60),
            fetch_timeout: fetch.timeout,
            fetch_attempts: fetch.attempts,
            fetch_backoff: fetch.backoff,
            poll_interval: Duration::from_secs(2),
            database_url: None,
            max_connections: 5,
        }
    }
}

impl IngestConfig {
    /// Defaults overlaid with whatever `INGEST_*` / `DATABASE_URL` provide.
    /// An unparseable `INGEST_PARTITION` is fatal.
    pub fn from_env() -> Result<Self, IngestError> {
        let d = Self::default();
        let mode = match env_opt("INGEST_WORKER_MODE") {
            Some(raw) => WorkerMode::from_env_value(&raw).unwrap_or_else(|| {
                warn!(value = %raw, "unknown INGEST_WORKER_MODE; using process");
                WorkerMode::Process
            }),
            None => d.mode,
        };
        let partition = env_opt("INGEST_PARTITION")
            .map(|raw| raw.parse::<PartitionSpec>())
            .transpose()?;
        Ok(Self {
            provider_key: env_opt("INGEST_PROVIDER"),
            provider_name: env_opt("INGEST_PROVIDER_NAME"),
            provider_base_url: env_opt("INGEST_PROVIDER_BASE_URL"),
            input: env_opt("INGEST_INPUT").map(PathBuf::from),
            record_dump: env_opt("INGEST_RECORD_DUMP").map(PathBuf::from),
            dry_run: env_flag("INGEST_DRY_RUN", d.dry_run),
            limit: env_opt("INGEST_LIMIT").and_then(|v| v.trim().parse().ok()),
            buffer_size: env_parse("INGEST_BUFFER_SIZE", d.buffer_size),
            max_params: env_parse("INGEST_MAX_PARAMS", d.max_params),
            workers: env_parse("INGEST_WORKERS", d.workers),
            mode,
            resume: env_flag("INGEST_RESUME", d.resume),
            partition,
            checkpoint_dir: env_opt("INGEST_CHECKPOINT_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.checkpoint_dir),
            checkpoint_interval: Duration::from_secs(env_parse(
                "INGEST_CHECKPOINT_SECS",
                d.checkpoint_interval.as_secs(),
            )),
            fetch_timeout: Duration::from_millis(env_parse(
                "INGEST_FETCH_TIMEOUT_MS",
                d.fetch_timeout.as_millis() as u64,
            )),
            fetch_attempts: env_parse("INGEST_FETCH_ATTEMPTS", d.fetch_attempts),
            fetch_backoff: Duration::from_millis(env_parse(
                "INGEST_FETCH_BACKOFF_MS",
                d.fetch_backoff.as_millis() as u64,
            )),
            poll_interval: Duration::from_millis(env_parse(
                "INGEST_POLL_MS",
                d.poll_interval.as_millis() as u64,
            )),
            database_url: env_opt("DATABASE_URL").or_else(|| env_opt("DB_URL")),
            max_connections: env_parse("INGEST_MAX_CONNECTIONS", d.max_connections),
        })
    }

    /// Check required settings and clamp out-of-range ones.
    pub fn validate(mut self) -> Result<Self, IngestError> {
        if self.provider_key.as_deref().map(str::trim).unwrap_or("").is_empty() {
            return Err(IngestError::MissingConfig {
                key: "INGEST_PROVIDER (--provider)".into(),
            });
        }
        if self.input.is_none() {
            return Err(IngestError::MissingConfig {
                key: "INGEST_INPUT (--input)".into(),
            });
        }
        if !self.dry_run && self.database_url.is_none() {
            return Err(IngestError::MissingConfig {
                key: "DATABASE_URL".into(),
            });
        }
        if self.max_params > PARAM_HARD_CAP {
            warn!(requested = self.max_params, cap = PARAM_HARD_CAP, "max params above protocol limit; clamping");
            self.max_params = PARAM_HARD_CAP;
        }
        self.max_params = self.max_params.max(1);
        self.buffer_size = self.buffer_size.max(1);
        self.workers = self.workers.max(1);
        self.fetch_attempts = self.fetch_attempts.max(1);
        Ok(self)
    }

    pub fn provider_key(&self) -> &str {
        self.provider_key.as_deref().unwrap_or_default()
    }

    pub fn source(&self) -> NewSource {
        let key = self.provider_key().trim().to_string();
        NewSource {
            name: self.provider_name.clone().unwrap_or_else(|| key.clone()),
            provider_key: key,
            base_url: self.provider_base_url.clone(),
        }
    }

    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            buffer_size: self.buffer_size,
            max_params: self.max_params,
            dry_run: self.dry_run,
        }
    }

    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            timeout: self.fetch_timeout,
            attempts: self.fetch_attempts,
            backoff: self.fetch_backoff,
        }
    }

    pub fn pipeline_options(&self, partition: Option<PartitionSpec>) -> PipelineOptions {
        PipelineOptions {
            source: self.source(),
            limit: self.limit,
            resume: self.resume,
            partition,
            fetch_policy: self.fetch_policy(),
            checkpoint_dir: self.checkpoint_dir.clone(),
            checkpoint_interval: self.checkpoint_interval,
        }
    }

    /// Arguments that make a child `run` invocation reproduce this config.
    /// The partition flag is appended by the orchestrator.
    pub fn child_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--provider".to_string(),
            self.provider_key().to_string(),
        ];
        if let Some(name) = &self.provider_name {
            args.extend(["--provider-name".to_string(), name.clone()]);
        }
        if let Some(url) = &self.provider_base_url {
            args.extend(["--provider-base-url".to_string(), url.clone()]);
        }
        if let Some(input) = &self.input {
            args.extend(["--input".to_string(), input.display().to_string()]);
        }
        if let Some(dump) = &self.record_dump {
            args.extend(["--record-dump".to_string(), dump.display().to_string()]);
        }
        if self.dry_run {
            args.push("--dry-run".to_string());
        }
        if let Some(limit) = self.limit {
            args.extend(["--limit".to_string(), limit.to_string()]);
        }
        if !self.resume {
            args.push("--no-resume".to_string());
        }
        args.extend([
            "--buffer-size".to_string(),
            self.buffer_size.to_string(),
            "--max-params".to_string(),
            self.max_params.to_string(),
            "--checkpoint-dir".to_string(),
            self.checkpoint_dir.display().to_string(),
            "--checkpoint-secs".to_string(),
            self.checkpoint_interval.as_secs().to_string(),
        ]);
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> IngestConfig {
        IngestConfig {
            provider_key: Some("x".into()),
            input: Some(PathBuf::from("items.json")),
            database_url: Some("postgres://localhost/catalog".into()),
            ..IngestConfig::default()
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let d = IngestConfig::default();
        assert_eq!(d.buffer_size, 5_000);
        assert_eq!(d.max_params, 65_000);
        assert_eq!(d.workers, 1);
        assert!(d.resume);
        assert_eq!(d.checkpoint_interval, Duration::from_secs(60));
        assert_eq!(d.fetch_timeout, Duration::from_secs(10));
        assert_eq!(d.fetch_attempts, 3);
        assert_eq!(d.fetch_backoff, Duration::from_millis(500));
        assert_eq!(d.poll_interval, Duration::from_secs(2));
    }

    #[test]
    fn missing_database_url_is_fatal_unless_dry_run() {
        let cfg = IngestConfig {
            database_url: None,
            ..base()
        };
        let err = cfg.clone().validate().unwrap_err();
        assert!(err.is_fatal());
        let dry = IngestConfig {
            dry_run: true,
            ..cfg
        };
        assert!(dry.validate().is_ok());
    }

    #[test]
    fn provider_and_input_are_required() {
        assert!(IngestConfig {
            provider_key: None,
            ..base()
        }
        .validate()
        .is_err());
        assert!(IngestConfig {
            input: None,
            ..base()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn param_cap_is_clamped() {
        let cfg = IngestConfig {
            max_params: 1_000_000,
            ..base()
        }
        .validate()
        .unwrap();
        assert_eq!(cfg.max_params, PARAM_HARD_CAP);
    }

    #[test]
    fn child_args_carry_run_settings() {
        let cfg = IngestConfig {
            dry_run: true,
            resume: false,
            limit: Some(10),
            ..base()
        };
        let args = cfg.child_args();
        assert_eq!(args[0], "run");
        assert!(args.windows(2).any(|w| w == ["--provider", "x"]));
        assert!(args.windows(2).any(|w| w == ["--limit", "10"]));
        assert!(args.contains(&"--dry-run".to_string()));
        assert!(args.contains(&"--no-resume".to_string()));
        assert!(!args.iter().any(|a| a == "--partition"));
    }

    #[test]
    fn worker_mode_accepts_spellings() {
        assert_eq!(WorkerMode::from_env_value("in_process"), Some(WorkerMode::InProcess));
        assert_eq!(WorkerMode::from_env_value("Process"), Some(WorkerMode::Process));
        assert_eq!(WorkerMode::from_env_value("threads"), None);
    }
}
