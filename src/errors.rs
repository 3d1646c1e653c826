//! Error taxonomy for ingestion runs.
//!
//! Errors fall into three severities: per-item errors are logged and counted
//! while the run continues, batch-write errors fail a single chunk while the
//! remaining chunks are still attempted, and fatal errors abort the run.

use thiserror::Error;

/// How far an error is allowed to propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Item,
    Batch,
    Fatal,
}

#[derive(Error, Debug)]
pub enum IngestError {
    /// Record carries no usable name.
    #[error("record {item_id} has no name")]
    MissingName { item_id: String },

    /// Record could not be interpreted (missing id, wrong shape, ...).
    #[error("malformed record: {message}")]
    MalformedRecord { message: String },

    /// Record fetcher had nothing for this id.
    #[error("record {item_id} unavailable from provider")]
    RecordUnavailable { item_id: String },

    /// Record fetch kept timing out after all attempts.
    #[error("fetching record {item_id} timed out after {attempts} attempts")]
    FetchTimeout { item_id: String, attempts: u32 },

    /// A single chunk upsert failed.
    #[error("chunk write to {table} failed ({rows} rows): {message}")]
    ChunkWrite {
        table: &'static str,
        rows: usize,
        message: String,
    },

    #[error("input source {path} unreadable: {message}")]
    InputUnreadable { path: String, message: String },

    #[error("input source {path} unparseable at entry {entry}: {message}")]
    InputParse {
        path: String,
        entry: usize,
        message: String,
    },

    #[error("missing required configuration: {key}")]
    MissingConfig { key: String },

    #[error("sink unavailable: {message}")]
    SinkUnavailable { message: String },

    #[error("invalid partition spec {spec:?}: {message}")]
    InvalidPartition { spec: String, message: String },
}

impl IngestError {
    pub fn severity(&self) -> Severity {
        match self {
            IngestError::MissingName { .. }
            | IngestError::MalformedRecord { .. }
            | IngestError::RecordUnavailable { .. }
            | IngestError::FetchTimeout { .. } => Severity::Item,
            IngestError::ChunkWrite { .. } => Severity::Batch,
            IngestError::InputUnreadable { .. }
            | IngestError::InputParse { .. }
            | IngestError::MissingConfig { .. }
            | IngestError::SinkUnavailable { .. }
            | IngestError::InvalidPartition { .. } => Severity::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }

    /// Per-item errors that mean "nothing to ingest" rather than "broken".
    pub fn is_skip(&self) -> bool {
        matches!(self, IngestError::MissingName { .. })
    }
}

/// True when an `anyhow` chain carries a fatal [`IngestError`].
pub fn is_fatal_chain(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<IngestError>())
        .any(IngestError::is_fatal)
}

/// The per-item [`IngestError`] behind an `anyhow` chain. `None` when the
/// chain is fatal or carries no typed error at all (e.g. a raw sink error),
/// which callers must treat as run-ending.
pub fn item_error(err: &anyhow::Error) -> Option<&IngestError> {
    if is_fatal_chain(err) {
        return None;
    }
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<IngestError>())
        .find(|e| e.severity() == Severity::Item)
}
