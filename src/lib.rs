pub mod checkpoint;
pub mod config;
pub mod database_ops;
pub mod errors;
pub mod identity;
pub mod normalization;
pub mod orchestrator;
pub mod partition;
pub mod pipeline;
pub mod records;
pub mod tracing;

pub mod util {
    pub mod env;
}

pub use errors::IngestError;
pub use pipeline::{IngestionPipeline, PipelineOptions, RunSummary};
