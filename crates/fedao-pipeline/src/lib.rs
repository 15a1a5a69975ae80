//! The FEDAO normalization pipeline: field mapping, cell splitting, value
//! normalization, validation, deduplication and master persistence.

pub mod config;
pub mod dedup;
pub mod mapper;
pub mod normalize;
pub mod oracle;
pub mod pipeline;
pub mod report;
pub mod splitter;
pub mod validate;

pub use config::{CategoryConfig, DedupConfig, MapperPolicy, PipelineConfig};
pub use dedup::{DedupEngine, MergeOutcome, MergeStats};
pub use mapper::{fallback_mapping, FieldMapper};
pub use oracle::{
    DisabledOracle, HttpMappingOracle, MappingOracle, OracleError, OracleRequest, OracleResponse,
};
pub use pipeline::{transform, Pipeline, StageOutput};
pub use report::{
    report_recent_markdown, CategoryStatus, CategorySummary, ParquetManifest, RunSummary,
};

pub const CRATE_NAME: &str = "fedao-pipeline";

/// Runs the given inputs with configuration from the environment.
pub async fn run_from_env(
    sources: Vec<Box<dyn fedao_adapters::TableSource>>,
) -> anyhow::Result<RunSummary> {
    Pipeline::from_env()?.run(sources).await
}
