//! Run orchestration: one invocation processes each supplied table through
//! mapping, splitting, normalization, validation, merge and persistence.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fedao_adapters::TableSource;
use fedao_core::{
    DiagnosticRecord, MappingResult, OperationCategory, OperationRecord, PipelineError, RawTable,
    TargetSchema,
};
use fedao_storage::{build_http_client, HttpClientConfig, InputArchive, MasterStore, PersistOutcome};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{CategoryConfig, PipelineConfig};
use crate::dedup::{DedupEngine, MergeStats};
use crate::mapper::FieldMapper;
use crate::normalize::normalize_candidate;
use crate::oracle::{DisabledOracle, HttpMappingOracle, MappingOracle};
use crate::report::{
    export_parquet_snapshots, write_run_reports, CategoryStatus, CategorySummary, RunSummary,
};
use crate::splitter::split_row;
use crate::validate::validate_candidate;

/// Records that survived validation plus the rejections, in source order.
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    pub candidates: usize,
    pub records: Vec<OperationRecord>,
    pub rejections: Vec<DiagnosticRecord>,
}

/// Split, normalize and validate every row of `table` under `mapping`.
pub fn transform(
    config: &CategoryConfig,
    table: &RawTable,
    mapping: &MappingResult,
    now: DateTime<Utc>,
) -> Result<StageOutput, PipelineError> {
    let schema = config.schema;
    if !mapping.is_complete() {
        return Err(PipelineError::MappingIncomplete {
            category: schema.category,
            missing: mapping.missing_required.clone(),
        });
    }

    let mut output = StageOutput::default();
    for (row_index, row) in table.rows.iter().enumerate() {
        for candidate in split_row(schema, mapping, row, row_index) {
            output.candidates += 1;
            let candidate = normalize_candidate(schema, candidate);
            match validate_candidate(schema, candidate, now) {
                Ok(record) => output.records.push(record),
                Err(diagnostic) => {
                    warn!(category = %schema.category, row = row_index, reason = %diagnostic.reason, "record rejected");
                    output.rejections.push(diagnostic);
                }
            }
        }
    }
    Ok(output)
}

struct MergeReport {
    stats: MergeStats,
    master_rows: usize,
    persisted: Option<PersistOutcome>,
}

pub struct Pipeline {
    config: PipelineConfig,
    categories: BTreeMap<OperationCategory, CategoryConfig>,
    mapper: FieldMapper,
    store: MasterStore,
    archive: InputArchive,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, oracle: Arc<dyn MappingOracle>) -> Result<Self> {
        let categories = config
            .category_configs()
            .context("loading category configuration")?;
        let store = MasterStore::new(config.data_dir.clone())
            .with_stale_lock_after(Duration::from_secs(config.stale_lock_secs));
        let archive = InputArchive::new(config.artifacts_dir.clone());
        Ok(Self {
            config,
            categories,
            mapper: FieldMapper::new(oracle),
            store,
            archive,
        })
    }

    /// Uses the HTTP oracle when `oracle_url` is set, the alias fallback alone otherwise.
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let oracle: Arc<dyn MappingOracle> = match &config.oracle_url {
            Some(url) => {
                let client = build_http_client(&HttpClientConfig {
                    timeout: Duration::from_secs(config.oracle_timeout_secs),
                    user_agent: Some(config.user_agent.clone()),
                })
                .context("building oracle http client")?;
                Arc::new(HttpMappingOracle::new(client, url.clone(), config.oracle_token.clone()))
            }
            None => Arc::new(DisabledOracle),
        };
        Self::new(config, oracle)
    }

    pub fn from_env() -> Result<Self> {
        Self::from_config(PipelineConfig::from_env())
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &MasterStore {
        &self.store
    }

    /// Categories are processed one after another; a failure in one never stops
    /// the next. Returns the summary even when a category failed to persist, so
    /// callers decide how to surface [`RunSummary::failed`].
    pub async fn run(&self, sources: Vec<Box<dyn TableSource>>) -> Result<RunSummary> {
        if sources.is_empty() {
            return Err(PipelineError::NoInput.into());
        }
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, sources = sources.len(), "run started");

        let mut categories = Vec::new();
        for source in &sources {
            categories.push(self.run_category(source.as_ref()).await);
        }

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            status: String::new(),
            categories,
            errors: Vec::new(),
            reports_dir: None,
            parquet_manifest: None,
        };

        let run_dir = self.config.reports_dir.join(run_id.to_string());
        if self.config.export_parquet {
            match self.export_snapshots(&run_dir, &summary).await {
                Ok(path) => summary.parquet_manifest = Some(path.display().to_string()),
                Err(err) => {
                    warn!(error = %err, "parquet export failed");
                    summary.errors.push(format!("parquet export: {err:#}"));
                }
            }
        }

        summary.finished_at = Utc::now();
        summary.status = match RunSummary::derive_status(&summary.categories) {
            "completed" if !summary.errors.is_empty() => "completed_with_errors",
            status => status,
        }
        .to_string();
        summary.reports_dir = Some(run_dir.display().to_string());
        write_run_reports(&self.config.reports_dir, &summary)
            .await
            .context("writing run reports")?;

        info!(%run_id, status = %summary.status, "run finished");
        Ok(summary)
    }

    async fn run_category(&self, source: &dyn TableSource) -> CategorySummary {
        let category = source.category();
        let mut summary = CategorySummary::new(category);
        let Some(config) = self.categories.get(&category) else {
            summary.errors.push(format!("{category}: no configuration"));
            return summary;
        };
        let now = Utc::now();

        let loaded = match source.load().await {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!(%category, source = %source.describe(), error = %err, "input could not be loaded");
                let reason = format!("input unavailable: {err}");
                summary.errors.push(reason.clone());
                self.emit_diagnostic(config.schema, &mut summary, reason, now).await;
                return summary;
            }
        };

        match self
            .archive
            .archive(category, loaded.table.fetched_at, loaded.extension, &loaded.raw_bytes)
            .await
        {
            Ok(archived) => {
                summary.archived_input = Some(archived.relative_path.display().to_string());
                summary.input_digest = Some(archived.digest);
            }
            Err(err) => {
                warn!(%category, error = %err, "raw input not archived");
                summary.errors.push(format!("archiving input: {err:#}"));
            }
        }

        let table = loaded.table;
        summary.input_rows = table.rows.len();
        info!(%category, rows = table.rows.len(), headers = table.headers.len(), "table loaded");
        if table.rows.is_empty() {
            self.emit_diagnostic(config.schema, &mut summary, "table has no data rows".into(), now)
                .await;
            return summary;
        }

        let mapping = self.mapper.map(&table, config).await;
        summary.mapping_origin = Some(mapping.origin);
        summary.mapping_confidence = Some(mapping.confidence);

        let output = match transform(config, &table, &mapping, now) {
            Ok(output) => output,
            Err(err) => {
                warn!(%category, error = %err, "category aborted");
                summary.errors.push(err.to_string());
                self.emit_diagnostic(config.schema, &mut summary, err.to_string(), now)
                    .await;
                return summary;
            }
        };
        summary.candidates = output.candidates;
        summary.created = output.records.len();
        summary.rejected = output.rejections.len();
        summary.errors.extend(output.rejections.iter().map(|d| {
            PipelineError::RecordRejected {
                category,
                row: d.source_row.unwrap_or_default(),
                reason: d.reason.clone(),
            }
            .to_string()
        }));
        info!(
            %category,
            candidates = output.candidates,
            valid = output.records.len(),
            rejected = output.rejections.len(),
            "batch validated"
        );

        if output.records.is_empty() {
            let reason = format!(
                "no valid records in {} candidates ({} rejected)",
                output.candidates,
                output.rejections.len()
            );
            self.emit_diagnostic(config.schema, &mut summary, reason, now).await;
            return summary;
        }

        summary.master_path = Some(self.store.master_path(config.schema).display().to_string());
        match self.merge_and_persist(config, output.records, now).await {
            Ok(report) => {
                summary.status = CategoryStatus::Merged;
                summary.record_merge(report.stats);
                summary.master_rows = Some(report.master_rows);
                summary.backup_path = report
                    .persisted
                    .and_then(|p| p.backup_path)
                    .map(|p| p.display().to_string());
            }
            Err(err) => {
                warn!(%category, error = %err, "master dataset left unchanged");
                summary.status = CategoryStatus::Failed;
                summary.errors.push(err.to_string());
            }
        }
        summary
    }

    async fn merge_and_persist(
        &self,
        config: &CategoryConfig,
        records: Vec<OperationRecord>,
        now: DateTime<Utc>,
    ) -> Result<MergeReport, PipelineError> {
        let schema = config.schema;
        let write_failure = |message: String| PipelineError::WriteFailure {
            category: schema.category,
            message,
        };

        let _lock = self
            .store
            .acquire_writer_lock(schema)
            .await
            .map_err(|e| write_failure(e.to_string()))?;
        let existing = self
            .store
            .load(schema)
            .await
            .map_err(|e| write_failure(e.to_string()))?;
        let master_existed = !existing.is_empty();

        let outcome = DedupEngine::new(config.dedup).merge(schema, existing, records);
        info!(
            category = %schema.category,
            appended = outcome.stats.appended,
            superseded = outcome.stats.superseded,
            duplicates = outcome.stats.duplicates,
            "batch merged"
        );

        let unchanged = outcome.stats.appended == 0 && outcome.stats.superseded == 0;
        if unchanged && master_existed {
            info!(category = %schema.category, "master dataset already current");
            return Ok(MergeReport {
                stats: outcome.stats,
                master_rows: outcome.records.len(),
                persisted: None,
            });
        }

        let persisted = self
            .store
            .persist(schema, &outcome.records, now)
            .await
            .map_err(|e| write_failure(e.to_string()))?;
        Ok(MergeReport {
            stats: outcome.stats,
            master_rows: persisted.rows,
            persisted: Some(persisted),
        })
    }

    async fn emit_diagnostic(
        &self,
        schema: &TargetSchema,
        summary: &mut CategorySummary,
        reason: String,
        now: DateTime<Utc>,
    ) {
        summary.status = CategoryStatus::Diagnostic;
        let diagnostic = DiagnosticRecord::new(schema.category, reason, now, None);
        match self.store.write_diagnostics(schema, &[diagnostic], now).await {
            Ok(path) => {
                warn!(category = %schema.category, path = %path.display(), "diagnostic placeholder written");
                summary.diagnostic_path = Some(path.display().to_string());
            }
            Err(err) => {
                warn!(category = %schema.category, error = %err, "diagnostic placeholder not written");
                summary.errors.push(err.to_string());
            }
        }
    }

    async fn export_snapshots(
        &self,
        run_dir: &std::path::Path,
        summary: &RunSummary,
    ) -> Result<std::path::PathBuf> {
        let mut masters = Vec::new();
        for category in OperationCategory::ALL {
            if summary.category(category).is_none() {
                continue;
            }
            let schema = category.schema();
            let records = self
                .store
                .load(schema)
                .await
                .with_context(|| format!("loading {category} master for snapshot"))?;
            masters.push((schema, records));
        }
        export_parquet_snapshots(run_dir, &masters).await
    }
}
