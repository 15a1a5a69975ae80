use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use fedao_core::{MappingOrigin, OperationCategory, OperationRecord, TargetSchema};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

use crate::dedup::MergeStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryStatus {
    /// Valid records were merged into the master dataset.
    Merged,
    /// No valid data; a diagnostic placeholder was written instead.
    Diagnostic,
    /// The master dataset could not be written.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorySummary {
    pub category: OperationCategory,
    pub status: CategoryStatus,
    pub mapping_origin: Option<MappingOrigin>,
    pub mapping_confidence: Option<f64>,
    pub input_rows: usize,
    pub candidates: usize,
    pub created: usize,
    pub rejected: usize,
    pub merged: usize,
    pub superseded: usize,
    pub duplicates: usize,
    pub master_rows: Option<usize>,
    pub master_path: Option<String>,
    pub backup_path: Option<String>,
    pub diagnostic_path: Option<String>,
    pub archived_input: Option<String>,
    /// SHA-256 of the raw input bundle.
    pub input_digest: Option<String>,
    pub errors: Vec<String>,
}

impl CategorySummary {
    pub fn new(category: OperationCategory) -> Self {
        Self {
            category,
            status: CategoryStatus::Diagnostic,
            mapping_origin: None,
            mapping_confidence: None,
            input_rows: 0,
            candidates: 0,
            created: 0,
            rejected: 0,
            merged: 0,
            superseded: 0,
            duplicates: 0,
            master_rows: None,
            master_path: None,
            backup_path: None,
            diagnostic_path: None,
            archived_input: None,
            input_digest: None,
            errors: Vec::new(),
        }
    }

    pub fn record_merge(&mut self, stats: MergeStats) {
        self.merged = stats.appended;
        self.superseded = stats.superseded;
        self.duplicates = stats.duplicates;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: String,
    pub categories: Vec<CategorySummary>,
    pub errors: Vec<String>,
    pub reports_dir: Option<String>,
    pub parquet_manifest: Option<String>,
}

impl RunSummary {
    pub fn failed(&self) -> bool {
        self.categories
            .iter()
            .any(|c| c.status == CategoryStatus::Failed)
    }

    pub fn category(&self, category: OperationCategory) -> Option<&CategorySummary> {
        self.categories.iter().find(|c| c.category == category)
    }

    pub fn derive_status(categories: &[CategorySummary]) -> &'static str {
        if categories.iter().any(|c| c.status == CategoryStatus::Failed) {
            "failed"
        } else if categories.iter().any(|c| !c.errors.is_empty()) {
            "completed_with_errors"
        } else {
            "completed"
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub fn run_brief_markdown(summary: &RunSummary) -> String {
    let mut lines = vec![
        "# FEDAO Run Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Status: {}", summary.status),
        String::new(),
    ];
    for cat in &summary.categories {
        lines.push(format!("## {}", cat.category));
        lines.push(format!("- status: {:?}", cat.status).to_lowercase());
        if let Some(origin) = cat.mapping_origin {
            lines.push(format!(
                "- mapping: {} (confidence {:.2})",
                origin.as_str(),
                cat.mapping_confidence.unwrap_or_default()
            ));
        }
        lines.push(format!(
            "- rows {} -> candidates {} -> created {} / rejected {}",
            cat.input_rows, cat.candidates, cat.created, cat.rejected
        ));
        lines.push(format!(
            "- merged {} (superseded {}, duplicates {})",
            cat.merged, cat.superseded, cat.duplicates
        ));
        if let Some(path) = &cat.master_path {
            lines.push(format!(
                "- master: `{path}` ({} rows)",
                cat.master_rows.unwrap_or_default()
            ));
        }
        if let Some(path) = &cat.diagnostic_path {
            lines.push(format!("- diagnostic: `{path}`"));
        }
        for err in &cat.errors {
            lines.push(format!("- error: {err}"));
        }
        lines.push(String::new());
    }
    lines.join("\n")
}

/// Writes `run_summary.json` and `run_brief.md` under `<reports_root>/<run_id>/`.
pub async fn write_run_reports(reports_root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let run_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(run_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;
    fs::write(run_dir.join("run_brief.md"), run_brief_markdown(summary))
        .await
        .context("writing run_brief.md")?;
    Ok(run_dir)
}

/// One parquet file per master dataset plus a manifest with hashes and sizes.
pub async fn export_parquet_snapshots(
    run_dir: &Path,
    masters: &[(&'static TargetSchema, Vec<OperationRecord>)],
) -> Result<PathBuf> {
    let snapshot_dir = run_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let mut files = Vec::new();
    for (schema, records) in masters {
        let name = format!("{}_master", schema.category.as_str().to_ascii_lowercase());
        let path = snapshot_dir.join(format!("{name}.parquet"));
        write_master_parquet(&path, schema, records)?;
        files.push(manifest_entry(&name, run_dir, &path)?);
    }

    let manifest = ParquetManifest {
        schema_version: 1,
        files,
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_master_parquet(path: &Path, schema: &TargetSchema, records: &[OperationRecord]) -> Result<()> {
    let arrow_schema = Arc::new(Schema::new(
        schema
            .fields
            .iter()
            .map(|f| ArrowField::new(f.name, DataType::Utf8, false))
            .collect::<Vec<_>>(),
    ));
    let columns = schema
        .fields
        .iter()
        .map(|f| {
            Arc::new(StringArray::from(
                records.iter().map(|r| Some(r.get(f.name))).collect::<Vec<_>>(),
            )) as ArrayRef
        })
        .collect::<Vec<_>>();
    let batch = RecordBatch::try_new(arrow_schema, columns)
        .with_context(|| format!("building {} record batch", schema.category))?;

    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path
        .strip_prefix(run_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}

/// Markdown digest of the `runs` most recent run summaries under `reports_root`.
pub fn report_recent_markdown(reports_root: &Path, runs: usize) -> Result<String> {
    let mut summaries = Vec::new();
    for entry in std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
    {
        let path = entry.path().join("run_summary.json");
        if !path.is_file() {
            continue;
        }
        let text =
            std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let summary: RunSummary =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        summaries.push(summary);
    }
    summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    let mut lines = vec!["# FEDAO Recent Runs".to_string(), String::new()];
    if summaries.is_empty() {
        lines.push("No runs recorded.".to_string());
    }
    for summary in summaries.iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}` ({})", summary.run_id, summary.status));
        lines.push(format!("- started: {}", summary.started_at));
        for cat in &summary.categories {
            let origin = cat.mapping_origin.map(|o| o.as_str()).unwrap_or("none");
            lines.push(format!(
                "- {}: merged {}, rejected {}, duplicates {}, mapping {} [{} errors]",
                cat.category,
                cat.merged,
                cat.rejected,
                cat.duplicates,
                origin,
                cat.errors.len()
            ));
        }
        if let Some(manifest) = &summary.parquet_manifest {
            lines.push(format!("- parquet manifest: `{manifest}`"));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
