//! Input adapters: turn scraper hand-offs (JSON table bundles, HTML pages) into
//! [`RawTable`] batches for the pipeline.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fedao_core::{OperationCategory, RawRow, RawTable};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "fedao-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing bundle {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("bundle {path} holds {found} data, expected {expected}")]
    CategoryMismatch {
        path: PathBuf,
        expected: OperationCategory,
        found: OperationCategory,
    },
    #[error("{0}")]
    Message(String),
}

/// The scraper hand-off format. Either `headers` + `rows` are given directly, or
/// `html` carries a page whose first table is extracted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableBundle {
    pub category: OperationCategory,
    #[serde(default)]
    pub source_url: Option<String>,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<String>>,
    #[serde(default)]
    pub html: Option<String>,
}

impl TableBundle {
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn into_raw_table(self) -> Result<RawTable, AdapterError> {
        let (headers, rows) = match (&self.html, self.headers.is_empty()) {
            (Some(html), true) => parse_html_table(html)?,
            (_, false) => (self.headers, self.rows),
            (None, true) => {
                return Err(AdapterError::Message(format!(
                    "{} bundle has neither headers nor html",
                    self.category
                )))
            }
        };

        let width = headers.len();
        let rows = rows
            .iter()
            .filter(|cells| cells.iter().any(|c| !c.trim().is_empty()))
            .map(|cells| {
                if cells.len() > width {
                    debug!(cells = cells.len(), width, "dropping cells beyond header width");
                }
                RawRow::from_positional(&headers, cells)
            })
            .collect();

        Ok(RawTable {
            category: self.category,
            headers,
            rows,
            source_url: self.source_url,
            fetched_at: self.fetched_at,
        })
    }
}

/// Raw table plus the exact bytes it was decoded from, for archiving.
#[derive(Debug, Clone)]
pub struct LoadedTable {
    pub table: RawTable,
    pub raw_bytes: Vec<u8>,
    pub extension: &'static str,
}

#[async_trait]
pub trait TableSource: Send + Sync {
    fn category(&self) -> OperationCategory;
    fn describe(&self) -> String;

    async fn load(&self) -> Result<LoadedTable, AdapterError>;
}

/// A JSON [`TableBundle`] on disk, expected to carry `category` data.
#[derive(Debug, Clone)]
pub struct BundleFileSource {
    category: OperationCategory,
    path: PathBuf,
}

impl BundleFileSource {
    pub fn new(category: OperationCategory, path: impl Into<PathBuf>) -> Self {
        Self {
            category,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TableSource for BundleFileSource {
    fn category(&self) -> OperationCategory {
        self.category
    }

    fn describe(&self) -> String {
        format!("{} bundle {}", self.category, self.path.display())
    }

    async fn load(&self) -> Result<LoadedTable, AdapterError> {
        let raw_bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| AdapterError::Io {
                path: self.path.clone(),
                source,
            })?;
        let bundle =
            TableBundle::from_json_slice(&raw_bytes).map_err(|source| AdapterError::Json {
                path: self.path.clone(),
                source,
            })?;
        if bundle.category != self.category {
            return Err(AdapterError::CategoryMismatch {
                path: self.path.clone(),
                expected: self.category,
                found: bundle.category,
            });
        }
        let table = bundle.into_raw_table()?;
        debug!(
            path = %self.path.display(),
            headers = table.headers.len(),
            rows = table.rows.len(),
            "bundle loaded"
        );
        Ok(LoadedTable {
            table,
            raw_bytes,
            extension: "json",
        })
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn cell_text(cell: &ElementRef<'_>) -> String {
    cell.text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Extracts the first `<table>` of a page. Header cells come from the first row that
/// has `th` cells (or the first row when none do); data cells keep their inner HTML
/// so line-break markers survive for cell splitting.
pub fn parse_html_table(html: &str) -> Result<(Vec<String>, Vec<Vec<String>>), AdapterError> {
    let document = Html::parse_document(html);
    let table_sel = selector("table")?;
    let row_sel = selector("tr")?;
    let th_sel = selector("th")?;
    let td_sel = selector("td")?;

    let table = document
        .select(&table_sel)
        .next()
        .ok_or_else(|| AdapterError::Message("no <table> element found".to_string()))?;

    let mut headers: Vec<String> = Vec::new();
    let mut rows = Vec::new();
    for row in table.select(&row_sel) {
        let header_cells: Vec<String> = row.select(&th_sel).map(|c| cell_text(&c)).collect();
        let data_cells: Vec<String> = row
            .select(&td_sel)
            .map(|c| c.inner_html().trim().to_string())
            .collect();

        if headers.is_empty() {
            if !header_cells.is_empty() {
                headers = header_cells;
                continue;
            }
            if !data_cells.is_empty() {
                headers = row.select(&td_sel).map(|c| cell_text(&c)).collect();
                continue;
            }
        }
        if !data_cells.is_empty() {
            rows.push(data_cells);
        }
    }

    if headers.is_empty() {
        return Err(AdapterError::Message(
            "table has no header row".to_string(),
        ));
    }
    Ok((headers, rows))
}
