//! Core domain model for FEDAO operation announcements.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod error;
mod schema;

pub use error::PipelineError;
pub use schema::{
    default_aliases, AliasTable, AmountGroup, FieldDef, FieldSource, FieldType, KeyField,
    KeyMatch, SplitRule, TargetSchema, ValidationRule, CURRENCY_SYMBOLS, MOA_SCHEMA,
    MULTIPLIERS, TOA_SCHEMA,
};

pub const CRATE_NAME: &str = "fedao-core";

/// Sentinel written into the identifying column of a placeholder row.
pub const DIAGNOSTIC_MARKER: &str = "DIAGNOSTIC";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationCategory {
    #[serde(rename = "TOA")]
    Toa,
    #[serde(rename = "MOA")]
    Moa,
}

impl OperationCategory {
    pub const ALL: [OperationCategory; 2] = [OperationCategory::Toa, OperationCategory::Moa];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Toa => "TOA",
            Self::Moa => "MOA",
        }
    }

    pub fn schema(&self) -> &'static TargetSchema {
        match self {
            Self::Toa => &TOA_SCHEMA,
            Self::Moa => &MOA_SCHEMA,
        }
    }
}

impl fmt::Display for OperationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TOA" => Ok(Self::Toa),
            "MOA" => Ok(Self::Moa),
            other => Err(format!("unknown operation category `{other}` (expected TOA or MOA)")),
        }
    }
}

/// One scraped table row: source header -> raw cell text, in column order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawRow {
    cells: Vec<(String, String)>,
}

impl RawRow {
    pub fn new(cells: Vec<(String, String)>) -> Self {
        Self { cells }
    }

    /// Pairs positional cell values with headers; missing trailing cells become empty.
    pub fn from_positional(headers: &[String], values: &[String]) -> Self {
        let cells = headers
            .iter()
            .enumerate()
            .map(|(idx, header)| (header.clone(), values.get(idx).cloned().unwrap_or_default()))
            .collect();
        Self { cells }
    }

    pub fn get(&self, header: &str) -> Option<&str> {
        self.cells
            .iter()
            .find(|(h, _)| h == header)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.cells.iter().map(|(h, v)| (h.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Batch envelope handed over by a scraping collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTable {
    pub category: OperationCategory,
    pub headers: Vec<String>,
    pub rows: Vec<RawRow>,
    pub source_url: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl RawTable {
    /// Up to `limit` non-empty values per header, in row order.
    pub fn sample_values(&self, limit: usize) -> BTreeMap<String, Vec<String>> {
        let mut samples: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for header in &self.headers {
            let values = self
                .rows
                .iter()
                .filter_map(|row| row.get(header))
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .take(limit)
                .map(ToString::to_string)
                .collect();
            samples.insert(header.clone(), values);
        }
        samples
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingOrigin {
    Ai,
    Fallback,
}

impl MappingOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ai => "ai",
            Self::Fallback => "fallback",
        }
    }
}

/// Header -> target field assignment produced by the field mapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingResult {
    pub category: OperationCategory,
    /// Raw header -> target field name.
    pub mapping: BTreeMap<String, String>,
    pub confidence: f64,
    pub origin: MappingOrigin,
    /// Required fields no header resolved. Non-empty means the mapping is incomplete.
    pub missing_required: Vec<String>,
}

impl MappingResult {
    pub fn is_complete(&self) -> bool {
        self.missing_required.is_empty()
    }

    pub fn header_for(&self, field: &str) -> Option<&str> {
        self.mapping
            .iter()
            .find(|(_, f)| f.as_str() == field)
            .map(|(h, _)| h.as_str())
    }
}

/// Where a candidate value came from in the raw table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceRef {
    pub raw_header: String,
    pub source_row: usize,
    pub snippet: String,
}

/// Transient record between splitting and validation. Every schema field is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub category: OperationCategory,
    pub fields: BTreeMap<String, String>,
    pub evidence: BTreeMap<String, EvidenceRef>,
    pub confidence: f64,
    pub source_row: usize,
}

impl CandidateRecord {
    pub fn empty(schema: &TargetSchema, confidence: f64, source_row: usize) -> Self {
        Self {
            category: schema.category,
            fields: schema
                .fields
                .iter()
                .map(|f| (f.name.to_string(), String::new()))
                .collect(),
            evidence: BTreeMap::new(),
            confidence,
            source_row,
        }
    }

    pub fn get(&self, field: &str) -> &str {
        self.fields.get(field).map(String::as_str).unwrap_or_default()
    }

    pub fn set(&mut self, field: &str, value: impl Into<String>) {
        self.fields.insert(field.to_string(), value.into());
    }

    pub fn clear(&mut self, field: &str) {
        self.set(field, String::new());
    }

    /// Describes the raw origin of a field for diagnostics.
    pub fn origin_of(&self, field: &str) -> String {
        match self.evidence.get(field) {
            Some(ev) => format!("column `{}` (`{}`)", ev.raw_header, ev.snippet),
            None => "derived value".to_string(),
        }
    }
}

/// A validated, schema-complete operation. The persisted unit of a master dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub category: OperationCategory,
    fields: BTreeMap<String, String>,
}

impl OperationRecord {
    /// Builds a record from values in schema column order.
    pub fn from_row(schema: &TargetSchema, values: &[String]) -> Self {
        let fields = schema
            .fields
            .iter()
            .enumerate()
            .map(|(idx, f)| (f.name.to_string(), values.get(idx).cloned().unwrap_or_default()))
            .collect();
        Self {
            category: schema.category,
            fields,
        }
    }

    pub(crate) fn from_fields(category: OperationCategory, fields: BTreeMap<String, String>) -> Self {
        Self { category, fields }
    }

    pub fn get(&self, field: &str) -> &str {
        self.fields.get(field).map(String::as_str).unwrap_or_default()
    }

    pub fn to_row(&self, schema: &TargetSchema) -> Vec<String> {
        schema
            .fields
            .iter()
            .map(|f| self.get(f.name).to_string())
            .collect()
    }
}

impl CandidateRecord {
    /// Promotes a candidate whose fields the validator has already vetted.
    pub fn into_operation(self, schema: &TargetSchema) -> OperationRecord {
        let fields = schema
            .fields
            .iter()
            .map(|f| (f.name.to_string(), self.get(f.name).to_string()))
            .collect();
        OperationRecord::from_fields(self.category, fields)
    }
}

/// Rejection or category-level failure routed away from the master dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    pub category: OperationCategory,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
    pub source_row: Option<usize>,
}

impl DiagnosticRecord {
    pub fn new(
        category: OperationCategory,
        reason: impl Into<String>,
        recorded_at: DateTime<Utc>,
        source_row: Option<usize>,
    ) -> Self {
        Self {
            category,
            reason: reason.into(),
            recorded_at,
            source_row,
        }
    }

    /// Placeholder row in schema column order: the identifying column reads
    /// [`DIAGNOSTIC_MARKER`], the next column carries the reason.
    pub fn placeholder_row(&self, schema: &TargetSchema) -> Vec<String> {
        let mut row = vec![String::new(); schema.fields.len()];
        let id_idx = schema.index_of(schema.identifying_field).unwrap_or(0);
        let reason_idx = (id_idx + 1) % schema.fields.len().max(1);
        row[id_idx] = DIAGNOSTIC_MARKER.to_string();
        if reason_idx != id_idx {
            row[reason_idx] = format!(
                "{} [{}]",
                self.reason,
                self.recorded_at.format("%Y-%m-%dT%H:%M:%SZ")
            );
        }
        row
    }

    pub fn is_placeholder_row(schema: &TargetSchema, row: &[String]) -> bool {
        let id_idx = schema.index_of(schema.identifying_field).unwrap_or(0);
        row.get(id_idx).map(String::as_str) == Some(DIAGNOSTIC_MARKER)
    }

    pub fn describe(&self) -> String {
        match self.source_row {
            Some(row) => format!("{} row {}: {}", self.category, row, self.reason),
            None => format!("{}: {}", self.category, self.reason),
        }
    }
}
