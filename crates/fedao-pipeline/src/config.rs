use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use fedao_core::{default_aliases, AliasTable, OperationCategory, TargetSchema};
use fedao_storage::RetryPolicy;
use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub rules_dir: PathBuf,
    pub oracle_url: Option<String>,
    pub oracle_token: Option<String>,
    pub oracle_timeout_secs: u64,
    pub oracle_max_retries: usize,
    pub oracle_retry_delay_ms: u64,
    pub mapping_confidence_threshold: f64,
    pub similarity_threshold: f64,
    pub sample_rows: usize,
    pub export_parquet: bool,
    pub stale_lock_secs: u64,
    pub user_agent: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let path = |key: &str, default: &str| {
            lookup(key)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(default))
        };
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            data_dir: path("FEDAO_DATA_DIR", "./data"),
            artifacts_dir: path("FEDAO_ARTIFACTS_DIR", "./artifacts"),
            reports_dir: path("FEDAO_REPORTS_DIR", "./reports"),
            rules_dir: path("FEDAO_RULES_DIR", "./rules"),
            oracle_url: non_empty("FEDAO_ORACLE_URL"),
            oracle_token: non_empty("FEDAO_ORACLE_TOKEN"),
            oracle_timeout_secs: parsed(&lookup, "FEDAO_ORACLE_TIMEOUT_SECS").unwrap_or(45),
            oracle_max_retries: parsed(&lookup, "FEDAO_ORACLE_MAX_RETRIES").unwrap_or(3),
            oracle_retry_delay_ms: parsed(&lookup, "FEDAO_ORACLE_RETRY_DELAY_MS").unwrap_or(2000),
            mapping_confidence_threshold: parsed(&lookup, "FEDAO_MAPPING_THRESHOLD")
                .filter(|v: &f64| (0.0..=1.0).contains(v))
                .unwrap_or(0.8),
            similarity_threshold: parsed(&lookup, "FEDAO_SIMILARITY_THRESHOLD")
                .filter(|v: &f64| (0.0..=1.0).contains(v))
                .unwrap_or(0.9),
            sample_rows: parsed(&lookup, "FEDAO_SAMPLE_ROWS").unwrap_or(3),
            export_parquet: lookup("FEDAO_EXPORT_PARQUET")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            stale_lock_secs: parsed(&lookup, "FEDAO_STALE_LOCK_SECS").unwrap_or(30 * 60),
            user_agent: lookup("FEDAO_USER_AGENT")
                .unwrap_or_else(|| "fedao-normalizer/0.1".to_string()),
        }
    }

    /// Roots every directory under `root`; handy for tests and one-off runs.
    pub fn rooted_at(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            data_dir: root.join("data"),
            artifacts_dir: root.join("artifacts"),
            reports_dir: root.join("reports"),
            rules_dir: root.join("rules"),
            ..Self::default()
        }
    }

    pub fn mapper_policy(&self) -> MapperPolicy {
        MapperPolicy {
            confidence_threshold: self.mapping_confidence_threshold,
            timeout: Duration::from_secs(self.oracle_timeout_secs),
            retry: RetryPolicy {
                max_retries: self.oracle_max_retries,
                delay: Duration::from_millis(self.oracle_retry_delay_ms),
            },
            sample_rows: self.sample_rows,
        }
    }

    pub fn dedup_config(&self) -> DedupConfig {
        DedupConfig {
            similarity_threshold: self.similarity_threshold,
        }
    }

    /// Built-in configuration for every category, with aliases from
    /// `rules/field_aliases.yaml` appended when that file exists.
    pub fn category_configs(&self) -> Result<BTreeMap<OperationCategory, CategoryConfig>> {
        let extra = load_alias_rules(&self.rules_dir)?;
        let mut configs = BTreeMap::new();
        for category in OperationCategory::ALL {
            let mut config = CategoryConfig::new(category, self.mapper_policy(), self.dedup_config());
            if let Some(file) = &extra {
                file.apply_to(&mut config);
            }
            configs.insert(category, config);
        }
        Ok(configs)
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapperPolicy {
    pub confidence_threshold: f64,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub sample_rows: usize,
}

impl Default for MapperPolicy {
    fn default() -> Self {
        PipelineConfig::default().mapper_policy()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DedupConfig {
    pub similarity_threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.9,
        }
    }
}

/// Everything a stage needs to know about one category.
#[derive(Debug, Clone)]
pub struct CategoryConfig {
    pub schema: &'static TargetSchema,
    pub aliases: AliasTable,
    pub mapper: MapperPolicy,
    pub dedup: DedupConfig,
}

impl CategoryConfig {
    pub fn new(category: OperationCategory, mapper: MapperPolicy, dedup: DedupConfig) -> Self {
        Self {
            schema: category.schema(),
            aliases: default_aliases(category),
            mapper,
            dedup,
        }
    }

    pub fn category(&self) -> OperationCategory {
        self.schema.category
    }
}

#[derive(Debug, Clone, Deserialize)]
struct AliasRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    categories: BTreeMap<OperationCategory, BTreeMap<String, Vec<String>>>,
}

impl AliasRulesFile {
    fn apply_to(&self, config: &mut CategoryConfig) {
        let Some(fields) = self.categories.get(&config.category()) else {
            return;
        };
        for (field, aliases) in fields {
            if config.schema.field(field).is_none() {
                warn!(category = %config.category(), field, "ignoring aliases for unknown field");
                continue;
            }
            config.aliases.extend(field, aliases.iter().cloned());
        }
    }
}

fn load_alias_rules(rules_dir: &Path) -> Result<Option<AliasRulesFile>> {
    let path = rules_dir.join("field_aliases.yaml");
    if !path.exists() {
        debug!(path = %path.display(), "no alias rules file; using built-in aliases");
        return Ok(None);
    }
    let text =
        std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let file: AliasRulesFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(file))
}
