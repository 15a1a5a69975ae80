//! Header -> target field resolution: oracle first, alias table as fallback.

use std::collections::BTreeMap;
use std::sync::Arc;

use fedao_core::{AliasTable, MappingOrigin, MappingResult, RawTable, TargetSchema};
use tracing::{debug, info, warn};

use crate::config::{CategoryConfig, MapperPolicy};
use crate::oracle::{MappingOracle, OracleError, OracleRequest, OracleResponse};

const EXACT_ALIAS_SCORE: f64 = 1.0;
const CONTAINED_ALIAS_SCORE: f64 = 0.85;

pub struct FieldMapper {
    oracle: Arc<dyn MappingOracle>,
}

impl FieldMapper {
    pub fn new(oracle: Arc<dyn MappingOracle>) -> Self {
        Self { oracle }
    }

    pub async fn map(&self, table: &RawTable, config: &CategoryConfig) -> MappingResult {
        let schema = config.schema;
        let request = OracleRequest::for_table(table, schema, config.mapper.sample_rows);

        match self.query_oracle(&request, &config.mapper).await {
            Ok(response) => {
                match accept_oracle_response(schema, &table.headers, response, &config.mapper) {
                    Ok(result) => {
                        info!(
                            category = %schema.category,
                            oracle = self.oracle.name(),
                            confidence = result.confidence,
                            "mapping resolved by oracle"
                        );
                        return result;
                    }
                    Err(reason) => {
                        warn!(category = %schema.category, %reason, "oracle mapping refused; using alias fallback")
                    }
                }
            }
            Err(OracleError::NotConfigured) => {
                debug!(category = %schema.category, "no oracle configured; using alias fallback")
            }
            Err(err) => {
                warn!(category = %schema.category, error = %err, "oracle unavailable; using alias fallback")
            }
        }

        let result = fallback_mapping(schema, &config.aliases, &table.headers);
        info!(
            category = %schema.category,
            confidence = result.confidence,
            complete = result.is_complete(),
            "mapping resolved by alias fallback"
        );
        result
    }

    async fn query_oracle(
        &self,
        request: &OracleRequest,
        policy: &MapperPolicy,
    ) -> Result<OracleResponse, OracleError> {
        let mut failed = 0;
        loop {
            let err = match tokio::time::timeout(policy.timeout, self.oracle.map(request)).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(err)) => err,
                Err(_) => OracleError::Timeout(policy.timeout),
            };
            failed += 1;
            if !policy.retry.should_retry(failed, err.disposition()) {
                return Err(err);
            }
            warn!(attempt = failed, error = %err, "oracle attempt failed; retrying");
            tokio::time::sleep(policy.retry.delay).await;
        }
    }
}

/// Keeps oracle assignments that name a real header and a mapped schema field, one
/// header per field (first in header order wins). Refuses the whole response when
/// confidence is under the threshold or a required field stays unresolved.
pub fn accept_oracle_response(
    schema: &TargetSchema,
    headers: &[String],
    response: OracleResponse,
    policy: &MapperPolicy,
) -> Result<MappingResult, String> {
    if response.confidence < policy.confidence_threshold {
        return Err(format!(
            "confidence {:.2} below threshold {:.2}",
            response.confidence, policy.confidence_threshold
        ));
    }

    let mut mapping = BTreeMap::new();
    let mut taken: Vec<&str> = Vec::new();
    for header in headers {
        let Some(field) = response
            .mapping
            .get(header)
            .or_else(|| response.mapping.get(header.trim()))
        else {
            continue;
        };
        let Some(def) = schema.mapped_fields().find(|f| f.name == field.as_str()) else {
            debug!(header, field, "oracle named an unknown or derived field");
            continue;
        };
        if taken.contains(&def.name) {
            debug!(header, field, "oracle mapped a second header to the same field");
            continue;
        }
        taken.push(def.name);
        mapping.insert(header.clone(), def.name.to_string());
    }

    let missing = missing_required(schema, &taken);
    if !missing.is_empty() {
        return Err(format!("oracle left {} unresolved", missing.join(", ")));
    }

    Ok(MappingResult {
        category: schema.category,
        mapping,
        confidence: response.confidence,
        origin: MappingOrigin::Ai,
        missing_required: Vec::new(),
    })
}

/// Deterministic alias matching on normalized headers. Exact alias matches are
/// settled for every field before any containment match is considered.
pub fn fallback_mapping(schema: &TargetSchema, aliases: &AliasTable, headers: &[String]) -> MappingResult {
    let normalized: Vec<String> = headers.iter().map(|h| normalize_header(h)).collect();
    let mut used = vec![false; headers.len()];
    let mut resolved: Vec<(&'static str, usize, f64)> = Vec::new();

    for def in schema.mapped_fields() {
        let hit = aliases.aliases_for(def.name).iter().find_map(|alias| {
            let alias = normalize_header(alias);
            (0..headers.len()).find(|&i| !used[i] && !alias.is_empty() && normalized[i] == alias)
        });
        if let Some(idx) = hit {
            used[idx] = true;
            resolved.push((def.name, idx, EXACT_ALIAS_SCORE));
        }
    }

    for def in schema.mapped_fields() {
        if resolved.iter().any(|(name, _, _)| *name == def.name) {
            continue;
        }
        let hit = aliases.aliases_for(def.name).iter().find_map(|alias| {
            let alias = normalize_header(alias);
            (0..headers.len())
                .find(|&i| !used[i] && !alias.is_empty() && contains_tokens(&normalized[i], &alias))
        });
        if let Some(idx) = hit {
            used[idx] = true;
            resolved.push((def.name, idx, CONTAINED_ALIAS_SCORE));
        }
    }

    let taken: Vec<&str> = resolved.iter().map(|(name, _, _)| *name).collect();
    let confidence = if resolved.is_empty() {
        0.0
    } else {
        resolved.iter().map(|(_, _, score)| score).sum::<f64>() / resolved.len() as f64
    };
    let mapping = resolved
        .iter()
        .map(|(name, idx, _)| (headers[*idx].clone(), name.to_string()))
        .collect();

    MappingResult {
        category: schema.category,
        mapping,
        confidence,
        origin: MappingOrigin::Fallback,
        missing_required: missing_required(schema, &taken),
    }
}

fn missing_required(schema: &TargetSchema, taken: &[&str]) -> Vec<String> {
    schema
        .required_mapped_fields()
        .filter(|f| !taken.contains(&f.name))
        .map(|f| f.name.to_string())
        .collect()
}

/// `"Operation Time(ET)"` -> `"OPERATION TIME ET"`, `"OperationDate"` -> `"OPERATION DATE"`.
pub fn normalize_header(input: &str) -> String {
    let mut spaced = String::with_capacity(input.len() + 4);
    let mut prev_lower = false;
    for c in input.chars() {
        if c.is_uppercase() && prev_lower {
            spaced.push(' ');
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
        spaced.push(if c.is_alphanumeric() { c } else { ' ' });
    }
    spaced
        .to_uppercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// True when `needle`'s tokens appear contiguously in `haystack`'s tokens.
fn contains_tokens(haystack: &str, needle: &str) -> bool {
    let hay: Vec<&str> = haystack.split(' ').collect();
    let pin: Vec<&str> = needle.split(' ').collect();
    !pin.is_empty() && pin.len() <= hay.len() && hay.windows(pin.len()).any(|w| w == pin.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use fedao_core::{default_aliases, OperationCategory, RawRow, MOA_SCHEMA, TOA_SCHEMA};
    use fedao_storage::{RetryDisposition, RetryPolicy};

    use crate::config::DedupConfig;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn fast_policy() -> MapperPolicy {
        MapperPolicy {
            confidence_threshold: 0.8,
            timeout: Duration::from_millis(50),
            retry: RetryPolicy {
                max_retries: 2,
                delay: Duration::from_millis(1),
            },
            sample_rows: 3,
        }
    }

    fn toa_config() -> CategoryConfig {
        CategoryConfig::new(OperationCategory::Toa, fast_policy(), DedupConfig::default())
    }

    fn toa_table() -> RawTable {
        let headers = strings(&[
            "OperationDate",
            "OperationTime",
            "Operation Type",
            "Securities Included (CUSP)",
            "Security Maximums (Millions)",
            "OperationMaximum",
        ]);
        let row = strings(&[
            "6/3/2025",
            "10:10 AM - 10:30 AM",
            "Outright Bill Purchase",
            "912797KX4",
            "$2 million",
            "$5 million",
        ]);
        RawTable {
            category: OperationCategory::Toa,
            rows: vec![RawRow::from_positional(&headers, &row)],
            headers,
            source_url: None,
            fetched_at: Utc.with_ymd_and_hms(2025, 6, 3, 12, 0, 0).single().unwrap(),
        }
    }

    struct ScriptedOracle {
        calls: AtomicUsize,
        outcome: fn(usize) -> Result<OracleResponse, OracleError>,
    }

    #[async_trait]
    impl MappingOracle for ScriptedOracle {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn map(&self, _request: &OracleRequest) -> Result<OracleResponse, OracleError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            (self.outcome)(call)
        }
    }

    struct HangingOracle;

    #[async_trait]
    impl MappingOracle for HangingOracle {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn map(&self, _request: &OracleRequest) -> Result<OracleResponse, OracleError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(OracleError::NotConfigured)
        }
    }

    fn good_response() -> OracleResponse {
        OracleResponse {
            mapping: BTreeMap::from([
                ("OperationDate".to_string(), "Operation_Date".to_string()),
                ("Operation Type".to_string(), "Operation_Type".to_string()),
                ("Securities Included (CUSP)".to_string(), "Security_Identifier".to_string()),
            ]),
            confidence: 0.95,
        }
    }

    #[test]
    fn header_normalization_handles_camel_case_and_punctuation() {
        assert_eq!(normalize_header("OperationDate"), "OPERATION DATE");
        assert_eq!(normalize_header("Operation Time(ET)"), "OPERATION TIME ET");
        assert_eq!(normalize_header(" Securities Included (CUSP) "), "SECURITIES INCLUDED CUSP");
        assert_eq!(normalize_header("CUSIP"), "CUSIP");
    }

    #[test]
    fn fallback_resolves_fedao_headers_deterministically() {
        let table = toa_table();
        let aliases = default_aliases(OperationCategory::Toa);
        let first = fallback_mapping(&TOA_SCHEMA, &aliases, &table.headers);
        let second = fallback_mapping(&TOA_SCHEMA, &aliases, &table.headers);
        assert_eq!(first, second);
        assert!(first.is_complete());
        assert_eq!(first.origin, MappingOrigin::Fallback);
        assert_eq!(first.header_for("Operation_Date"), Some("OperationDate"));
        assert_eq!(first.header_for("Security_Identifier"), Some("Securities Included (CUSP)"));
        assert_eq!(first.header_for("Security_Maximum_Size"), Some("Security Maximums (Millions)"));
        assert_eq!(first.header_for("Operation_Maximum_Size"), Some("OperationMaximum"));
        assert_eq!(first.confidence, 1.0);
    }

    #[test]
    fn fallback_uses_containment_after_exact_matches() {
        let headers = strings(&["Trade Operation Date", "Type", "Operation Time (ET)", "Settlement Date", "Security Type and Maturity"]);
        let result = fallback_mapping(&MOA_SCHEMA, &default_aliases(OperationCategory::Moa), &headers);
        assert!(result.is_complete(), "{:?}", result.missing_required);
        assert_eq!(result.header_for("Operation_Date"), Some("Trade Operation Date"));
        assert_eq!(result.header_for("Settlement_Date"), Some("Settlement Date"));
        assert!(result.confidence < 1.0);
    }

    #[test]
    fn unresolvable_required_field_flags_incomplete() {
        let headers = strings(&["Operation Date", "Notes"]);
        let result = fallback_mapping(&TOA_SCHEMA, &default_aliases(OperationCategory::Toa), &headers);
        assert!(!result.is_complete());
        assert_eq!(result.missing_required, vec!["Operation_Type".to_string()]);
        assert!(result.header_for("Operation_Type").is_none());
    }

    #[test]
    fn oracle_output_is_sanitized() {
        let headers = strings(&["A", "B", "C", "D"]);
        let response = OracleResponse {
            mapping: BTreeMap::from([
                ("A".to_string(), "Operation_Date".to_string()),
                ("B".to_string(), "Operation_Date".to_string()),
                ("C".to_string(), "Operation_Type".to_string()),
                ("D".to_string(), "Source_Date".to_string()),
                ("Z".to_string(), "Operation_Time".to_string()),
            ]),
            confidence: 0.9,
        };
        let result = accept_oracle_response(&TOA_SCHEMA, &headers, response, &fast_policy()).unwrap();
        assert_eq!(result.mapping.len(), 2);
        assert_eq!(result.header_for("Operation_Date"), Some("A"));
        assert_eq!(result.origin, MappingOrigin::Ai);
    }

    #[test]
    fn low_confidence_oracle_output_is_refused() {
        let mut response = good_response();
        response.confidence = 0.5;
        let headers = toa_table().headers;
        assert!(accept_oracle_response(&TOA_SCHEMA, &headers, response, &fast_policy()).is_err());
    }

    #[tokio::test]
    async fn confident_oracle_mapping_is_used() {
        let oracle = ScriptedOracle {
            calls: AtomicUsize::new(0),
            outcome: |_| Ok(good_response()),
        };
        let mapper = FieldMapper::new(Arc::new(oracle));
        let result = mapper.map(&toa_table(), &toa_config()).await;
        assert_eq!(result.origin, MappingOrigin::Ai);
        assert_eq!(result.confidence, 0.95);
        assert!(result.is_complete());
    }

    #[tokio::test]
    async fn transient_errors_are_retried_before_success() {
        let oracle = Arc::new(ScriptedOracle {
            calls: AtomicUsize::new(0),
            outcome: |call| {
                if call < 2 {
                    Err(OracleError::Status {
                        status: 503,
                        disposition: RetryDisposition::Retryable,
                    })
                } else {
                    Ok(good_response())
                }
            },
        });
        let mapper = FieldMapper::new(oracle.clone());
        let result = mapper.map(&toa_table(), &toa_config()).await;
        assert_eq!(result.origin, MappingOrigin::Ai);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn oracle_error_falls_back_with_required_fields_resolved() {
        let oracle = Arc::new(ScriptedOracle {
            calls: AtomicUsize::new(0),
            outcome: |_| Err(OracleError::Malformed("not json".into())),
        });
        let mapper = FieldMapper::new(oracle.clone());
        let result = mapper.map(&toa_table(), &toa_config()).await;
        assert_eq!(result.origin, MappingOrigin::Fallback);
        assert!(result.is_complete());
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn oracle_timeout_falls_back_after_bounded_retries() {
        let mapper = FieldMapper::new(Arc::new(HangingOracle));
        let result = mapper.map(&toa_table(), &toa_config()).await;
        assert_eq!(result.origin, MappingOrigin::Fallback);
        assert!(result.is_complete());
        assert!(TOA_SCHEMA
            .required_mapped_fields()
            .all(|f| result.header_for(f.name).is_some()));
    }
}
