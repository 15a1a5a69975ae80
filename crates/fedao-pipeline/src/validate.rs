use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use fedao_core::{
    CandidateRecord, DiagnosticRecord, FieldDef, FieldType, OperationRecord, TargetSchema,
    ValidationRule,
};
use regex::Regex;
use tracing::debug;

static CUSIP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z0-9*@#]{8}[0-9]$").expect("valid cusip regex"));
static TBA_TICKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Z][A-Z0-9]{1,7} \d{1,2}(?:\.\d{1,3})?$").expect("valid ticker regex")
});

/// A nine-character CUSIP (format only, check digit not verified) or a TBA
/// ticker/coupon pair such as `FNCI 2.5`.
pub fn is_valid_cusip_format(value: &str) -> bool {
    let upper = value.trim().to_ascii_uppercase();
    CUSIP.is_match(&upper) || TBA_TICKER.is_match(&upper)
}

pub fn is_iso_date(value: &str) -> bool {
    value.len() == 10 && NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok()
}

pub fn is_compact_date(value: &str) -> bool {
    value.len() == 8
        && value.bytes().all(|b| b.is_ascii_digit())
        && NaiveDate::parse_from_str(value, "%Y%m%d").is_ok()
}

fn type_accepts(field_type: FieldType, value: &str) -> bool {
    match field_type {
        FieldType::Text => true,
        FieldType::IsoDate => is_iso_date(value),
        FieldType::CompactDate => is_compact_date(value),
        FieldType::Float => value.parse::<f64>().map(f64::is_finite).unwrap_or(false),
        FieldType::Enum(allowed) => allowed.iter().any(|a| *a == value),
    }
}

fn rule_accepts(rule: ValidationRule, value: &str) -> bool {
    if value.is_empty() {
        return rule != ValidationRule::NonEmpty;
    }
    match rule {
        ValidationRule::NonEmpty => true,
        ValidationRule::ValidIsoDate => is_iso_date(value),
        ValidationRule::ValidCompactDate => is_compact_date(value),
        ValidationRule::NumericOnly => value
            .parse::<f64>()
            .map(|v| v.is_finite() && v >= 0.0)
            .unwrap_or(false),
        ValidationRule::ValidCusipFormat => is_valid_cusip_format(value),
    }
}

/// Required-field and type failures reject the record; a rule failure on an
/// optional field only clears that field.
pub fn validate_candidate(
    schema: &TargetSchema,
    mut candidate: CandidateRecord,
    now: DateTime<Utc>,
) -> Result<OperationRecord, DiagnosticRecord> {
    let reject = |candidate: &CandidateRecord, def: &FieldDef, problem: String| {
        DiagnosticRecord::new(
            schema.category,
            format!("{problem} (from {})", candidate.origin_of(def.name)),
            now,
            Some(candidate.source_row),
        )
    };

    for def in schema.fields {
        let value = candidate.get(def.name).to_string();

        if def.required && value.is_empty() {
            return Err(reject(&candidate, def, format!("required field {} is empty", def.name)));
        }
        if !value.is_empty() && !type_accepts(def.field_type, &value) {
            return Err(reject(
                &candidate,
                def,
                format!("{} `{value}` is not a valid {}", def.name, def.field_type.as_str()),
            ));
        }
        if let Some(rule) = def.rules.iter().find(|r| !rule_accepts(**r, &value)) {
            if def.required {
                return Err(reject(
                    &candidate,
                    def,
                    format!("{} `{value}` fails {}", def.name, rule.name()),
                ));
            }
            debug!(field = def.name, value = %value, rule = rule.name(), "clearing optional field");
            candidate.clear(def.name);
        }
    }

    Ok(candidate.into_operation(schema))
}
