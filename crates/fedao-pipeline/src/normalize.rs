//! Canonical text, date and amount encodings.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use fedao_core::{CandidateRecord, FieldSource, FieldType, TargetSchema, CURRENCY_SYMBOLS};
use regex::Regex;
use tracing::debug;

static BREAK_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<\s*br\s*/?\s*>").expect("valid break regex"));
static ANY_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid tag regex"));
static NBSP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)&nbsp;?").expect("valid nbsp regex"));
static WEEKDAY_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(mon|tue|tues|wed|thu|thur|thurs|fri|sat|sun)[a-z]*\.?,?\s+")
        .expect("valid weekday regex")
});
static AMOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?P<currency>[$€£¥])?\s*(?P<number>\d[\d,]*(?:\.\d+)?|\.\d+)\s*(?P<multiplier>million|billion)?")
        .expect("valid amount regex")
});

const DATE_FORMATS: &[&str] = &[
    "%m/%d/%Y",
    "%m/%d/%y",
    "%Y-%m-%d",
    "%B %d, %Y",
    "%b %d, %Y",
    "%b. %d, %Y",
    "%B %d %Y",
    "%b %d %Y",
];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
];

/// Strips markup and entity artifacts, collapses whitespace.
pub fn clean_text(raw: &str) -> String {
    let text = BREAK_TAG.replace_all(raw, " ");
    let text = NBSP.replace_all(&text, " ");
    let text = ANY_TAG.replace_all(&text, "");
    let text = text
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace('\u{a0}', " ");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parses every date encoding seen in FEDAO tables. Years outside 1900..=2199
/// are treated as misreads (`6/3/25` read with a four-digit pattern).
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let text = clean_text(raw);
    let text = WEEKDAY_PREFIX.replace(&text, "");
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let plausible = |d: NaiveDate| (1900..2200).contains(&chrono::Datelike::year(&d));

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.date_naive()).filter(|d| plausible(*d));
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Some(dt.date()).filter(|d| plausible(*d));
        }
    }
    DATE_FORMATS
        .iter()
        .filter_map(|format| NaiveDate::parse_from_str(text, format).ok())
        .find(|d| plausible(*d))
}

pub fn iso_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn compact_date(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct AmountParts {
    pub currency: Option<String>,
    pub magnitude: Option<f64>,
    pub multiplier: Option<String>,
}

impl AmountParts {
    pub fn is_complete(&self) -> bool {
        self.part_count() == 3
    }

    fn part_count(&self) -> usize {
        [self.currency.is_some(), self.magnitude.is_some(), self.multiplier.is_some()]
            .into_iter()
            .filter(|present| *present)
            .count()
    }
}

/// `"$24 million"` -> (`$`, 24.0, `million`). When the text holds several numbers the
/// one carrying the most amount parts wins, leftmost first, so the `1` of
/// `"Tranche 1: $5 million"` is skipped. Anything short of all three parts keeps only
/// the magnitude.
pub fn decompose_amount(raw: &str) -> AmountParts {
    let text = clean_text(raw);
    let best = AMOUNT
        .captures_iter(&text)
        .map(|caps| amount_parts(&caps))
        .filter(|parts| parts.magnitude.is_some())
        .fold(None::<AmountParts>, |best, parts| match best {
            Some(current) if current.part_count() >= parts.part_count() => Some(current),
            _ => Some(parts),
        });

    match best {
        Some(parts) if parts.is_complete() => parts,
        Some(parts) => AmountParts {
            currency: None,
            magnitude: parts.magnitude,
            multiplier: None,
        },
        None => AmountParts {
            currency: None,
            magnitude: None,
            multiplier: None,
        },
    }
}

fn amount_parts(caps: &regex::Captures<'_>) -> AmountParts {
    let magnitude = caps
        .name("number")
        .and_then(|m| m.as_str().replace(',', "").parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0);
    let currency = caps
        .name("currency")
        .map(|m| m.as_str().to_string())
        .filter(|c| CURRENCY_SYMBOLS.iter().any(|s| *s == c.as_str()));
    let multiplier = caps.name("multiplier").map(|m| m.as_str().to_ascii_lowercase());
    AmountParts {
        currency,
        magnitude,
        multiplier,
    }
}

pub fn format_magnitude(value: f64) -> String {
    format!("{value}")
}

/// Produces canonical values for every schema field of a split candidate. Values
/// that cannot be parsed become empty unless the field is required, in which case
/// the cleaned raw text is kept for the validator to reject.
pub fn normalize_candidate(schema: &TargetSchema, mut candidate: CandidateRecord) -> CandidateRecord {
    for def in schema.fields {
        let cleaned = clean_text(candidate.get(def.name));
        candidate.set(def.name, cleaned);
    }

    let mut latest: Option<NaiveDate> = None;
    for def in schema.date_fields() {
        let value = candidate.get(def.name).to_string();
        if value.is_empty() {
            continue;
        }
        match parse_date(&value) {
            Some(date) => {
                latest = latest.max(Some(date));
                candidate.set(def.name, iso_date(date));
            }
            None if def.required => {
                debug!(field = def.name, value = %value, row = candidate.source_row, "unparseable required date");
            }
            None => {
                debug!(field = def.name, value = %value, row = candidate.source_row, "dropping unparseable date");
                candidate.clear(def.name);
            }
        }
    }

    for group in schema.amount_groups {
        let parts = decompose_amount(candidate.get(group.size));
        candidate.set(
            group.size,
            parts.magnitude.map(format_magnitude).unwrap_or_default(),
        );
        candidate.set(group.currency, parts.currency.unwrap_or_default());
        candidate.set(group.multiplier, parts.multiplier.unwrap_or_default());
    }

    for def in schema.fields {
        if def.source == FieldSource::Derived && def.field_type == FieldType::CompactDate {
            candidate.set(def.name, latest.map(compact_date).unwrap_or_default());
        }
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedao_core::TOA_SCHEMA;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn cleans_markup_and_whitespace() {
        assert_eq!(
            clean_text("  Outright&nbsp;Bill<BR/>Purchase <span>A &amp; B</span>\n"),
            "Outright Bill Purchase A & B"
        );
    }

    #[test]
    fn canonical_dates_from_every_layout() {
        for raw in [
            "6/3/2025",
            "06/03/2025",
            "2025-06-03",
            "June 3, 2025",
            "Jun 3, 2025",
            "June 3 2025",
            "Tuesday, June 3, 2025",
            "2025-06-03T14:00:00Z",
            "2025-06-03T14:00:00",
            "2025-06-03 14:00:00",
            "6/3/25",
        ] {
            assert_eq!(parse_date(raw), Some(ymd(2025, 6, 3)), "{raw}");
        }
        assert_eq!(parse_date("TBD"), None);
        assert_eq!(parse_date(""), None);
    }

    #[test]
    fn dollar_million_decomposes_fully() {
        let parts = decompose_amount("$24 million");
        assert_eq!(parts.currency.as_deref(), Some("$"));
        assert_eq!(parts.magnitude, Some(24.0));
        assert_eq!(parts.multiplier.as_deref(), Some("million"));
        assert_eq!(format_magnitude(24.0), "24");
    }

    #[test]
    fn partial_amounts_keep_only_magnitude() {
        let bare = decompose_amount("1,250.5");
        assert_eq!(bare.magnitude, Some(1250.5));
        assert!(bare.currency.is_none() && bare.multiplier.is_none());

        let no_unit = decompose_amount("$75");
        assert_eq!(no_unit.magnitude, Some(75.0));
        assert!(no_unit.currency.is_none());

        assert_eq!(decompose_amount("n/a").magnitude, None);
        assert_eq!(decompose_amount("€1.5 Billion").multiplier.as_deref(), Some("billion"));
    }

    #[test]
    fn labelled_amounts_use_the_number_with_currency_and_unit() {
        let tranche = decompose_amount("Tranche 1: $5 million");
        assert_eq!(tranche.currency.as_deref(), Some("$"));
        assert_eq!(tranche.magnitude, Some(5.0));
        assert_eq!(tranche.multiplier.as_deref(), Some("million"));

        let partial = decompose_amount("Round 2 - $40");
        assert_eq!(partial.magnitude, Some(40.0));
        assert!(partial.currency.is_none());

        assert_eq!(decompose_amount("10 then 20").magnitude, Some(10.0));
    }

    #[test]
    fn candidate_gets_canonical_values_and_source_date() {
        let mut candidate = CandidateRecord::empty(&TOA_SCHEMA, 1.0, 0);
        candidate.set("Operation_Date", "June 3, 2025");
        candidate.set("Operation_Type", " Outright <br> Bill Purchase ");
        candidate.set("Security_Identifier", "912797KX4");
        candidate.set("Security_Maximum_Size", "$24 million");
        candidate.set("Operation_Maximum_Size", "80");

        let normalized = normalize_candidate(&TOA_SCHEMA, candidate);
        assert_eq!(normalized.get("Operation_Date"), "2025-06-03");
        assert_eq!(normalized.get("Source_Date"), "20250603");
        assert_eq!(normalized.get("Operation_Type"), "Outright Bill Purchase");
        assert_eq!(normalized.get("Security_Maximum_Currency"), "$");
        assert_eq!(normalized.get("Security_Maximum_Size"), "24");
        assert_eq!(normalized.get("Security_Maximum_Multiplier"), "million");
        assert_eq!(normalized.get("Operation_Maximum_Size"), "80");
        assert_eq!(normalized.get("Operation_Maximum_Currency"), "");
        assert_eq!(normalized.fields.len(), TOA_SCHEMA.fields.len());
    }

    #[test]
    fn unparseable_required_date_is_left_for_rejection() {
        let mut candidate = CandidateRecord::empty(&TOA_SCHEMA, 1.0, 4);
        candidate.set("Operation_Date", "To be announced");
        let normalized = normalize_candidate(&TOA_SCHEMA, candidate);
        assert_eq!(normalized.get("Operation_Date"), "To be announced");
        assert_eq!(normalized.get("Source_Date"), "");
    }
}
