//! One raw row -> one or more atomic candidate records.

use std::sync::LazyLock;

use fedao_core::{
    CandidateRecord, EvidenceRef, MappingResult, RawRow, SplitRule, TargetSchema, CURRENCY_SYMBOLS,
};
use regex::Regex;
use tracing::debug;

use crate::normalize::{clean_text, parse_date};

static LINE_DELIMITER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\r?\n|<\s*br\s*/?\s*>|</\s*(?:p|div|li)\s*>|;|•|\|").expect("valid delimiter regex")
});

/// A CUSIP (any case) or an upper-case TBA ticker with its coupon, e.g. `FNCL 5.0`.
static SECURITY_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:(?i:[0-9a-z]{8}[0-9])|[A-Z][A-Z0-9]{1,7} \d{1,2}(?:\.\d{1,3})?)\b")
        .expect("valid security token regex")
});

const SNIPPET_CHARS: usize = 120;

pub fn split_row(
    schema: &TargetSchema,
    mapping: &MappingResult,
    row: &RawRow,
    row_index: usize,
) -> Vec<CandidateRecord> {
    let mut base = CandidateRecord::empty(schema, mapping.confidence, row_index);
    for (header, value) in row.iter() {
        let Some(field) = mapping.mapping.get(header) else {
            continue;
        };
        base.set(field, value);
        base.evidence.insert(
            field.clone(),
            EvidenceRef {
                raw_header: header.to_string(),
                source_row: row_index,
                snippet: snippet(value),
            },
        );
    }

    match schema.split_rule {
        SplitRule::SubEntries {
            identifier_field,
            amount_field,
            fallback_amount_field,
        } => split_sub_entries(base, identifier_field, amount_field, fallback_amount_field),
        SplitRule::DateRangeEnd {
            date_field,
            range_field,
        } => vec![collapse_date_range(base, date_field, range_field)],
    }
}

fn snippet(value: &str) -> String {
    value.chars().take(SNIPPET_CHARS).collect()
}

/// Non-empty cleaned lines of a multi-valued cell, in order of appearance.
pub fn cell_lines(raw: &str) -> Vec<String> {
    LINE_DELIMITER
        .split(raw)
        .map(clean_text)
        .filter(|line| !line.is_empty())
        .collect()
}

/// Sub-entries of a multi-security cell: its lines, with any line naming two or more
/// securities cut at the start of each one (a leading label is dropped). Tokens right after a currency symbol
/// belong to an amount and never start an entry.
pub fn sub_entries(raw: &str) -> Vec<String> {
    cell_lines(raw)
        .into_iter()
        .flat_map(|line| {
            let starts: Vec<usize> = SECURITY_TOKEN
                .find_iter(&line)
                .map(|m| m.start())
                .filter(|&start| {
                    let before = line[..start].trim_end();
                    !CURRENCY_SYMBOLS.iter().any(|symbol| before.ends_with(symbol))
                })
                .collect();
            if starts.len() < 2 {
                return vec![line];
            }
            let mut cuts = starts;
            cuts.push(line.len());
            cuts.windows(2)
                .map(|w| trim_joiner(&line[w[0]..w[1]]))
                .filter(|segment| !segment.is_empty())
                .collect()
        })
        .collect()
}

/// Drops list punctuation and a trailing `and` left between two securities.
fn trim_joiner(segment: &str) -> String {
    let trimmed = segment.trim_end_matches(|c: char| matches!(c, ',' | '&' | '/') || c.is_whitespace());
    let trimmed = match trimmed.len().checked_sub(4) {
        Some(at) if trimmed.is_char_boundary(at) && trimmed[at..].eq_ignore_ascii_case(" and") => &trimmed[..at],
        _ => trimmed,
    };
    trimmed.trim_end_matches(|c: char| c == ',' || c.is_whitespace()).trim().to_string()
}

/// `"912797KX4 - $2 million"` -> (`"912797KX4"`, `Some("$2 million")`).
pub fn split_sub_entry(entry: &str) -> (String, Option<String>) {
    let cut = CURRENCY_SYMBOLS
        .iter()
        .filter_map(|symbol| entry.find(*symbol))
        .min();
    match cut {
        Some(idx) => {
            let identifier = entry[..idx]
                .trim()
                .trim_matches(|c: char| matches!(c, '-' | ':' | ',' | '(' | ')') || c.is_whitespace())
                .to_string();
            let amount = entry[idx..].trim().trim_end_matches(')').trim().to_string();
            (identifier, Some(amount).filter(|a| !a.is_empty()))
        }
        None => (entry.trim().to_string(), None),
    }
}

fn split_sub_entries(
    base: CandidateRecord,
    identifier_field: &str,
    amount_field: &str,
    fallback_amount_field: Option<&str>,
) -> Vec<CandidateRecord> {
    let entries = sub_entries(base.get(identifier_field));
    if entries.is_empty() {
        let mut record = base;
        record.clear(identifier_field);
        return vec![record];
    }

    let amount_lines = cell_lines(base.get(amount_field));
    let fallback_amount = fallback_amount_field
        .map(|f| base.get(f).to_string())
        .filter(|a| !a.trim().is_empty());

    let count = entries.len();
    let records: Vec<CandidateRecord> = entries
        .into_iter()
        .enumerate()
        .map(|(idx, entry)| {
            let (identifier, inline_amount) = split_sub_entry(&entry);
            let paired = if amount_lines.len() == 1 {
                amount_lines.first()
            } else {
                amount_lines.get(idx)
            };
            let amount = inline_amount
                .or_else(|| paired.cloned())
                .or_else(|| fallback_amount.clone())
                .unwrap_or_default();

            let mut record = base.clone();
            record.set(identifier_field, identifier);
            record.set(amount_field, amount);
            if let Some(ev) = record.evidence.get_mut(identifier_field) {
                ev.snippet = snippet(&entry);
            }
            record
        })
        .collect();

    if count > 1 {
        debug!(row = base.source_row, sub_entries = count, "split multi-security cell");
    }
    records
}

/// Keeps the end of a `D1 - D2` range as the operation date and the cleaned range
/// text in `range_field`. Cells that are not a range pass through untouched.
fn collapse_date_range(mut record: CandidateRecord, date_field: &str, range_field: &str) -> CandidateRecord {
    let raw = clean_text(record.get(date_field));
    if let Some((_, end)) = split_date_range(&raw) {
        debug!(row = record.source_row, range = %raw, "collapsed date range to end date");
        record.set(date_field, end);
        record.set(range_field, raw);
    }
    record
}

/// Splits on en/em dashes, `" to "`, or a hyphen; both sides must parse as dates so
/// ISO dates are never cut apart.
pub fn split_date_range(text: &str) -> Option<(String, String)> {
    for separator in ["–", "—", " to ", " TO ", " - ", "-"] {
        let mut found = None;
        for (idx, _) in text.match_indices(separator) {
            let start = text[..idx].trim();
            let end = text[idx + separator.len()..].trim();
            if parse_date(start).is_some() && parse_date(end).is_some() {
                found = Some((start.to_string(), end.to_string()));
                break;
            }
        }
        if found.is_some() {
            return found;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use fedao_core::{MappingOrigin, OperationCategory, MOA_SCHEMA, TOA_SCHEMA};

    fn mapping(category: OperationCategory, pairs: &[(&str, &str)]) -> MappingResult {
        MappingResult {
            category,
            mapping: pairs
                .iter()
                .map(|(h, f)| (h.to_string(), f.to_string()))
                .collect::<BTreeMap<_, _>>(),
            confidence: 0.9,
            origin: MappingOrigin::Fallback,
            missing_required: Vec::new(),
        }
    }

    fn toa_mapping() -> MappingResult {
        mapping(
            OperationCategory::Toa,
            &[
                ("Date", "Operation_Date"),
                ("Type", "Operation_Type"),
                ("CUSIP", "Security_Identifier"),
                ("Amount", "Security_Maximum_Size"),
                ("Max", "Operation_Maximum_Size"),
            ],
        )
    }

    fn toa_row(cusips: &str, amounts: &str) -> RawRow {
        RawRow::new(vec![
            ("Date".into(), "6/3/2025".into()),
            ("Type".into(), "Outright Bill Purchase".into()),
            ("CUSIP".into(), cusips.into()),
            ("Amount".into(), amounts.into()),
            ("Max".into(), "$50 million".into()),
        ])
    }

    #[test]
    fn k_sub_entries_make_k_records_sharing_other_fields() {
        let row = toa_row("912797KX4 $2 million<br>912797LB1 $3 million<br/>912797LC9 $4 million", "");
        let records = split_row(&TOA_SCHEMA, &toa_mapping(), &row, 7);
        assert_eq!(records.len(), 3);
        let ids: Vec<&str> = records.iter().map(|r| r.get("Security_Identifier")).collect();
        assert_eq!(ids, vec!["912797KX4", "912797LB1", "912797LC9"]);
        assert_eq!(records[1].get("Security_Maximum_Size"), "$3 million");
        for record in &records {
            assert_eq!(record.get("Operation_Date"), "6/3/2025");
            assert_eq!(record.get("Operation_Type"), "Outright Bill Purchase");
            assert_eq!(record.get("Operation_Maximum_Size"), "$50 million");
            assert_eq!(record.source_row, 7);
            assert_eq!(record.fields.len(), TOA_SCHEMA.fields.len());
        }
        assert_eq!(records[2].evidence["Security_Identifier"].snippet, "912797LC9 $4 million");
    }

    #[test]
    fn empty_identifier_cell_yields_one_record() {
        let records = split_row(&TOA_SCHEMA, &toa_mapping(), &toa_row("  ", "$9 million"), 0);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("Security_Identifier"), "");
        assert_eq!(records[0].get("Security_Maximum_Size"), "$9 million");
    }

    #[test]
    fn amounts_pair_by_line_then_inherit_then_fall_back() {
        let paired = split_row(&TOA_SCHEMA, &toa_mapping(), &toa_row("FNCI 2.5\nFNCL 5.0", "$10 million\n$20 million"), 0);
        assert_eq!(paired[0].get("Security_Maximum_Size"), "$10 million");
        assert_eq!(paired[1].get("Security_Maximum_Size"), "$20 million");

        let inherited = split_row(&TOA_SCHEMA, &toa_mapping(), &toa_row("FNCI 2.5; FNCL 5.0", "$10 million"), 0);
        assert!(inherited.iter().all(|r| r.get("Security_Maximum_Size") == "$10 million"));

        let fallback = split_row(&TOA_SCHEMA, &toa_mapping(), &toa_row("FNCI 2.5\nFNCL 5.0\nG2SF 6.0", "$10 million\n$20 million"), 0);
        assert_eq!(fallback[2].get("Security_Maximum_Size"), "$50 million");
    }

    #[test]
    fn sub_entry_separates_identifier_from_inline_amount() {
        assert_eq!(
            split_sub_entry("912797KX4 - $2 million"),
            ("912797KX4".to_string(), Some("$2 million".to_string()))
        );
        assert_eq!(
            split_sub_entry("FNCI 2.5 ($24 million)"),
            ("FNCI 2.5".to_string(), Some("$24 million".to_string()))
        );
        assert_eq!(split_sub_entry("912797KX4"), ("912797KX4".to_string(), None));
    }

    #[test]
    fn moa_range_keeps_end_date_and_raw_range() {
        let mapping = mapping(
            OperationCategory::Moa,
            &[("Operation Date", "Operation_Date"), ("Time", "Operation_Time")],
        );
        let row = RawRow::new(vec![
            ("Operation Date".into(), "6/2/2025 - 6/4/2025".into()),
            ("Time".into(), "11:30 AM - 11:50 AM".into()),
        ]);
        let records = split_row(&MOA_SCHEMA, &mapping, &row, 0);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("Operation_Date"), "6/4/2025");
        assert_eq!(records[0].get("Operation_Date_Range"), "6/2/2025 - 6/4/2025");
        assert_eq!(records[0].get("Operation_Time"), "11:30 AM - 11:50 AM");
    }

    #[test]
    fn iso_dates_and_single_dates_are_not_ranges() {
        assert_eq!(split_date_range("2025-06-03"), None);
        assert_eq!(split_date_range("June 3, 2025"), None);
        assert_eq!(
            split_date_range("2025-06-02–2025-06-04"),
            Some(("2025-06-02".to_string(), "2025-06-04".to_string()))
        );
        assert_eq!(
            split_date_range("June 2, 2025 to June 4, 2025"),
            Some(("June 2, 2025".to_string(), "June 4, 2025".to_string()))
        );
        assert_eq!(
            split_date_range("6/2/2025-6/4/2025"),
            Some(("6/2/2025".to_string(), "6/4/2025".to_string()))
        );
    }

    #[test]
    fn one_line_with_several_securities_splits_per_security() {
        for cell in ["912797KX4, 912797LB1", "912797KX4 912797LB1", "912797KX4 and 912797LB1"] {
            let records = split_row(&TOA_SCHEMA, &toa_mapping(), &toa_row(cell, "$5 million"), 0);
            let ids: Vec<&str> = records.iter().map(|r| r.get("Security_Identifier")).collect();
            assert_eq!(ids, vec!["912797KX4", "912797LB1"], "cell {cell:?}");
            assert!(records.iter().all(|r| r.get("Security_Maximum_Size") == "$5 million"));
        }

        let tba = split_row(&TOA_SCHEMA, &toa_mapping(), &toa_row("FNCI 2.5 FNCL 5.0", "$10 million\n$20 million"), 0);
        let ids: Vec<&str> = tba.iter().map(|r| r.get("Security_Identifier")).collect();
        assert_eq!(ids, vec!["FNCI 2.5", "FNCL 5.0"]);
        assert_eq!(tba[1].get("Security_Maximum_Size"), "$20 million");
    }

    #[test]
    fn inline_amounts_stay_with_their_security_on_a_shared_line() {
        let records = split_row(
            &TOA_SCHEMA,
            &toa_mapping(),
            &toa_row("912797KX4 $2 million, 912797LB1 $3 million", ""),
            0,
        );
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("Security_Identifier"), "912797KX4");
        assert_eq!(records[0].get("Security_Maximum_Size"), "$2 million");
        assert_eq!(records[1].get("Security_Identifier"), "912797LB1");
        assert_eq!(records[1].get("Security_Maximum_Size"), "$3 million");
        assert_eq!(records[1].evidence["Security_Identifier"].snippet, "912797LB1 $3 million");
    }

    #[test]
    fn lines_with_one_security_are_kept_whole() {
        assert_eq!(sub_entries("912797KX4 - $1,250 million"), vec!["912797KX4 - $1,250 million"]);
        assert_eq!(sub_entries("FNCI 2.5 ($24 million)"), vec!["FNCI 2.5 ($24 million)"]);
        assert_eq!(sub_entries("$123456789"), vec!["$123456789"]);
        assert!(sub_entries(" <br> ").is_empty());
        assert_eq!(sub_entries("CUSIPs: 912797KX4, 912797LB1"), vec!["912797KX4", "912797LB1"]);
    }
}
