//! Merge of validated batches into a master dataset by natural key.

use std::collections::HashMap;

use fedao_core::{KeyMatch, OperationRecord, TargetSchema};
use serde::Serialize;
use strsim::jaro_winkler;
use tracing::debug;

use crate::config::DedupConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub records: Vec<OperationRecord>,
    pub stats: MergeStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    /// Records added to the dataset, superseding ones included.
    pub appended: usize,
    /// Older master records removed because a near-duplicate arrived.
    pub superseded: usize,
    /// Incoming records dropped: exact key matches, or near-duplicates overtaken by a
    /// later record of the same batch.
    pub duplicates: usize,
}

/// Records with their normalized keys. Removed records leave a hole so positions
/// in `index` stay valid.
#[derive(Default)]
struct KeyedRecords {
    slots: Vec<Option<(Vec<String>, OperationRecord)>>,
    index: HashMap<Vec<String>, usize>,
}

impl KeyedRecords {
    fn contains(&self, key: &[String]) -> bool {
        self.index.contains_key(key)
    }

    fn push(&mut self, key: Vec<String>, record: OperationRecord) {
        self.index.entry(key.clone()).or_insert(self.slots.len());
        self.slots.push(Some((key, record)));
    }

    fn take(&mut self, pos: usize) -> Option<Vec<String>> {
        let (key, _) = self.slots.get_mut(pos)?.take()?;
        self.index.remove(&key);
        Some(key)
    }

    fn into_entries(self) -> impl Iterator<Item = (Vec<String>, OperationRecord)> {
        self.slots.into_iter().flatten()
    }
}

pub struct DedupEngine {
    config: DedupConfig,
}

impl DedupEngine {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    pub fn normalize_key_fragment(input: &str) -> String {
        input
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }

    pub fn key(schema: &TargetSchema, record: &OperationRecord) -> Vec<String> {
        schema
            .dedup_key
            .iter()
            .map(|k| Self::normalize_key_fragment(record.get(k.name)))
            .collect()
    }

    /// Field-wise similarity of two normalized keys; the weakest field decides.
    /// Exact fields score 0 or 1. Fuzzy fields score 0 unless their letter and digit
    /// runs are identical, so only punctuation and spacing may differ: `FNCL 5.5` and
    /// `FNCI 5.5` stay distinct, as do `10:00` and `11:00`.
    pub fn similarity(schema: &TargetSchema, a: &[String], b: &[String]) -> f64 {
        schema
            .dedup_key
            .iter()
            .zip(a.iter().zip(b.iter()))
            .map(|(field, (x, y))| {
                if x == y {
                    return 1.0;
                }
                match field.matching {
                    KeyMatch::Exact => 0.0,
                    KeyMatch::Fuzzy if token_runs(x) != token_runs(y) => 0.0,
                    KeyMatch::Fuzzy => jaro_winkler(x, y),
                }
            })
            .fold(1.0, f64::min)
    }

    fn nearest(&self, schema: &TargetSchema, records: &KeyedRecords, key: &[String]) -> Option<(usize, f64)> {
        records
            .slots
            .iter()
            .enumerate()
            .filter_map(|(pos, slot)| {
                slot.as_ref()
                    .map(|(other, _)| (pos, Self::similarity(schema, key, other)))
            })
            .filter(|(_, score)| *score >= self.config.similarity_threshold)
            .fold(None::<(usize, f64)>, |best, candidate| match best {
                Some((_, best_score)) if best_score >= candidate.1 => best,
                _ => Some(candidate),
            })
    }

    /// The batch is first collapsed on itself (a later near-duplicate overtakes an
    /// earlier one), then merged: existing records keep their relative order and
    /// incoming records are appended in batch order. Re-merging the same batch is a
    /// no-op.
    pub fn merge(
        &self,
        schema: &TargetSchema,
        existing: Vec<OperationRecord>,
        batch: Vec<OperationRecord>,
    ) -> MergeOutcome {
        let mut stats = MergeStats::default();

        let mut incoming = KeyedRecords::default();
        for record in batch {
            let key = Self::key(schema, &record);
            if incoming.contains(&key) {
                stats.duplicates += 1;
                continue;
            }
            if let Some((pos, score)) = self.nearest(schema, &incoming, &key) {
                if let Some(old_key) = incoming.take(pos) {
                    debug!(category = %schema.category, score, old = ?old_key, new = ?key, "near-duplicate collapsed within batch");
                }
                stats.duplicates += 1;
            }
            incoming.push(key, record);
        }

        let mut master = KeyedRecords::default();
        for record in existing {
            master.push(Self::key(schema, &record), record);
        }
        for (key, record) in incoming.into_entries() {
            if master.contains(&key) {
                stats.duplicates += 1;
                continue;
            }
            if let Some((pos, score)) = self.nearest(schema, &master, &key) {
                if let Some(old_key) = master.take(pos) {
                    debug!(category = %schema.category, score, old = ?old_key, new = ?key, "near-duplicate superseded");
                }
                stats.superseded += 1;
            }
            master.push(key, record);
            stats.appended += 1;
        }

        MergeOutcome {
            records: master.into_entries().map(|(_, r)| r).collect(),
            stats,
        }
    }
}

/// Letter runs and digit runs, in order: `"30-year umbs 5.5"` ->
/// `["30", "year", "umbs", "5", "5"]`.
fn token_runs(value: &str) -> Vec<&str> {
    let mut runs = Vec::new();
    let mut start: Option<(usize, bool)> = None;
    for (idx, c) in value.char_indices() {
        let class = if c.is_alphabetic() {
            Some(true)
        } else if c.is_ascii_digit() {
            Some(false)
        } else {
            None
        };
        match (start, class) {
            (Some((_, alpha)), Some(now)) if alpha == now => {}
            (Some((from, _)), _) => {
                runs.push(&value[from..idx]);
                start = class.map(|alpha| (idx, alpha));
            }
            (None, Some(alpha)) => start = Some((idx, alpha)),
            (None, None) => {}
        }
    }
    if let Some((from, _)) = start {
        runs.push(&value[from..]);
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedao_core::{MOA_SCHEMA, TOA_SCHEMA};

    fn toa(date: &str, op_type: &str, cusip: &str, size: &str) -> OperationRecord {
        let values: Vec<String> = TOA_SCHEMA
            .fields
            .iter()
            .map(|f| match f.name {
                "Operation_Date" => date.to_string(),
                "Operation_Type" => op_type.to_string(),
                "Security_Identifier" => cusip.to_string(),
                "Security_Maximum_Size" => size.to_string(),
                _ => String::new(),
            })
            .collect();
        OperationRecord::from_row(&TOA_SCHEMA, &values)
    }

    fn moa(date: &str, time: &str, sec: &str) -> OperationRecord {
        let values: Vec<String> = MOA_SCHEMA
            .fields
            .iter()
            .map(|f| match f.name {
                "Operation_Date" => date.to_string(),
                "Operation_Time" => time.to_string(),
                "Operation_Type" => "TBA Purchase".to_string(),
                "Security_Type_And_Maturity" => sec.to_string(),
                _ => String::new(),
            })
            .collect();
        OperationRecord::from_row(&MOA_SCHEMA, &values)
    }

    fn engine() -> DedupEngine {
        DedupEngine::new(DedupConfig::default())
    }

    #[test]
    fn keys_ignore_cosmetic_whitespace_and_case() {
        let a = toa("2025-06-03", "Outright  Bill Purchase", "912797KX4", "24");
        let b = toa("2025-06-03", " outright bill purchase ", "912797kx4", "24");
        assert_eq!(DedupEngine::key(&TOA_SCHEMA, &a), DedupEngine::key(&TOA_SCHEMA, &b));
    }

    #[test]
    fn merge_is_idempotent() {
        let batch = vec![
            toa("2025-06-03", "Outright Bill Purchase", "912797KX4", "2"),
            toa("2025-06-03", "Outright Bill Purchase", "912797LB1", "3"),
        ];
        let first = engine().merge(&TOA_SCHEMA, Vec::new(), batch.clone());
        assert_eq!(first.stats.appended, 2);

        let second = engine().merge(&TOA_SCHEMA, first.records.clone(), batch);
        assert_eq!(second.records, first.records);
        assert_eq!(second.stats, MergeStats { appended: 0, superseded: 0, duplicates: 2 });
    }

    #[test]
    fn near_duplicate_supersedes_older_and_preserves_order() {
        let existing = vec![
            toa("2025-06-02", "Outright Bill Purchase", "912797AA1", "5"),
            toa("2025-06-03", "Outright Bill Purchase", "912797KX4", "2"),
            toa("2025-06-04", "Outright Bill Purchase", "912797BB2", "7"),
        ];
        let batch = vec![
            toa("2025-06-05", "Outright Bill Purchase", "912797CC3", "1"),
            toa("2025-06-03", "Outright Bill-Purchase", "912797KX4", "2"),
        ];
        let outcome = engine().merge(&TOA_SCHEMA, existing, batch);
        let ids: Vec<&str> = outcome
            .records
            .iter()
            .map(|r| r.get("Security_Identifier"))
            .collect();
        assert_eq!(ids, vec!["912797AA1", "912797BB2", "912797CC3", "912797KX4"]);
        assert_eq!(outcome.records[3].get("Operation_Type"), "Outright Bill-Purchase");
        assert_eq!(outcome.stats, MergeStats { appended: 2, superseded: 1, duplicates: 0 });
    }

    #[test]
    fn exact_key_fields_never_match_fuzzily() {
        let existing = vec![toa("2025-06-03", "Outright Bill Purchase", "912797KX4", "2")];
        let batch = vec![toa("2025-06-03", "Outright Bill Purchase", "912797KX5", "2")];
        let outcome = engine().merge(&TOA_SCHEMA, existing, batch);
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.stats.superseded, 0);
    }

    #[test]
    fn fuzzy_fields_with_different_numbers_stay_distinct() {
        let existing = vec![moa("2025-06-03", "11:30 AM - 11:50 AM", "30-year UMBS 5.5")];
        let batch = vec![
            moa("2025-06-03", "11:30 am-11:50 am", "30-year UMBS 5.5"),
            moa("2025-06-03", "1:30 PM - 1:50 PM", "30-year UMBS 5.5"),
            moa("2025-06-03", "11:30 AM - 11:50 AM", "30-year UMBS 6.0"),
        ];
        let outcome = engine().merge(&MOA_SCHEMA, existing, batch);
        assert_eq!(outcome.stats, MergeStats { appended: 3, superseded: 1, duplicates: 0 });
        assert_eq!(outcome.records.len(), 3);
        assert_eq!(outcome.records[0].get("Operation_Time"), "11:30 am-11:50 am");
    }

    #[test]
    fn duplicates_inside_one_batch_collapse() {
        let batch = vec![
            moa("2025-06-03", "11:30 AM - 11:50 AM", "30-year UMBS 5.5"),
            moa("2025-06-03", "11:30  AM - 11:50 AM", "30-year UMBS 5.5"),
        ];
        let outcome = engine().merge(&MOA_SCHEMA, Vec::new(), batch);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.stats.duplicates, 1);
    }

    #[test]
    fn securities_differing_in_one_letter_are_not_near_duplicates() {
        let batch = vec![
            moa("2025-06-03", "11:30 AM - 11:50 AM", "FNCL 5.5"),
            moa("2025-06-03", "11:30 AM - 11:50 AM", "FNCI 5.5"),
        ];
        let outcome = engine().merge(&MOA_SCHEMA, Vec::new(), batch);
        assert_eq!(outcome.stats, MergeStats { appended: 2, superseded: 0, duplicates: 0 });
        let securities: Vec<&str> = outcome
            .records
            .iter()
            .map(|r| r.get("Security_Type_And_Maturity"))
            .collect();
        assert_eq!(securities, vec!["FNCL 5.5", "FNCI 5.5"]);
    }

    #[test]
    fn token_runs_split_letters_from_digits() {
        assert_eq!(token_runs("30-year umbs 5.5"), vec!["30", "year", "umbs", "5", "5"]);
        assert_eq!(token_runs("fncl5.5"), vec!["fncl", "5", "5"]);
        assert!(token_runs(" - ").is_empty());
    }

    #[test]
    fn near_duplicates_inside_one_batch_keep_the_later_and_rerun_cleanly() {
        let batch = vec![
            toa("2025-06-03", "Outright Bill Purchase", "912797KX4", "2"),
            toa("2025-06-03", "Outright Bill-Purchase", "912797KX4", "2"),
        ];
        let first = engine().merge(&TOA_SCHEMA, Vec::new(), batch.clone());
        assert_eq!(first.records.len(), 1);
        assert_eq!(first.records[0].get("Operation_Type"), "Outright Bill-Purchase");
        assert_eq!(first.stats, MergeStats { appended: 1, superseded: 0, duplicates: 1 });

        let rerun = engine().merge(&TOA_SCHEMA, first.records.clone(), batch);
        assert_eq!(rerun.records, first.records);
        assert_eq!(rerun.stats, MergeStats { appended: 0, superseded: 0, duplicates: 2 });
    }
}
