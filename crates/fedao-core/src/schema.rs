//! Static target schemas and default header alias tables for both categories.

use serde::{Deserialize, Serialize};

use crate::OperationCategory;

pub const CURRENCY_SYMBOLS: &[&str] = &["$", "€", "£", "¥"];
pub const MULTIPLIERS: &[&str] = &["million", "billion"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    IsoDate,
    CompactDate,
    Float,
    Enum(&'static [&'static str]),
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "string",
            Self::IsoDate => "iso-date",
            Self::CompactDate => "compact-date",
            Self::Float => "float",
            Self::Enum(_) => "enum",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationRule {
    NonEmpty,
    ValidIsoDate,
    ValidCompactDate,
    NumericOnly,
    ValidCusipFormat,
}

impl ValidationRule {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NonEmpty => "non_empty",
            Self::ValidIsoDate => "valid_iso_date",
            Self::ValidCompactDate => "valid_compact_date",
            Self::NumericOnly => "numeric_only",
            Self::ValidCusipFormat => "valid_cusip_format",
        }
    }
}

/// Whether a field is filled from a raw column or computed by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSource {
    Mapped,
    Derived,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    pub name: &'static str,
    pub field_type: FieldType,
    pub required: bool,
    pub rules: &'static [ValidationRule],
    pub source: FieldSource,
    pub description: &'static str,
}

/// A free-text amount column decomposed into three schema fields. The size field is
/// the mapping target; currency and multiplier are derived from it.
#[derive(Debug, Clone, Copy)]
pub struct AmountGroup {
    pub size: &'static str,
    pub currency: &'static str,
    pub multiplier: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub enum SplitRule {
    /// One record per identifier sub-entry of `identifier_field`. A sub-entry with no
    /// amount of its own takes the matching line of `amount_field`, then
    /// `fallback_amount_field`.
    SubEntries {
        identifier_field: &'static str,
        amount_field: &'static str,
        fallback_amount_field: Option<&'static str>,
    },
    /// A `D1 - D2` range in `date_field` collapses to D2; the raw range is kept in
    /// `range_field`.
    DateRangeEnd {
        date_field: &'static str,
        range_field: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMatch {
    /// Normalized string equality only.
    Exact,
    /// String similarity is allowed for near-duplicate detection.
    Fuzzy,
}

#[derive(Debug, Clone, Copy)]
pub struct KeyField {
    pub name: &'static str,
    pub matching: KeyMatch,
}

#[derive(Debug)]
pub struct TargetSchema {
    pub category: OperationCategory,
    pub master_file_name: &'static str,
    pub fields: &'static [FieldDef],
    pub amount_groups: &'static [AmountGroup],
    pub split_rule: SplitRule,
    pub dedup_key: &'static [KeyField],
    pub source_date_field: &'static str,
    pub identifying_field: &'static str,
}

impl TargetSchema {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        self.fields.iter().map(|f| f.name).collect()
    }

    pub fn mapped_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.source == FieldSource::Mapped)
    }

    pub fn required_mapped_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.mapped_fields().filter(|f| f.required)
    }

    pub fn date_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields
            .iter()
            .filter(|f| f.field_type == FieldType::IsoDate)
    }

    pub fn amount_group_for(&self, size_field: &str) -> Option<&AmountGroup> {
        self.amount_groups.iter().find(|g| g.size == size_field)
    }
}

const DATE_RULES: &[ValidationRule] = &[ValidationRule::NonEmpty, ValidationRule::ValidIsoDate];
const OPTIONAL_DATE_RULES: &[ValidationRule] = &[ValidationRule::ValidIsoDate];
const REQUIRED_TEXT_RULES: &[ValidationRule] = &[ValidationRule::NonEmpty];
const SOURCE_DATE_RULES: &[ValidationRule] =
    &[ValidationRule::NonEmpty, ValidationRule::ValidCompactDate];
const NUMERIC_RULES: &[ValidationRule] = &[ValidationRule::NumericOnly];
const NO_RULES: &[ValidationRule] = &[];

const fn mapped(
    name: &'static str,
    field_type: FieldType,
    required: bool,
    rules: &'static [ValidationRule],
    description: &'static str,
) -> FieldDef {
    FieldDef {
        name,
        field_type,
        required,
        rules,
        source: FieldSource::Mapped,
        description,
    }
}

const fn derived(
    name: &'static str,
    field_type: FieldType,
    required: bool,
    rules: &'static [ValidationRule],
    description: &'static str,
) -> FieldDef {
    FieldDef {
        name,
        field_type,
        required,
        rules,
        source: FieldSource::Derived,
        description,
    }
}

const CURRENCY: FieldType = FieldType::Enum(CURRENCY_SYMBOLS);
const MULTIPLIER: FieldType = FieldType::Enum(MULTIPLIERS);

pub static TOA_SCHEMA: TargetSchema = TargetSchema {
    category: OperationCategory::Toa,
    master_file_name: "FEDAO_TOA_MASTER.csv",
    fields: &[
        mapped("Operation_Date", FieldType::IsoDate, true, DATE_RULES, "Date the operation is conducted"),
        mapped("Operation_Time", FieldType::Text, false, NO_RULES, "Operation window, as announced"),
        mapped("Operation_Type", FieldType::Text, true, REQUIRED_TEXT_RULES, "Purchase / sale type"),
        mapped(
            "Security_Identifier",
            FieldType::Text,
            false,
            &[ValidationRule::ValidCusipFormat],
            "CUSIP or TBA ticker/coupon of one security",
        ),
        derived("Security_Maximum_Currency", CURRENCY, false, NO_RULES, "Currency of the per-security maximum"),
        mapped("Security_Maximum_Size", FieldType::Float, false, NUMERIC_RULES, "Per-security purchase amount"),
        derived("Security_Maximum_Multiplier", MULTIPLIER, false, NO_RULES, "Multiplier of the per-security maximum"),
        derived("Operation_Maximum_Currency", CURRENCY, false, NO_RULES, "Currency of the operation maximum"),
        mapped("Operation_Maximum_Size", FieldType::Float, false, NUMERIC_RULES, "Operation-wide maximum"),
        derived("Operation_Maximum_Multiplier", MULTIPLIER, false, NO_RULES, "Multiplier of the operation maximum"),
        derived("Source_Date", FieldType::CompactDate, true, SOURCE_DATE_RULES, "Latest record date as YYYYMMDD"),
    ],
    amount_groups: &[
        AmountGroup {
            size: "Security_Maximum_Size",
            currency: "Security_Maximum_Currency",
            multiplier: "Security_Maximum_Multiplier",
        },
        AmountGroup {
            size: "Operation_Maximum_Size",
            currency: "Operation_Maximum_Currency",
            multiplier: "Operation_Maximum_Multiplier",
        },
    ],
    split_rule: SplitRule::SubEntries {
        identifier_field: "Security_Identifier",
        amount_field: "Security_Maximum_Size",
        fallback_amount_field: Some("Operation_Maximum_Size"),
    },
    dedup_key: &[
        KeyField { name: "Operation_Date", matching: KeyMatch::Exact },
        KeyField { name: "Operation_Type", matching: KeyMatch::Fuzzy },
        KeyField { name: "Security_Identifier", matching: KeyMatch::Exact },
        KeyField { name: "Security_Maximum_Size", matching: KeyMatch::Exact },
    ],
    source_date_field: "Source_Date",
    identifying_field: "Operation_Date",
};

pub static MOA_SCHEMA: TargetSchema = TargetSchema {
    category: OperationCategory::Moa,
    master_file_name: "FEDAO_MOA_MASTER.csv",
    fields: &[
        mapped("Operation_Date", FieldType::IsoDate, true, DATE_RULES, "Operation date (range end when a range is announced)"),
        derived("Operation_Date_Range", FieldType::Text, false, NO_RULES, "Raw announced range, when one was collapsed"),
        mapped("Operation_Time", FieldType::Text, true, REQUIRED_TEXT_RULES, "Operation window (ET)"),
        mapped("Settlement_Date", FieldType::IsoDate, false, OPTIONAL_DATE_RULES, "Settlement date"),
        mapped("Operation_Type", FieldType::Text, true, REQUIRED_TEXT_RULES, "Purchase / sale type"),
        mapped("Security_Type_And_Maturity", FieldType::Text, true, REQUIRED_TEXT_RULES, "Security type and maturity bucket"),
        mapped("Maturity_Range", FieldType::Text, false, NO_RULES, "Announced maturity range"),
        derived("Maximum_Operation_Currency", CURRENCY, false, NO_RULES, "Currency of the operation maximum"),
        mapped("Maximum_Operation_Size", FieldType::Float, false, NUMERIC_RULES, "Operation maximum"),
        derived("Maximum_Operation_Multiplier", MULTIPLIER, false, NO_RULES, "Multiplier of the operation maximum"),
        derived("Source_Date", FieldType::CompactDate, true, SOURCE_DATE_RULES, "Latest record date as YYYYMMDD"),
    ],
    amount_groups: &[AmountGroup {
        size: "Maximum_Operation_Size",
        currency: "Maximum_Operation_Currency",
        multiplier: "Maximum_Operation_Multiplier",
    }],
    split_rule: SplitRule::DateRangeEnd {
        date_field: "Operation_Date",
        range_field: "Operation_Date_Range",
    },
    dedup_key: &[
        KeyField { name: "Operation_Date", matching: KeyMatch::Exact },
        KeyField { name: "Operation_Type", matching: KeyMatch::Fuzzy },
        KeyField { name: "Security_Type_And_Maturity", matching: KeyMatch::Fuzzy },
        KeyField { name: "Operation_Time", matching: KeyMatch::Fuzzy },
    ],
    source_date_field: "Source_Date",
    identifying_field: "Operation_Date",
};

/// Target field -> known header aliases, in priority order. Matching happens on
/// normalized headers (see `normalize_header` in the pipeline mapper).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AliasTable {
    entries: Vec<(String, Vec<String>)>,
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: &str, aliases: &[&str]) -> Self {
        self.extend(field, aliases.iter().map(|a| a.to_string()));
        self
    }

    /// Appends aliases for `field`, keeping earlier aliases ahead of later ones.
    pub fn extend(&mut self, field: &str, aliases: impl IntoIterator<Item = String>) {
        let idx = match self.entries.iter().position(|(f, _)| f == field) {
            Some(idx) => idx,
            None => {
                self.entries.push((field.to_string(), Vec::new()));
                self.entries.len() - 1
            }
        };
        let list = &mut self.entries[idx].1;
        for alias in aliases {
            if !list.iter().any(|a| a.eq_ignore_ascii_case(&alias)) {
                list.push(alias);
            }
        }
    }

    pub fn aliases_for(&self, field: &str) -> &[String] {
        self.entries
            .iter()
            .find(|(f, _)| f == field)
            .map(|(_, a)| a.as_slice())
            .unwrap_or_default()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(f, _)| f.as_str())
    }
}

pub fn default_aliases(category: OperationCategory) -> AliasTable {
    match category {
        OperationCategory::Toa => AliasTable::new()
            .with("Operation_Date", &["OPERATION DATE", "DATE"])
            .with("Operation_Time", &["OPERATION TIME ET", "OPERATION TIME", "TIME"])
            .with("Operation_Type", &["OPERATION TYPE", "TYPE"])
            .with(
                "Security_Identifier",
                &[
                    "SECURITIES INCLUDED CUSP",
                    "SECURITIES INCLUDED CUSIP",
                    "SECURITIES INCLUDED",
                    "CUSIP",
                    "SECURITIES",
                    "SECURITY",
                ],
            )
            .with(
                "Security_Maximum_Size",
                &[
                    "SECURITY MAXIMUMS MILLIONS",
                    "SECURITY MAXIMUMS",
                    "SECURITY MAXIMUM",
                    "PURCHASE AMOUNT",
                    "AMOUNT",
                ],
            )
            .with(
                "Operation_Maximum_Size",
                &["OPERATION MAXIMUM", "MAXIMUM OPERATION SIZE", "MAXIMUM"],
            ),
        OperationCategory::Moa => AliasTable::new()
            .with("Operation_Date", &["OPERATION DATE", "DATE"])
            .with("Operation_Time", &["OPERATION TIME ET", "OPERATION TIME", "TIME"])
            .with("Settlement_Date", &["SETTLEMENT DATE", "SETTLEMENT"])
            .with("Operation_Type", &["OPERATION TYPE", "TYPE"])
            .with(
                "Security_Type_And_Maturity",
                &[
                    "SECURITY TYPE AND MATURITY",
                    "SECURITY TYPE",
                    "SECURITIES INCLUDED",
                    "SECURITY",
                ],
            )
            .with("Maturity_Range", &["MATURITY RANGE"])
            .with(
                "Maximum_Operation_Size",
                &["MAXIMUM OPERATION SIZE", "OPERATION MAXIMUM", "MAXIMUM"],
            ),
    }
}
