//! Raw policy list → validated [`PolicyRecord`]s.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::NaiveDate;
use panel_schema::{columns, AdminName, PolicyId, PolicyRecord, PolicyScope, RawFlag, RawPolicyRow};
use thiserror::Error;

use crate::config::{OptionalFlagPolicy, RunConfig};

/// Malformed policy rows. Always fatal: the source table must be fixed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidPolicyData {
    #[error("row {row}: unrecognized optional flag {value}")]
    OptionalFlag { row: usize, value: String },
    #[error("row {row}: intensity {intensity} outside (0, 1]")]
    Intensity { row: usize, intensity: f64 },
    #[error("row {row}: date_start {start} is after date_end {end}")]
    DateOrder {
        row: usize,
        start: NaiveDate,
        end: NaiveDate,
    },
    #[error("row {row}: scope {scope} has a wildcard at level {level} above a named level")]
    ScopeHole {
        row: usize,
        scope: PolicyScope,
        level: usize,
    },
    #[error("row {row}: policy belongs to {found}, expected {expected}")]
    ForeignCountry {
        row: usize,
        expected: String,
        found: String,
    },
    #[error("row {row}: empty policy category")]
    EmptyCategory { row: usize },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NormalizeError {
    #[error("invalid policy data: {0}")]
    InvalidPolicyData(#[from] InvalidPolicyData),
    #[error("category {category} occurs {occurrences} times; expected at most once")]
    AmbiguousCategory {
        category: String,
        occurrences: usize,
        /// Scope of the first repeated row.
        first_scope: PolicyScope,
    },
}

/// Output of [`PolicyNormalizer::normalize`].
#[derive(Debug, Clone, Default)]
pub struct NormalizedPolicies {
    records: Vec<PolicyRecord>,
    duplicates_dropped: usize,
    flags_defaulted: usize,
}

impl NormalizedPolicies {
    pub fn records(&self) -> &[PolicyRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn duplicates_dropped(&self) -> usize {
        self.duplicates_dropped
    }

    /// Rows whose unrecognized optional flag was treated as mandatory.
    pub fn flags_defaulted(&self) -> usize {
        self.flags_defaulted
    }

    /// Distinct categories, sorted.
    pub fn categories(&self) -> Vec<&str> {
        let set: BTreeSet<&str> = self.records.iter().map(|r| r.category.as_str()).collect();
        set.into_iter().collect()
    }
}

#[derive(PartialEq, Eq, Hash)]
struct DedupKey {
    scope: PolicyScope,
    category: String,
    optional: bool,
    intensity_bits: u64,
    date_start: NaiveDate,
    date_end: NaiveDate,
}

impl DedupKey {
    fn of(record: &PolicyRecord) -> Self {
        Self {
            scope: record.scope.clone(),
            category: record.category.clone(),
            optional: record.optional,
            intensity_bits: record.intensity.to_bits(),
            date_start: record.date_start,
            date_end: record.date_end,
        }
    }
}

/// Cleans a raw policy list for one country.
#[derive(Debug, Clone, Copy)]
pub struct PolicyNormalizer<'a> {
    country: &'a str,
    config: &'a RunConfig,
}

impl<'a> PolicyNormalizer<'a> {
    pub fn new(country: &'a str, config: &'a RunConfig) -> Self {
        Self { country, config }
    }

    pub fn normalize(&self, rows: &[RawPolicyRow]) -> Result<NormalizedPolicies, NormalizeError> {
        let mut seen = HashSet::new();
        let mut records = Vec::with_capacity(rows.len());
        let mut duplicates_dropped = 0;
        let mut flags_defaulted = 0;

        for (idx, raw) in rows.iter().enumerate() {
            let (record, defaulted) = self.normalize_row(idx, raw)?;
            if defaulted {
                flags_defaulted += 1;
            }
            if !seen.insert(DedupKey::of(&record)) {
                duplicates_dropped += 1;
                continue;
            }
            records.push(record);
        }

        for (idx, record) in records.iter_mut().enumerate() {
            record.id = PolicyId(idx as u32);
        }

        self.check_single_change(&records)?;

        if duplicates_dropped > 0 {
            tracing::debug!(
                target: "policy_panel::normalize",
                country = self.country,
                duplicates_dropped,
                "policies.duplicates_dropped"
            );
        }
        tracing::info!(
            target: "policy_panel::normalize",
            country = self.country,
            rows = records.len(),
            "policies.normalized"
        );

        Ok(NormalizedPolicies {
            records,
            duplicates_dropped,
            flags_defaulted,
        })
    }

    fn normalize_row(
        &self,
        row: usize,
        raw: &RawPolicyRow,
    ) -> Result<(PolicyRecord, bool), InvalidPolicyData> {
        let scope = raw.scope();
        if let AdminName::Named(found) = scope.name_at(0) {
            if found != self.country {
                return Err(InvalidPolicyData::ForeignCountry {
                    row,
                    expected: self.country.to_string(),
                    found: found.clone(),
                });
            }
        }
        if let Some(level) = scope.first_hole() {
            return Err(InvalidPolicyData::ScopeHole { row, scope, level });
        }

        let category = raw.policy.trim();
        if category.is_empty() {
            return Err(InvalidPolicyData::EmptyCategory { row });
        }

        let (mut optional, defaulted) = match parse_optional_flag(raw.optional.as_ref()) {
            Some(flag) => (flag, false),
            None => match self.config.optional_flag_policy() {
                OptionalFlagPolicy::Reject => {
                    return Err(InvalidPolicyData::OptionalFlag {
                        row,
                        value: raw
                            .optional
                            .as_ref()
                            .map(ToString::to_string)
                            .unwrap_or_default(),
                    });
                }
                OptionalFlagPolicy::DefaultMandatory => {
                    tracing::warn!(
                        target: "policy_panel::normalize",
                        row,
                        value = ?raw.optional,
                        "policies.optional_flag_defaulted=mandatory"
                    );
                    (false, true)
                }
            },
        };

        let intensity = raw.policy_intensity.unwrap_or(1.0);
        if !intensity.is_finite() || intensity <= 0.0 || intensity > 1.0 {
            return Err(InvalidPolicyData::Intensity { row, intensity });
        }

        let date_end = raw.date_end.unwrap_or(self.config.open_end_sentinel());
        if raw.date_start > date_end {
            return Err(InvalidPolicyData::DateOrder {
                row,
                start: raw.date_start,
                end: date_end,
            });
        }

        let mut category = category.to_string();
        if optional && self.config.treats_optional_independently(&category) {
            category = columns::optional(&category);
            optional = false;
        }

        let specificity_level = scope.specificity_level();
        Ok((
            PolicyRecord {
                id: PolicyId(0),
                scope,
                category,
                optional,
                intensity,
                date_start: raw.date_start,
                date_end,
                specificity_level,
            },
            defaulted,
        ))
    }

    fn check_single_change(&self, records: &[PolicyRecord]) -> Result<(), NormalizeError> {
        let mut counts: BTreeMap<&str, (usize, &PolicyScope)> = BTreeMap::new();
        for record in records {
            if self.config.is_single_change(&record.category) {
                counts
                    .entry(record.category.as_str())
                    .or_insert((0, &record.scope))
                    .0 += 1;
            }
        }
        match counts.into_iter().find(|(_, (occurrences, _))| *occurrences > 1) {
            Some((category, (occurrences, scope))) => Err(NormalizeError::AmbiguousCategory {
                category: category.to_string(),
                occurrences,
                first_scope: scope.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Map the optional-flag encodings seen across sources to a boolean.
/// Missing values mean mandatory; `None` means the value is unrecognized.
pub fn parse_optional_flag(raw: Option<&RawFlag>) -> Option<bool> {
    match raw {
        None => Some(false),
        Some(RawFlag::Bool(value)) => Some(*value),
        Some(RawFlag::Int(1)) => Some(true),
        Some(RawFlag::Int(0)) => Some(false),
        Some(RawFlag::Int(_)) => None,
        Some(RawFlag::Float(value)) if *value == 1.0 => Some(true),
        Some(RawFlag::Float(value)) if *value == 0.0 => Some(false),
        Some(RawFlag::Float(_)) => None,
        Some(RawFlag::Text(text)) => match text.trim().to_ascii_lowercase().as_str() {
            "" | "n" | "no" | "0" | "false" => Some(false),
            "y" | "yes" | "1" | "true" => Some(true),
            _ => None,
        },
    }
}
