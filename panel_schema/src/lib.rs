//! Data contracts for the policy panel pipeline.
//!
//! Upstream per-country loaders emit [`CasesRow`], [`RawPolicyRow`] and
//! [`PopulationRow`] tables; `panel_core` normalizes policies into
//! [`PolicyRecord`]s and resolves them onto a dense panel. Nothing in this
//! crate depends on the aggregation engine.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub mod columns;

/// Deepest administrative level carried by any table (adm0 through adm3).
pub const MAX_ADM_LEVEL: usize = 3;

/// Number of name slots in a full scope chain.
pub const ADM_SLOTS: usize = MAX_ADM_LEVEL + 1;

/// Scope wildcard meaning "every unit at this level within the parent".
pub const ALL_SENTINEL: &str = "All";

/// One name slot of a policy scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AdminName {
    All,
    Named(String),
}

impl AdminName {
    /// Parse a raw scope field. Empty strings and any casing of `"All"` are
    /// the wildcard.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(ALL_SENTINEL) {
            AdminName::All
        } else {
            AdminName::Named(trimmed.to_string())
        }
    }

    pub fn from_optional(raw: Option<&str>) -> Self {
        raw.map(Self::parse).unwrap_or(AdminName::All)
    }

    pub fn is_all(&self) -> bool {
        matches!(self, AdminName::All)
    }

    pub fn as_str(&self) -> &str {
        match self {
            AdminName::All => ALL_SENTINEL,
            AdminName::Named(name) => name,
        }
    }

    /// True when this slot admits a unit named `name`.
    pub fn admits(&self, name: &str) -> bool {
        match self {
            AdminName::All => true,
            AdminName::Named(own) => own == name,
        }
    }
}

impl From<String> for AdminName {
    fn from(value: String) -> Self {
        AdminName::parse(&value)
    }
}

impl From<AdminName> for String {
    fn from(value: AdminName) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for AdminName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A concrete administrative unit identified by its full name chain
/// `(adm0, adm1, ..., admL)`.
///
/// Units never contain the `"All"` wildcard; ordering is lexicographic on the
/// chain, so a parent always sorts before its children.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdminUnit {
    names: Vec<String>,
}

impl AdminUnit {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Build a unit from the `adm{N}_name` columns used by every table.
    /// The chain stops at the first missing, empty or wildcard column.
    pub fn from_columns(adm0: &str, lower: [Option<&str>; MAX_ADM_LEVEL]) -> Self {
        let mut names = vec![adm0.trim().to_string()];
        for raw in lower {
            match raw.map(AdminName::parse) {
                Some(AdminName::Named(name)) => names.push(name),
                _ => break,
            }
        }
        Self { names }
    }

    pub fn country(&self) -> &str {
        self.names.first().map(String::as_str).unwrap_or_default()
    }

    /// Level of the deepest name in the chain (0 = country).
    pub fn level(&self) -> usize {
        self.names.len().saturating_sub(1)
    }

    pub fn name_at(&self, level: usize) -> Option<&str> {
        self.names.get(level).map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// The ancestor (or self) at `level`. Returns `None` if the chain is
    /// shallower than `level`.
    pub fn at_level(&self, level: usize) -> Option<AdminUnit> {
        if level >= self.names.len() {
            return None;
        }
        Some(Self {
            names: self.names[..=level].to_vec(),
        })
    }

    pub fn parent(&self) -> Option<AdminUnit> {
        if self.names.len() <= 1 {
            return None;
        }
        self.at_level(self.level() - 1)
    }

    /// True when `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &AdminUnit) -> bool {
        self.names.len() < other.names.len() && other.names.starts_with(&self.names)
    }

    pub fn is_valid(&self) -> bool {
        !self.names.is_empty()
            && self
                .names
                .iter()
                .all(|name| AdminName::parse(name) != AdminName::All)
    }
}

impl fmt::Display for AdminUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.names.join(" / "))
    }
}

/// Scope of a policy row: one [`AdminName`] per administrative level.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyScope {
    names: [AdminName; ADM_SLOTS],
}

impl PolicyScope {
    pub fn new(names: [AdminName; ADM_SLOTS]) -> Self {
        Self { names }
    }

    pub fn from_columns(adm0: &str, lower: [Option<&str>; MAX_ADM_LEVEL]) -> Self {
        let [adm1, adm2, adm3] = lower;
        Self {
            names: [
                AdminName::parse(adm0),
                AdminName::from_optional(adm1),
                AdminName::from_optional(adm2),
                AdminName::from_optional(adm3),
            ],
        }
    }

    pub fn name_at(&self, level: usize) -> &AdminName {
        self.names.get(level).unwrap_or(&AdminName::All)
    }

    pub fn names(&self) -> &[AdminName; ADM_SLOTS] {
        &self.names
    }

    /// Deepest level with a concrete name; 0 when the scope is entirely
    /// wildcards.
    pub fn specificity_level(&self) -> usize {
        (0..ADM_SLOTS)
            .rev()
            .find(|&level| !self.names[level].is_all())
            .unwrap_or(0)
    }

    /// First wildcard level sitting above a concrete name, if any.
    pub fn first_hole(&self) -> Option<usize> {
        let specificity = self.specificity_level();
        (0..specificity).find(|&level| self.names[level].is_all())
    }

    /// The concrete unit this scope targets, i.e. its names down to the
    /// specificity level. `None` for a fully wildcarded scope or one with holes.
    pub fn target_unit(&self) -> Option<AdminUnit> {
        if self.first_hole().is_some() || self.names[0].is_all() {
            return None;
        }
        let specificity = self.specificity_level();
        Some(AdminUnit::new(
            self.names[..=specificity].iter().map(|name| name.as_str().to_string()),
        ))
    }
}

impl Default for AdminName {
    fn default() -> Self {
        AdminName::All
    }
}

impl fmt::Display for PolicyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = self.names.iter().map(AdminName::as_str).collect();
        f.write_str(&parts.join(" / "))
    }
}

/// Optional-flag value as it appears in heterogeneous source tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawFlag {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for RawFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawFlag::Bool(value) => write!(f, "{value}"),
            RawFlag::Int(value) => write!(f, "{value}"),
            RawFlag::Float(value) => write!(f, "{value}"),
            RawFlag::Text(value) => write!(f, "{value:?}"),
        }
    }
}

/// One row of a raw policy list, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPolicyRow {
    pub adm0_name: String,
    #[serde(default)]
    pub adm1_name: Option<String>,
    #[serde(default)]
    pub adm2_name: Option<String>,
    #[serde(default)]
    pub adm3_name: Option<String>,
    pub date_start: NaiveDate,
    #[serde(default)]
    pub date_end: Option<NaiveDate>,
    pub policy: String,
    #[serde(default, alias = "intensity")]
    pub policy_intensity: Option<f64>,
    #[serde(default)]
    pub optional: Option<RawFlag>,
}

impl RawPolicyRow {
    pub fn scope(&self) -> PolicyScope {
        PolicyScope::from_columns(
            &self.adm0_name,
            [
                self.adm1_name.as_deref(),
                self.adm2_name.as_deref(),
                self.adm3_name.as_deref(),
            ],
        )
    }
}

/// Stable identifier assigned to a normalized policy row within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyId(pub u32);

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "policy#{}", self.0)
    }
}

/// A validated, immutable policy row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub id: PolicyId,
    pub scope: PolicyScope,
    pub category: String,
    pub optional: bool,
    pub intensity: f64,
    pub date_start: NaiveDate,
    pub date_end: NaiveDate,
    pub specificity_level: usize,
}

impl PolicyRecord {
    /// Inclusive on both ends.
    pub fn is_active_on(&self, date: NaiveDate) -> bool {
        self.date_start <= date && date <= self.date_end
    }
}

/// One (unit, date) observation of the cases panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CasesRow {
    pub adm0_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adm1_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adm2_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adm3_name: Option<String>,
    pub date: NaiveDate,
    #[serde(default)]
    pub cum_confirmed_cases: Option<f64>,
    #[serde(default)]
    pub cum_deaths: Option<f64>,
    #[serde(default)]
    pub cum_recoveries: Option<f64>,
    #[serde(default)]
    pub active_cases: Option<f64>,
    /// Any further upstream columns, carried through untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl CasesRow {
    pub fn unit(&self) -> AdminUnit {
        AdminUnit::from_columns(
            &self.adm0_name,
            [
                self.adm1_name.as_deref(),
                self.adm2_name.as_deref(),
                self.adm3_name.as_deref(),
            ],
        )
    }

    /// Reported active cases, or `confirmed - deaths - recoveries` when all
    /// three cumulative columns are present.
    pub fn active_cases(&self) -> Option<f64> {
        if self.active_cases.is_some() {
            return self.active_cases;
        }
        match (self.cum_confirmed_cases, self.cum_deaths, self.cum_recoveries) {
            (Some(confirmed), Some(deaths), Some(recoveries)) => {
                Some(confirmed - deaths - recoveries)
            }
            _ => None,
        }
    }
}

/// Canonical population row. Country-specific tables are mapped onto this
/// shape before any lookup happens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopulationRow {
    pub adm0_name: String,
    #[serde(default)]
    pub adm1_name: Option<String>,
    #[serde(default)]
    pub adm2_name: Option<String>,
    #[serde(default)]
    pub adm3_name: Option<String>,
    #[serde(alias = "pop")]
    pub population: f64,
    #[serde(default, alias = "lat")]
    pub latitude: Option<f64>,
    #[serde(default, alias = "lon")]
    pub longitude: Option<f64>,
}

impl PopulationRow {
    pub fn unit(&self) -> AdminUnit {
        AdminUnit::from_columns(
            &self.adm0_name,
            [
                self.adm1_name.as_deref(),
                self.adm2_name.as_deref(),
                self.adm3_name.as_deref(),
            ],
        )
    }
}
