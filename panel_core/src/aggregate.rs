//! Intensity aggregation for one (unit, date, category) cell.
//!
//! The resolved intensity starts from the strongest policy covering the whole
//! unit (the default). Policies scoped to sub-regions then add only their
//! excess over whatever already applies there, weighted by the sub-region's
//! share of the unit population. Nested sub-regions measure their excess
//! against their nearest resolved ancestor so no population is counted twice.
//!
//! Optional policies go through the same computation, minus any population
//! already under a mandatory policy.

use std::collections::BTreeMap;
use std::fmt;

use ahash::AHashMap;
use bitflags::bitflags;
use chrono::NaiveDate;
use panel_schema::{AdminUnit, PolicyRecord, PolicyScope};
use thiserror::Error;

use crate::hashing::PolicySetFingerprint;
use crate::population::{PopulationEntry, PopulationError, PopulationTable};
use crate::scope::{collect_applicable, is_contained_in};

bitflags! {
    /// Diagnostic metadata attached to a resolved cell.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CellFlags: u8 {
        /// An imputed population contributed to a pop-weighted value.
        const IMPUTED_POPULATION = 1 << 0;
        /// Optional rows overlapping mandatory ones were discounted.
        const OPTIONAL_OVERLAP_SUBTRACTED = 1 << 1;
        /// A sub-region excess was measured against a finer ancestor rather
        /// than the unit-wide default.
        const NESTED_OVERRIDE = 1 << 2;
    }
}

impl Default for CellFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Resolved values of one panel cell.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CellResolution {
    pub indicator: f64,
    pub pop_weighted: f64,
    pub optional_indicator: f64,
    pub optional_pop_weighted: f64,
    pub flags: CellFlags,
}

impl CellResolution {
    pub fn imputed_population(&self) -> bool {
        self.flags.contains(CellFlags::IMPUTED_POPULATION)
    }
}

/// Which partition of the cell's rows a total was computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    Mandatory,
    Optional,
    Overlap,
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Branch::Mandatory => "mandatory",
            Branch::Optional => "optional",
            Branch::Overlap => "optional/mandatory overlap",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AggregationError {
    #[error("{branch} pop-weighted intensity {total} exceeds 1 for {unit} on {date} ({category})")]
    IntensityOverflow {
        unit: AdminUnit,
        date: NaiveDate,
        category: String,
        branch: Branch,
        total: f64,
    },
    #[error("optional intensity {total} is negative after removing mandatory overlap for {unit} on {date} ({category})")]
    NegativeOptional {
        unit: AdminUnit,
        date: NaiveDate,
        category: String,
        total: f64,
    },
    #[error("policy scope {scope} reaches below {unit} but names no concrete region")]
    UntargetedScope { unit: AdminUnit, scope: PolicyScope },
    #[error(transparent)]
    Population(#[from] PopulationError),
}

/// Identifies the cell being resolved; carried into error reports.
#[derive(Debug, Clone, Copy)]
pub struct CellKey<'a> {
    pub unit: &'a AdminUnit,
    pub date: NaiveDate,
    pub category: &'a str,
}

#[derive(Debug, Clone, Copy)]
struct ScopedIntensity<'p> {
    scope: &'p PolicyScope,
    level: usize,
    intensity: f64,
}

impl<'p> From<&'p PolicyRecord> for ScopedIntensity<'p> {
    fn from(record: &'p PolicyRecord) -> Self {
        Self {
            scope: &record.scope,
            level: record.specificity_level,
            intensity: record.intensity,
        }
    }
}

fn max_intensity(rows: &[&PolicyRecord]) -> f64 {
    rows.iter().map(|row| row.intensity).fold(0.0, f64::max)
}

fn scoped<'p>(rows: &[&'p PolicyRecord]) -> Vec<ScopedIntensity<'p>> {
    rows.iter().map(|row| ScopedIntensity::from(*row)).collect()
}

/// Resolves cells against a prepared population table.
#[derive(Debug, Clone, Copy)]
pub struct IntensityAggregator<'a> {
    populations: &'a PopulationTable,
    tolerance: f64,
}

impl<'a> IntensityAggregator<'a> {
    pub fn new(populations: &'a PopulationTable, tolerance: f64) -> Self {
        Self {
            populations,
            tolerance,
        }
    }

    /// Resolve `category` for `unit` on `date` from the full policy list.
    pub fn resolve_cell(
        &self,
        unit: &AdminUnit,
        date: NaiveDate,
        category: &str,
        policies: &[PolicyRecord],
    ) -> Result<CellResolution, AggregationError> {
        let applicable = collect_applicable(unit, date, category, policies);
        let key = CellKey {
            unit,
            date,
            category,
        };
        self.resolve_applicable(&key, &applicable)
    }

    /// Resolve a cell whose applicable rows were already collected.
    pub fn resolve_applicable(
        &self,
        key: &CellKey<'_>,
        rows: &[&PolicyRecord],
    ) -> Result<CellResolution, AggregationError> {
        if rows.is_empty() {
            return Ok(CellResolution::default());
        }

        let mut flags = CellFlags::empty();
        let (optional, mandatory): (Vec<&PolicyRecord>, Vec<&PolicyRecord>) =
            rows.iter().copied().partition(|row| row.optional);

        let indicator = max_intensity(&mandatory);
        let pop_weighted =
            self.total_intensity(key, Branch::Mandatory, &scoped(&mandatory), &mut flags)?;

        // Optional rows inside a mandatory scope add nothing: that population
        // is already counted on the mandatory side.
        let retained: Vec<&PolicyRecord> = optional
            .iter()
            .copied()
            .filter(|opt| {
                !mandatory
                    .iter()
                    .any(|mand| is_contained_in(&opt.scope, &mand.scope))
            })
            .collect();
        if retained.len() < optional.len() {
            flags |= CellFlags::OPTIONAL_OVERLAP_SUBTRACTED;
        }

        let mut optional_pop_weighted =
            self.total_intensity(key, Branch::Optional, &scoped(&retained), &mut flags)?;

        // Mandatory rows inside a retained optional scope carve their
        // population out of the optional total at the optional intensity.
        let overlap: Vec<ScopedIntensity<'_>> = mandatory
            .iter()
            .filter_map(|mand| {
                retained
                    .iter()
                    .filter(|opt| is_contained_in(&mand.scope, &opt.scope))
                    .map(|opt| opt.intensity)
                    .reduce(f64::max)
                    .map(|intensity| ScopedIntensity {
                        scope: &mand.scope,
                        level: mand.specificity_level,
                        intensity,
                    })
            })
            .collect();
        if !overlap.is_empty() {
            flags |= CellFlags::OPTIONAL_OVERLAP_SUBTRACTED;
            let overlap_total = self.total_intensity(key, Branch::Overlap, &overlap, &mut flags)?;
            optional_pop_weighted -= overlap_total;
            if optional_pop_weighted < -self.tolerance {
                return Err(AggregationError::NegativeOptional {
                    unit: key.unit.clone(),
                    date: key.date,
                    category: key.category.to_string(),
                    total: optional_pop_weighted,
                });
            }
            optional_pop_weighted = optional_pop_weighted.max(0.0);
        }

        let optional_indicator = if indicator > 0.0 {
            0.0
        } else {
            max_intensity(&retained)
        };

        Ok(CellResolution {
            indicator,
            pop_weighted,
            optional_indicator,
            optional_pop_weighted,
            flags,
        })
    }

    fn population(&self, unit: &AdminUnit) -> Result<&'a PopulationEntry, PopulationError> {
        self.populations
            .get(unit)
            .ok_or_else(|| PopulationError::NotFound { unit: unit.clone() })
    }

    fn total_intensity(
        &self,
        key: &CellKey<'_>,
        branch: Branch,
        rows: &[ScopedIntensity<'_>],
        flags: &mut CellFlags,
    ) -> Result<f64, AggregationError> {
        let unit_level = key.unit.level();
        let default = rows
            .iter()
            .filter(|row| row.level <= unit_level)
            .map(|row| row.intensity)
            .fold(0.0, f64::max);

        // Same-level overlaps within a sub-region take the max, never the sum.
        // Keyed by level first so ancestors resolve before descendants.
        let mut regions: BTreeMap<(usize, AdminUnit), f64> = BTreeMap::new();
        for row in rows.iter().filter(|row| row.level > unit_level) {
            let region = row
                .scope
                .target_unit()
                .ok_or_else(|| AggregationError::UntargetedScope {
                    unit: key.unit.clone(),
                    scope: row.scope.clone(),
                })?;
            let slot = regions.entry((row.level, region)).or_insert(0.0);
            *slot = slot.max(row.intensity);
        }
        if regions.is_empty() {
            return Ok(default);
        }

        let unit_entry = self.population(key.unit)?;
        let mut effective: BTreeMap<AdminUnit, f64> = BTreeMap::new();
        let mut total = default;

        for ((_, region), intensity) in regions {
            let baseline = match nearest_resolved_ancestor(&effective, &region, unit_level) {
                Some(ancestor) => {
                    *flags |= CellFlags::NESTED_OVERRIDE;
                    tracing::debug!(
                        target: "policy_panel::aggregate",
                        unit = %key.unit,
                        region = %region,
                        ancestor,
                        "aggregate.nested_baseline"
                    );
                    ancestor.max(default)
                }
                None => default,
            };

            let excess = (intensity - baseline).max(0.0);
            if excess > 0.0 {
                let region_entry = self.population(&region)?;
                if region_entry.imputed || unit_entry.imputed {
                    *flags |= CellFlags::IMPUTED_POPULATION;
                }
                total += excess * region_entry.population / unit_entry.population;
            }
            effective.insert(region, intensity.max(baseline));
        }

        if total > 1.0 + self.tolerance {
            return Err(AggregationError::IntensityOverflow {
                unit: key.unit.clone(),
                date: key.date,
                category: key.category.to_string(),
                branch,
                total,
            });
        }
        Ok(total)
    }
}

fn nearest_resolved_ancestor(
    effective: &BTreeMap<AdminUnit, f64>,
    region: &AdminUnit,
    unit_level: usize,
) -> Option<f64> {
    let mut cursor = region.parent();
    while let Some(ancestor) = cursor {
        if ancestor.level() <= unit_level {
            return None;
        }
        if let Some(value) = effective.get(&ancestor) {
            return Some(*value);
        }
        cursor = ancestor.parent();
    }
    None
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
}

/// Memoizes cell resolutions by applicable policy set.
///
/// Valid for a single category at a single analysis level within one build:
/// a set containing sub-region rows can only belong to one unit at that level,
/// and a set without them never touches a population.
#[derive(Debug, Default)]
pub struct CellCache {
    entries: AHashMap<PolicySetFingerprint, CellResolution>,
    stats: CacheStats,
}

impl CellCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(
        &mut self,
        aggregator: &IntensityAggregator<'_>,
        key: &CellKey<'_>,
        rows: &[&PolicyRecord],
    ) -> Result<CellResolution, AggregationError> {
        if rows.is_empty() {
            return Ok(CellResolution::default());
        }
        let fingerprint = PolicySetFingerprint::from_ids(rows.iter().map(|row| row.id));
        if let Some(hit) = self.entries.get(&fingerprint) {
            self.stats.hits += 1;
            return Ok(*hit);
        }
        self.stats.misses += 1;
        let resolved = aggregator.resolve_applicable(key, rows)?;
        self.entries.insert(fingerprint, resolved);
        Ok(resolved)
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use panel_schema::{PolicyId, PopulationRow};

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 3, day).expect("valid date")
    }

    fn record(id: u32, names: &[&str], intensity: f64, optional: bool) -> PolicyRecord {
        let lower = [names.get(1).copied(), names.get(2).copied(), names.get(3).copied()];
        let scope = PolicyScope::from_columns(names[0], lower);
        PolicyRecord {
            id: PolicyId(id),
            specificity_level: scope.specificity_level(),
            scope,
            category: "school_closure".into(),
            optional,
            intensity,
            date_start: date(1),
            date_end: date(31),
        }
    }

    fn pop(names: &[&str], population: f64) -> PopulationRow {
        PopulationRow {
            adm0_name: names[0].into(),
            adm1_name: names.get(1).map(|s| s.to_string()),
            adm2_name: names.get(2).map(|s| s.to_string()),
            adm3_name: names.get(3).map(|s| s.to_string()),
            population,
            latitude: None,
            longitude: None,
        }
    }

    fn populations() -> PopulationTable {
        PopulationTable::from_rows([
            pop(&["USA"], 10_000.0),
            pop(&["USA", "State"], 1000.0),
            pop(&["USA", "State", "County"], 100.0),
            pop(&["USA", "State", "Other"], 900.0),
            pop(&["USA", "State", "County", "City"], 50.0),
        ])
        .expect("table builds")
    }

    fn state() -> AdminUnit {
        AdminUnit::new(["USA", "State"])
    }

    fn resolve(table: &PopulationTable, unit: &AdminUnit, rows: &[PolicyRecord]) -> CellResolution {
        IntensityAggregator::new(table, 1e-9)
            .resolve_cell(unit, date(10), "school_closure", rows)
            .expect("cell resolves")
    }

    #[test]
    fn empty_cell_is_all_zero() {
        let table = populations();
        assert_eq!(resolve(&table, &state(), &[]), CellResolution::default());
    }

    #[test]
    fn county_escalation_adds_weighted_excess() {
        let table = populations();
        let rows = [
            record(0, &["USA", "State"], 0.5, false),
            record(1, &["USA", "State", "County"], 1.0, false),
        ];
        let cell = resolve(&table, &state(), &rows);
        assert!((cell.pop_weighted - 0.55).abs() < 1e-12);
        assert_eq!(cell.indicator, 1.0);
    }

    #[test]
    fn weaker_sub_region_policy_adds_nothing() {
        let table = populations();
        let rows = [
            record(0, &["USA", "All"], 0.8, false),
            record(1, &["USA", "State", "County"], 0.4, false),
        ];
        let cell = resolve(&table, &state(), &rows);
        assert!((cell.pop_weighted - 0.8).abs() < 1e-12);
    }

    #[test]
    fn nested_excess_is_measured_against_parent_region() {
        let table = populations();
        let rows = [
            record(0, &["USA", "State", "County"], 0.6, false),
            record(1, &["USA", "State", "County", "City"], 1.0, false),
        ];
        let cell = resolve(&table, &state(), &rows);
        // county: 0.6 * 100/1000, city: (1.0 - 0.6) * 50/1000
        assert!((cell.pop_weighted - 0.08).abs() < 1e-12);
        assert!(cell.flags.contains(CellFlags::NESTED_OVERRIDE));
    }

    #[test]
    fn same_level_overlaps_take_the_max() {
        let table = populations();
        let rows = [
            record(0, &["USA", "State", "County"], 0.3, false),
            record(1, &["USA", "State", "County"], 0.7, false),
        ];
        let cell = resolve(&table, &state(), &rows);
        assert!((cell.pop_weighted - 0.07).abs() < 1e-12);
    }

    #[test]
    fn inconsistent_populations_overflow() {
        let table = PopulationTable::from_rows([
            pop(&["USA", "State"], 100.0),
            pop(&["USA", "State", "County"], 500.0),
        ])
        .expect("table builds");
        let rows = [record(0, &["USA", "State", "County"], 1.0, false)];
        let err = IntensityAggregator::new(&table, 1e-9)
            .resolve_cell(&state(), date(10), "school_closure", &rows)
            .expect_err("share above one");
        assert!(matches!(
            err,
            AggregationError::IntensityOverflow {
                branch: Branch::Mandatory,
                ..
            }
        ));
    }

    #[test]
    fn missing_sub_region_population_is_reported() {
        let table = populations();
        let rows = [record(0, &["USA", "State", "Nowhere"], 1.0, false)];
        let err = IntensityAggregator::new(&table, 1e-9)
            .resolve_cell(&state(), date(10), "school_closure", &rows)
            .expect_err("no population");
        assert!(matches!(err, AggregationError::Population(PopulationError::NotFound { .. })));
    }

    #[test]
    fn optional_inside_mandatory_scope_is_fully_subtracted() {
        let table = populations();
        let rows = [
            record(0, &["USA", "State", "County"], 0.5, false),
            record(1, &["USA", "State", "County"], 0.8, true),
            record(2, &["USA", "State", "Other"], 0.8, true),
        ];
        let cell = resolve(&table, &state(), &rows);
        assert!((cell.pop_weighted - 0.05).abs() < 1e-12);
        // only the optional-only county contributes: 0.8 * 900/1000
        assert!((cell.optional_pop_weighted - 0.72).abs() < 1e-12);
        assert!(cell.flags.contains(CellFlags::OPTIONAL_OVERLAP_SUBTRACTED));
        assert_eq!(cell.indicator, 0.5);
        assert_eq!(cell.optional_indicator, 0.0);
    }

    #[test]
    fn broad_optional_excludes_mandatory_sub_region() {
        let table = populations();
        let rows = [
            record(0, &["USA", "All"], 0.8, true),
            record(1, &["USA", "State", "County"], 1.0, false),
        ];
        let cell = resolve(&table, &state(), &rows);
        assert!((cell.pop_weighted - 0.1).abs() < 1e-12);
        assert!((cell.optional_pop_weighted - 0.72).abs() < 1e-12);
    }

    #[test]
    fn stacked_optionals_subtract_nested_mandatory_city() {
        let table = populations();
        let rows = [
            record(0, &["USA", "All"], 0.2, true),
            record(1, &["USA", "State", "County"], 1.0, true),
            record(2, &["USA", "State", "County", "City"], 1.0, false),
        ];
        let cell = resolve(&table, &state(), &rows);
        assert!((cell.pop_weighted - 0.05).abs() < 1e-12);
        // 0.2 + 0.8 * 100/1000 for the county, minus the city at 1.0 * 50/1000
        assert!((cell.optional_pop_weighted - 0.23).abs() < 1e-12);
        assert!(cell.flags.contains(CellFlags::OPTIONAL_OVERLAP_SUBTRACTED));
        assert_eq!(cell.optional_indicator, 0.0);
    }

    #[test]
    fn overlap_larger_than_optional_total_is_negative() {
        let table = PopulationTable::from_rows([
            pop(&["USA", "State"], 1000.0),
            pop(&["USA", "State", "County"], 100.0),
            pop(&["USA", "State", "County", "City"], 150.0),
        ])
        .expect("table builds");
        let rows = [
            record(0, &["USA", "State", "County"], 0.5, true),
            record(1, &["USA", "State", "County", "City"], 1.0, false),
        ];
        let err = IntensityAggregator::new(&table, 1e-9)
            .resolve_cell(&state(), date(10), "school_closure", &rows)
            .expect_err("city outweighs its county");
        match err {
            AggregationError::NegativeOptional { total, .. } => {
                // 0.5 * 100/1000 - 0.5 * 150/1000
                assert!((total + 0.025).abs() < 1e-12);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn scope_with_hole_is_rejected() {
        let table = populations();
        let scope = PolicyScope::from_columns("USA", [None, Some("County"), None]);
        let rows = [PolicyRecord {
            specificity_level: scope.specificity_level(),
            scope,
            ..record(0, &["USA"], 1.0, false)
        }];
        let err = IntensityAggregator::new(&table, 1e-9)
            .resolve_cell(&state(), date(10), "school_closure", &rows)
            .expect_err("no region to weight");
        assert!(matches!(err, AggregationError::UntargetedScope { .. }));
    }

    #[test]
    fn optional_indicator_only_without_mandatory() {
        let table = populations();
        let rows = [record(0, &["USA", "State"], 0.6, true)];
        let cell = resolve(&table, &state(), &rows);
        assert_eq!(cell.indicator, 0.0);
        assert_eq!(cell.optional_indicator, 0.6);
        assert!((cell.optional_pop_weighted - 0.6).abs() < 1e-12);
    }

    #[test]
    fn imputed_sub_region_sets_flag() {
        let mut table = populations();
        table
            .impute_residuals(&[AdminUnit::new(["USA", "State", "County", "Town"])])
            .expect("imputes");
        let rows = [record(0, &["USA", "State", "County", "Town"], 1.0, false)];
        let cell = resolve(&table, &state(), &rows);
        assert!(cell.imputed_population());
        assert!((cell.pop_weighted - 0.05).abs() < 1e-12);
    }

    #[test]
    fn cache_reuses_identical_sets() {
        let table = populations();
        let aggregator = IntensityAggregator::new(&table, 1e-9);
        let rows = [
            record(0, &["USA", "State"], 0.5, false),
            record(1, &["USA", "State", "County"], 1.0, false),
        ];
        let refs: Vec<&PolicyRecord> = rows.iter().collect();
        let reversed: Vec<&PolicyRecord> = rows.iter().rev().collect();
        let unit = state();
        let mut cache = CellCache::new();
        let first = cache
            .resolve(
                &aggregator,
                &CellKey {
                    unit: &unit,
                    date: date(2),
                    category: "school_closure",
                },
                &refs,
            )
            .expect("resolves");
        let second = cache
            .resolve(
                &aggregator,
                &CellKey {
                    unit: &unit,
                    date: date(3),
                    category: "school_closure",
                },
                &reversed,
            )
            .expect("resolves");
        assert_eq!(first, second);
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1 });
    }
}
