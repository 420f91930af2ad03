//! Dense (unit × date) policy panel and its join onto the cases panel.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use panel_schema::{columns, AdminUnit, CasesRow, PolicyRecord, MAX_ADM_LEVEL};
use rayon::prelude::*;
use thiserror::Error;

use crate::aggregate::{
    AggregationError, CacheStats, CellCache, CellFlags, CellKey, CellResolution,
    IntensityAggregator,
};
use crate::config::RunConfig;
use crate::population::{
    ImputedPopulation, PopulationEntry, PopulationError, PopulationResolver, PopulationTable,
    PreparedPopulations,
};
use crate::scope::{relation, ScopeRelation};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PanelError {
    #[error("cases panel is empty")]
    EmptyCases,
    #[error("analysis level {level} is deeper than adm{max}", max = MAX_ADM_LEVEL)]
    InvalidAnalysisLevel { level: usize },
    #[error("cases row {row} names {unit} at level {found}, expected level {expected}")]
    UnitLevelMismatch {
        row: usize,
        unit: AdminUnit,
        found: usize,
        expected: usize,
    },
    #[error(transparent)]
    Population(#[from] PopulationError),
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
}

/// Cases rows that found no partner in the policy panel. Not fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinIntegrityWarning {
    pub dropped_rows: usize,
    /// Rows repeating an already joined (unit, date) key.
    pub duplicate_rows: usize,
    pub first_dropped: Option<(AdminUnit, NaiveDate)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Indicator,
    Optional,
    PopWeighted,
    OptionalPopWeighted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PanelColumn {
    pub name: String,
    pub category: String,
    pub kind: ColumnKind,
    pub values: Vec<f64>,
}

/// Every unit × every date in the window, rows ordered by unit then date.
#[derive(Debug, Clone)]
pub struct PolicyPanel {
    analysis_level: usize,
    units: Vec<AdminUnit>,
    dates: Vec<NaiveDate>,
    unit_populations: Vec<PopulationEntry>,
    columns: Vec<PanelColumn>,
    policies_enacted: Vec<f64>,
    row_flags: Vec<CellFlags>,
    imputed: Vec<ImputedPopulation>,
    cache: CacheStats,
}

impl PolicyPanel {
    pub fn analysis_level(&self) -> usize {
        self.analysis_level
    }

    pub fn units(&self) -> &[AdminUnit] {
        &self.units
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn len(&self) -> usize {
        self.units.len() * self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn columns(&self) -> &[PanelColumn] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|column| column.name.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&PanelColumn> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn policies_enacted(&self) -> &[f64] {
        &self.policies_enacted
    }

    pub fn row_flags(&self, row: usize) -> CellFlags {
        self.row_flags.get(row).copied().unwrap_or_default()
    }

    /// Populations filled in by residual imputation during this build.
    pub fn imputed_populations(&self) -> &[ImputedPopulation] {
        &self.imputed
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache
    }

    pub fn row_index(&self, unit: &AdminUnit, date: NaiveDate) -> Option<usize> {
        let unit_idx = self.units.binary_search(unit).ok()?;
        let first = *self.dates.first()?;
        let offset = usize::try_from((date - first).num_days()).ok()?;
        (offset < self.dates.len()).then(|| unit_idx * self.dates.len() + offset)
    }

    pub fn value(&self, column: &str, unit: &AdminUnit, date: NaiveDate) -> Option<f64> {
        let row = self.row_index(unit, date)?;
        self.column(column).map(|column| column.values[row])
    }

    /// Inner join of `cases` onto this panel by (unit, date).
    ///
    /// Output rows are sorted by unit then date. Cases rows outside the panel
    /// window, and repeats of an already joined key, are dropped and reported.
    pub fn join(&self, cases: &[CasesRow]) -> (Vec<MergedRow>, Option<JoinIntegrityWarning>) {
        let mut keyed: Vec<(AdminUnit, &CasesRow)> =
            cases.iter().map(|row| (row.unit(), row)).collect();
        keyed.sort_by(|(a_unit, a_row), (b_unit, b_row)| {
            a_unit.cmp(b_unit).then(a_row.date.cmp(&b_row.date))
        });

        let mut rows = Vec::with_capacity(keyed.len());
        let mut joined = BTreeSet::new();
        let mut dropped_rows = 0;
        let mut duplicate_rows = 0;
        let mut first_dropped = None;

        for (unit, cases_row) in keyed {
            let Some(row) = self.row_index(&unit, cases_row.date) else {
                dropped_rows += 1;
                first_dropped.get_or_insert((unit, cases_row.date));
                continue;
            };
            if !joined.insert(row) {
                dropped_rows += 1;
                duplicate_rows += 1;
                first_dropped.get_or_insert((unit, cases_row.date));
                continue;
            }

            let entry = self.unit_populations[row / self.dates.len()];
            rows.push(MergedRow {
                unit,
                cases: cases_row.clone(),
                population: entry.population,
                latitude: entry.latitude,
                longitude: entry.longitude,
                imputed_population: entry.imputed
                    || self.row_flags[row].contains(CellFlags::IMPUTED_POPULATION),
                policies: self.columns.iter().map(|column| column.values[row]).collect(),
                policies_enacted: self.policies_enacted[row],
            });
        }

        let warning = (dropped_rows > 0).then(|| JoinIntegrityWarning {
            dropped_rows,
            duplicate_rows,
            first_dropped,
        });
        (rows, warning)
    }
}

/// One joined (unit, date) row.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedRow {
    pub unit: AdminUnit,
    pub cases: CasesRow,
    pub population: f64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub imputed_population: bool,
    /// Aligned with [`MergedPanel::policy_columns`].
    pub policies: Vec<f64>,
    pub policies_enacted: f64,
}

/// Cases panel joined with the resolved policy panel.
#[derive(Debug, Clone)]
pub struct MergedPanel {
    pub country: String,
    pub analysis_level: usize,
    pub policy_columns: Vec<String>,
    pub rows: Vec<MergedRow>,
    pub join_warning: Option<JoinIntegrityWarning>,
    pub policy_panel: PolicyPanel,
}

impl MergedPanel {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn policy_value(&self, row: usize, column: &str) -> Option<f64> {
        let idx = self.policy_columns.iter().position(|name| name == column)?;
        self.rows.get(row).map(|row| row.policies[idx])
    }

    /// Extra upstream columns present on any cases row, sorted.
    pub fn extra_columns(&self) -> Vec<&str> {
        let names: BTreeSet<&str> = self
            .rows
            .iter()
            .flat_map(|row| row.cases.extra.keys().map(String::as_str))
            .collect();
        names.into_iter().collect()
    }
}

struct CategoryCells {
    category: String,
    cells: Vec<CellResolution>,
    cache: CacheStats,
}

/// Drives the aggregator over every cell of a panel.
#[derive(Debug, Clone, Copy)]
pub struct PanelBuilder<'a> {
    config: &'a RunConfig,
    populations: &'a PopulationTable,
    imputed: &'a [ImputedPopulation],
}

impl<'a> PanelBuilder<'a> {
    pub fn new(config: &'a RunConfig, populations: &'a PopulationTable) -> Self {
        Self {
            config,
            populations,
            imputed: &[],
        }
    }

    /// Build over a table already imputed for every panel of a country, so
    /// all levels see the same estimated populations.
    pub fn with_prepared(config: &'a RunConfig, prepared: &'a PreparedPopulations) -> Self {
        Self {
            config,
            populations: &prepared.table,
            imputed: &prepared.imputed,
        }
    }

    /// Resolve `policies` over the cases panel's units and date span and join
    /// the result back onto `cases`.
    pub fn build_panel(
        &self,
        cases: &[CasesRow],
        policies: &[PolicyRecord],
        analysis_level: usize,
    ) -> Result<MergedPanel, PanelError> {
        if analysis_level > MAX_ADM_LEVEL {
            return Err(PanelError::InvalidAnalysisLevel {
                level: analysis_level,
            });
        }
        if cases.is_empty() {
            return Err(PanelError::EmptyCases);
        }

        let mut units = BTreeSet::new();
        let mut first = cases[0].date;
        let mut last = cases[0].date;
        for (row, cases_row) in cases.iter().enumerate() {
            let unit = cases_row.unit();
            if unit.level() != analysis_level {
                return Err(PanelError::UnitLevelMismatch {
                    row,
                    found: unit.level(),
                    unit,
                    expected: analysis_level,
                });
            }
            units.insert(unit);
            first = first.min(cases_row.date);
            last = last.max(cases_row.date);
        }
        let units: Vec<AdminUnit> = units.into_iter().collect();
        let country = units[0].country().to_string();

        let policy_panel = self.build_policy_panel(&units, first, last, policies)?;
        let (rows, join_warning) = policy_panel.join(cases);
        if let Some(warning) = &join_warning {
            tracing::warn!(
                target: "policy_panel::panel",
                country = %country,
                level = analysis_level,
                dropped = warning.dropped_rows,
                duplicates = warning.duplicate_rows,
                "panel.join_dropped_rows"
            );
        }

        Ok(MergedPanel {
            country,
            analysis_level,
            policy_columns: policy_panel
                .column_names()
                .into_iter()
                .map(str::to_string)
                .collect(),
            rows,
            join_warning,
            policy_panel,
        })
    }

    /// Dense panel over `units` (all at one level) and every date from
    /// `first` to `last` inclusive.
    pub fn build_policy_panel(
        &self,
        units: &[AdminUnit],
        first: NaiveDate,
        last: NaiveDate,
        policies: &[PolicyRecord],
    ) -> Result<PolicyPanel, PanelError> {
        let units: Vec<AdminUnit> = units
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let analysis_level = units.first().map(AdminUnit::level).unwrap_or_default();
        if let Some(unit) = units.iter().find(|unit| unit.level() != analysis_level) {
            return Err(PanelError::UnitLevelMismatch {
                row: 0,
                unit: unit.clone(),
                found: unit.level(),
                expected: analysis_level,
            });
        }
        let dates: Vec<NaiveDate> = first.iter_days().take_while(|date| *date <= last).collect();

        let resolver = PopulationResolver::new(self.populations, self.config.population_mode());
        let needed = weighting_units(&units, policies);
        let mut prepared = resolver.prepare(needed.iter().cloned())?;
        let mut imputed: Vec<ImputedPopulation> = self
            .imputed
            .iter()
            .filter(|record| needed.contains(&record.unit))
            .cloned()
            .collect();
        imputed.append(&mut prepared.imputed);
        let unit_populations = units
            .iter()
            .map(|unit| {
                prepared
                    .table
                    .get(unit)
                    .copied()
                    .ok_or_else(|| PopulationError::NotFound { unit: unit.clone() })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let categories: Vec<&str> = policies
            .iter()
            .map(|policy| policy.category.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let aggregator =
            IntensityAggregator::new(&prepared.table, self.config.intensity_tolerance());

        let resolved: Vec<CategoryCells> = if self.config.parallel() {
            categories
                .par_iter()
                .map(|category| resolve_category(&aggregator, category, &units, &dates, policies))
                .collect::<Result<_, _>>()?
        } else {
            categories
                .iter()
                .map(|category| resolve_category(&aggregator, category, &units, &dates, policies))
                .collect::<Result<_, _>>()?
        };

        let rows = units.len() * dates.len();
        let mut panel_columns = Vec::new();
        let mut policies_enacted = vec![0.0; rows];
        let mut row_flags = vec![CellFlags::empty(); rows];
        let mut cache = CacheStats::default();

        for CategoryCells {
            category,
            cells,
            cache: stats,
        } in resolved
        {
            tracing::debug!(
                target: "policy_panel::panel",
                category = %category,
                cache_hits = stats.hits,
                cache_misses = stats.misses,
                "panel.category_resolved"
            );
            cache.hits += stats.hits;
            cache.misses += stats.misses;

            for ((enacted, flags), cell) in policies_enacted
                .iter_mut()
                .zip(row_flags.iter_mut())
                .zip(&cells)
            {
                *enacted += cell.indicator;
                *flags |= cell.flags;
            }

            let use_optional = cells
                .iter()
                .any(|cell| cell.optional_indicator > 0.0 || cell.optional_pop_weighted > 0.0);
            let popwt = !self.config.excludes_popwt(&category);

            let mut push = |name: String, kind: ColumnKind, pick: fn(&CellResolution) -> f64| {
                panel_columns.push(PanelColumn {
                    name,
                    category: category.clone(),
                    kind,
                    values: cells.iter().map(pick).collect(),
                });
            };
            push(category.clone(), ColumnKind::Indicator, |cell| cell.indicator);
            if use_optional {
                push(columns::optional(&category), ColumnKind::Optional, |cell| {
                    cell.optional_indicator
                });
            }
            if popwt {
                push(columns::popwt(&category), ColumnKind::PopWeighted, |cell| {
                    cell.pop_weighted
                });
                if use_optional {
                    push(
                        columns::optional_popwt(&category),
                        ColumnKind::OptionalPopWeighted,
                        |cell| cell.optional_pop_weighted,
                    );
                }
            }
        }

        tracing::info!(
            target: "policy_panel::panel",
            level = analysis_level,
            units = units.len(),
            dates = dates.len(),
            columns = panel_columns.len(),
            imputed = imputed.len(),
            "panel.built"
        );

        Ok(PolicyPanel {
            analysis_level,
            units,
            dates,
            unit_populations,
            columns: panel_columns,
            policies_enacted,
            row_flags,
            imputed,
            cache,
        })
    }
}

/// Units whose population a build may read: the analysis units themselves
/// plus every sub-region a policy row targets beneath one of them.
pub(crate) fn weighting_units(
    units: &[AdminUnit],
    policies: &[PolicyRecord],
) -> BTreeSet<AdminUnit> {
    let mut needed: BTreeSet<AdminUnit> = units.iter().cloned().collect();
    let Some(level) = units.first().map(AdminUnit::level) else {
        return needed;
    };
    let analysis: BTreeSet<&AdminUnit> = units.iter().collect();
    for policy in policies.iter().filter(|policy| policy.specificity_level > level) {
        let Some(target) = policy.scope.target_unit() else {
            continue;
        };
        let under_analysis_unit = target
            .at_level(level)
            .is_some_and(|ancestor| analysis.contains(&ancestor));
        if under_analysis_unit {
            needed.insert(target);
        }
    }
    needed
}

fn resolve_category(
    aggregator: &IntensityAggregator<'_>,
    category: &str,
    units: &[AdminUnit],
    dates: &[NaiveDate],
    policies: &[PolicyRecord],
) -> Result<CategoryCells, AggregationError> {
    let rows: Vec<&PolicyRecord> = policies
        .iter()
        .filter(|policy| policy.category == category)
        .collect();
    let mut cache = CellCache::new();
    let mut cells = Vec::with_capacity(units.len() * dates.len());

    for unit in units {
        // Rows reaching a unit are fixed across dates; only activity varies.
        let candidates: Vec<&PolicyRecord> = rows
            .iter()
            .copied()
            .filter(|policy| relation(unit, &policy.scope) != ScopeRelation::Disjoint)
            .collect();
        for &date in dates {
            let active: Vec<&PolicyRecord> = candidates
                .iter()
                .copied()
                .filter(|policy| policy.is_active_on(date))
                .collect();
            let key = CellKey {
                unit,
                date,
                category,
            };
            cells.push(cache.resolve(aggregator, &key, &active)?);
        }
    }

    Ok(CategoryCells {
        category: category.to_string(),
        cells,
        cache: cache.stats(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PopulationMode;
    use panel_schema::{PolicyId, PolicyScope, PopulationRow};

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 3, day).expect("valid date")
    }

    fn pop(names: &[&str], population: f64) -> PopulationRow {
        PopulationRow {
            adm0_name: names[0].into(),
            adm1_name: names.get(1).map(|s| s.to_string()),
            adm2_name: names.get(2).map(|s| s.to_string()),
            adm3_name: None,
            population,
            latitude: Some(1.5),
            longitude: Some(-2.5),
        }
    }

    fn cases(state: &str, day: u32) -> CasesRow {
        CasesRow {
            adm0_name: "USA".into(),
            adm1_name: Some(state.into()),
            adm2_name: None,
            adm3_name: None,
            date: date(day),
            cum_confirmed_cases: Some(f64::from(day)),
            cum_deaths: None,
            cum_recoveries: None,
            active_cases: None,
            extra: Default::default(),
        }
    }

    fn policy(
        names: [Option<&str>; 3],
        category: &str,
        optional: bool,
        start: u32,
        end: u32,
    ) -> PolicyRecord {
        let scope = PolicyScope::from_columns("USA", names);
        PolicyRecord {
            id: PolicyId(0),
            specificity_level: scope.specificity_level(),
            scope,
            category: category.into(),
            optional,
            intensity: 1.0,
            date_start: date(start),
            date_end: date(end),
        }
    }

    fn populations() -> PopulationTable {
        PopulationTable::from_rows([
            pop(&["USA"], 400.0),
            pop(&["USA", "Alpha"], 100.0),
            pop(&["USA", "Beta"], 200.0),
            pop(&["USA", "Alpha", "North"], 25.0),
        ])
        .expect("table builds")
    }

    fn policies() -> Vec<PolicyRecord> {
        let mut rows = vec![
            policy([None, None, None], "school_closure", false, 2, 31),
            policy([Some("Alpha"), None, None], "event_cancel", true, 1, 31),
            policy([Some("Beta"), None, None], "testing_regime", false, 3, 31),
            policy([Some("Alpha"), Some("North"), None], "home_isolation", false, 1, 2),
        ];
        for (idx, row) in rows.iter_mut().enumerate() {
            row.id = PolicyId(idx as u32);
        }
        rows
    }

    #[test]
    fn column_layout_follows_category_order() {
        let config = RunConfig::default();
        let table = populations();
        let panel = PanelBuilder::new(&config, &table)
            .build_panel(
                &[cases("Alpha", 1), cases("Beta", 3)],
                &policies(),
                1,
            )
            .expect("panel builds");
        insta::assert_snapshot!(
            panel.policy_columns.join(","),
            @"event_cancel,event_cancel_opt,event_cancel_popwt,event_cancel_opt_popwt,home_isolation,home_isolation_popwt,school_closure,school_closure_popwt,testing_regime"
        );
    }

    #[test]
    fn skeleton_is_dense_and_join_keeps_cases_rows() {
        let config = RunConfig::default().with_parallel(false);
        let table = populations();
        let panel = PanelBuilder::new(&config, &table)
            .build_panel(
                &[cases("Beta", 3), cases("Alpha", 1), cases("Alpha", 3)],
                &policies(),
                1,
            )
            .expect("panel builds");

        assert_eq!(panel.policy_panel.len(), 6);
        assert_eq!(panel.len(), 3);
        assert!(panel.join_warning.is_none());
        assert_eq!(panel.rows[0].unit, AdminUnit::new(["USA", "Alpha"]));
        assert_eq!(panel.rows[0].cases.date, date(1));
        assert_eq!(panel.rows[2].unit, AdminUnit::new(["USA", "Beta"]));

        // Alpha on 3/1: optional event cancel, North isolation at 25/100.
        assert_eq!(panel.policy_value(0, "school_closure"), Some(0.0));
        assert_eq!(panel.policy_value(0, "event_cancel"), Some(0.0));
        assert_eq!(panel.policy_value(0, "event_cancel_opt"), Some(1.0));
        assert_eq!(panel.policy_value(0, "home_isolation"), Some(1.0));
        assert_eq!(panel.policy_value(0, "home_isolation_popwt"), Some(0.25));
        assert_eq!(panel.rows[0].policies_enacted, 1.0);
        assert_eq!(panel.rows[0].population, 100.0);
        assert_eq!(panel.rows[0].latitude, Some(1.5));

        // Beta on 3/3: school closure and testing.
        assert_eq!(panel.policy_value(2, "testing_regime"), Some(1.0));
        assert_eq!(panel.rows[2].policies_enacted, 2.0);
    }

    #[test]
    fn join_reports_duplicates_and_out_of_window_rows() {
        let config = RunConfig::default();
        let table = populations();
        let builder = PanelBuilder::new(&config, &table);
        let units = [AdminUnit::new(["USA", "Alpha"])];
        let panel = builder
            .build_policy_panel(&units, date(1), date(2), &policies())
            .expect("panel builds");

        let (rows, warning) = panel.join(&[cases("Alpha", 1), cases("Alpha", 1), cases("Alpha", 9)]);
        assert_eq!(rows.len(), 1);
        let warning = warning.expect("rows dropped");
        assert_eq!(warning.dropped_rows, 2);
        assert_eq!(warning.duplicate_rows, 1);
    }

    #[test]
    fn rejects_wrong_depth_and_empty_cases() {
        let config = RunConfig::default();
        let table = populations();
        let builder = PanelBuilder::new(&config, &table);
        assert_eq!(
            builder.build_panel(&[], &policies(), 1).expect_err("empty"),
            PanelError::EmptyCases
        );
        let err = builder
            .build_panel(&[cases("Alpha", 1)], &policies(), 2)
            .expect_err("depth mismatch");
        assert!(matches!(
            err,
            PanelError::UnitLevelMismatch {
                found: 1,
                expected: 2,
                ..
            }
        ));
        assert!(matches!(
            builder.build_panel(&[cases("Alpha", 1)], &policies(), 4),
            Err(PanelError::InvalidAnalysisLevel { level: 4 })
        ));
    }

    #[test]
    fn lenient_mode_marks_imputed_rows() {
        let table = populations();
        let strict = RunConfig::default();
        let err = PanelBuilder::new(&strict, &table)
            .build_panel(&[cases("Gamma", 1)], &policies(), 1)
            .expect_err("no population for Gamma");
        assert!(matches!(
            err,
            PanelError::Population(PopulationError::NotFound { .. })
        ));

        let lenient = RunConfig::default().with_population_mode(PopulationMode::Lenient);
        let panel = PanelBuilder::new(&lenient, &table)
            .build_panel(&[cases("Gamma", 1)], &policies(), 1)
            .expect("imputed");
        assert!(panel.rows[0].imputed_population);
        assert!(panel.rows[0].latitude.is_none());
        assert_eq!(panel.rows[0].population, 100.0);
        assert_eq!(panel.policy_panel.imputed_populations().len(), 1);
    }
}
