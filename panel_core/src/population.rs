//! Population lookup for administrative units at any level.
//!
//! Source tables differ per country, so every table is first mapped onto
//! canonical [`PopulationRow`]s and loaded into one [`PopulationTable`].
//! Lookups then go through a [`PopulationResolver`], which either fails on a
//! missing unit (strict) or hands the gap back to the caller (lenient), who
//! fills it with [`PopulationTable::impute_residuals`].

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use panel_schema::{AdminUnit, PopulationRow};
use thiserror::Error;

use crate::config::PopulationMode;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PopulationEntry {
    pub population: f64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Set when the population was estimated from a parent's residual.
    pub imputed: bool,
}

/// Record of one population filled in by residual imputation.
#[derive(Debug, Clone, PartialEq)]
pub struct ImputedPopulation {
    pub unit: AdminUnit,
    pub parent: AdminUnit,
    pub population: f64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PopulationError {
    #[error("population not found for {unit}")]
    NotFound { unit: AdminUnit },
    #[error(
        "no residual population under {parent} for {missing} unresolved units (residual {residual})"
    )]
    ResidualExhausted {
        parent: AdminUnit,
        missing: usize,
        residual: f64,
    },
    #[error("conflicting populations for {unit}: {existing} vs {incoming}")]
    Conflicting {
        unit: AdminUnit,
        existing: f64,
        incoming: f64,
    },
    #[error("invalid population row for {unit}: {reason}")]
    InvalidRow { unit: AdminUnit, reason: &'static str },
}

/// Canonical population table keyed by full name chain.
#[derive(Debug, Clone, Default)]
pub struct PopulationTable {
    entries: BTreeMap<AdminUnit, PopulationEntry>,
}

impl PopulationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows<I>(rows: I) -> Result<Self, PopulationError>
    where
        I: IntoIterator<Item = PopulationRow>,
    {
        let mut table = Self::new();
        table.extend(rows)?;
        Ok(table)
    }

    /// Add rows from another per-level table. Re-adding an identical row is a
    /// no-op; a different population for the same unit is an error.
    pub fn extend<I>(&mut self, rows: I) -> Result<(), PopulationError>
    where
        I: IntoIterator<Item = PopulationRow>,
    {
        for row in rows {
            let unit = row.unit();
            if !unit.is_valid() {
                return Err(PopulationError::InvalidRow {
                    unit,
                    reason: "unit chain is empty or contains a wildcard",
                });
            }
            if !row.population.is_finite() || row.population <= 0.0 {
                return Err(PopulationError::InvalidRow {
                    unit,
                    reason: "population must be a positive number",
                });
            }
            let entry = PopulationEntry {
                population: row.population,
                latitude: row.latitude,
                longitude: row.longitude,
                imputed: false,
            };
            match self.entries.get(&unit) {
                Some(existing) if existing.population != entry.population => {
                    return Err(PopulationError::Conflicting {
                        unit,
                        existing: existing.population,
                        incoming: entry.population,
                    });
                }
                Some(_) => {}
                None => {
                    self.entries.insert(unit, entry);
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, unit: &AdminUnit) -> Option<&PopulationEntry> {
        self.entries.get(unit)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Direct children of `parent` present in the table.
    pub fn children_of<'a>(
        &'a self,
        parent: &'a AdminUnit,
    ) -> impl Iterator<Item = (&'a AdminUnit, &'a PopulationEntry)> + 'a {
        let child_level = parent.level() + 1;
        self.entries
            .range((Bound::Excluded(parent.clone()), Bound::Unbounded))
            .take_while(move |(unit, _)| parent.is_ancestor_of(unit))
            .filter(move |(unit, _)| unit.level() == child_level)
    }

    /// Fill each missing unit with an even share of its parent's residual
    /// population (parent minus all known children). Shallower units are
    /// filled first so they can act as parents for deeper ones.
    pub fn impute_residuals(
        &mut self,
        missing: &[AdminUnit],
    ) -> Result<Vec<ImputedPopulation>, PopulationError> {
        let mut by_parent: BTreeMap<(usize, AdminUnit), BTreeSet<AdminUnit>> = BTreeMap::new();
        for unit in missing {
            if self.entries.contains_key(unit) {
                continue;
            }
            let parent = unit
                .parent()
                .ok_or_else(|| PopulationError::NotFound { unit: unit.clone() })?;
            by_parent
                .entry((parent.level(), parent))
                .or_default()
                .insert(unit.clone());
        }

        let mut imputed = Vec::new();
        for ((_, parent), units) in by_parent {
            let parent_population = self
                .entries
                .get(&parent)
                .map(|entry| entry.population)
                .ok_or_else(|| PopulationError::NotFound {
                    unit: parent.clone(),
                })?;
            let known: f64 = self
                .children_of(&parent)
                .filter(|(unit, _)| !units.contains(*unit))
                .map(|(_, entry)| entry.population)
                .sum();
            let residual = parent_population - known;
            if residual <= 0.0 {
                return Err(PopulationError::ResidualExhausted {
                    parent,
                    missing: units.len(),
                    residual,
                });
            }
            let share = residual / units.len() as f64;
            for unit in units {
                tracing::warn!(
                    target: "policy_panel::population",
                    unit = %unit,
                    parent = %parent,
                    population = share,
                    "population.imputed=residual"
                );
                self.entries.insert(
                    unit.clone(),
                    PopulationEntry {
                        population: share,
                        latitude: None,
                        longitude: None,
                        imputed: true,
                    },
                );
                imputed.push(ImputedPopulation {
                    unit,
                    parent: parent.clone(),
                    population: share,
                });
            }
        }
        Ok(imputed)
    }
}

/// Population table with every unit a run needs already resolved.
#[derive(Debug, Clone)]
pub struct PreparedPopulations {
    pub table: PopulationTable,
    pub imputed: Vec<ImputedPopulation>,
}

/// Resolves populations against a table under a fixed [`PopulationMode`].
#[derive(Debug, Clone, Copy)]
pub struct PopulationResolver<'a> {
    table: &'a PopulationTable,
    mode: PopulationMode,
}

impl<'a> PopulationResolver<'a> {
    pub fn new(table: &'a PopulationTable, mode: PopulationMode) -> Self {
        Self { table, mode }
    }

    /// Strict mode fails on a missing unit; lenient mode returns `None` and
    /// leaves the fallback to the caller.
    pub fn resolve_population(
        &self,
        unit: &AdminUnit,
    ) -> Result<Option<&'a PopulationEntry>, PopulationError> {
        match (self.table.get(unit), self.mode) {
            (Some(entry), _) => Ok(Some(entry)),
            (None, PopulationMode::Strict) => {
                Err(PopulationError::NotFound { unit: unit.clone() })
            }
            (None, PopulationMode::Lenient) => Ok(None),
        }
    }

    /// Resolve every unit in `units`, imputing the gaps in lenient mode.
    pub fn prepare<I>(&self, units: I) -> Result<PreparedPopulations, PopulationError>
    where
        I: IntoIterator<Item = AdminUnit>,
    {
        let mut missing = BTreeSet::new();
        for unit in units {
            if self.resolve_population(&unit)?.is_none() {
                missing.insert(unit);
            }
        }

        let mut table = self.table.clone();
        let imputed = if missing.is_empty() {
            Vec::new()
        } else {
            let missing: Vec<AdminUnit> = missing.into_iter().collect();
            table.impute_residuals(&missing)?
        };
        Ok(PreparedPopulations { table, imputed })
    }
}
