//! Per-country driver: load inputs, build one panel per analysis level and
//! write it out. A failing country is reported and never stops the others.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use panel_schema::{AdminUnit, CasesRow, PopulationRow, RawPolicyRow};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::config::RunConfig;
use crate::normalize::{NormalizeError, PolicyNormalizer};
use crate::panel::{weighting_units, MergedPanel, PanelBuilder, PanelError};
use crate::population::{PopulationError, PopulationResolver, PopulationTable};

pub const POLICIES_FILE: &str = "policies.json";
pub const POPULATION_FILE: &str = "population.json";

/// Cases file for one analysis level inside a country directory.
pub fn cases_file(level: usize) -> String {
    format!("cases_adm{level}.json")
}

/// Output file name for one country panel.
pub fn panel_file(iso: &str, level: usize) -> String {
    format!("{iso}_adm{level}_panel.csv")
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("country {iso} is not in the run configuration")]
    UnknownCountry { iso: String },
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write {path:?}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Population(#[from] PopulationError),
    #[error("adm{level} panel: {source}")]
    Panel {
        level: usize,
        #[source]
        source: PanelError,
    },
}

/// Raw tables for one country, one cases table per analysis level.
#[derive(Debug, Clone, Default)]
pub struct CountryInputs {
    pub iso: String,
    pub cases: BTreeMap<usize, Vec<CasesRow>>,
    pub policies: Vec<RawPolicyRow>,
    pub populations: Vec<PopulationRow>,
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, BatchError> {
    let contents = fs::read_to_string(path).map_err(|source| BatchError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| BatchError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Read `<data_root>/<iso>/` for the given analysis levels.
pub fn load_country_inputs(
    data_root: &Path,
    iso: &str,
    levels: &[usize],
) -> Result<CountryInputs, BatchError> {
    let dir = data_root.join(iso);
    let mut cases = BTreeMap::new();
    for &level in levels {
        cases.insert(level, read_json(&dir.join(cases_file(level)))?);
    }
    Ok(CountryInputs {
        iso: iso.to_string(),
        cases,
        policies: read_json(&dir.join(POLICIES_FILE))?,
        populations: read_json(&dir.join(POPULATION_FILE))?,
    })
}

/// Normalize the country's policies once and build a merged panel for every
/// level present in `inputs.cases`. Missing populations are imputed once for
/// the whole country so every level weights with the same figures.
pub fn process_country(
    config: &RunConfig,
    inputs: &CountryInputs,
) -> Result<(Vec<MergedPanel>, usize), BatchError> {
    let normalized = PolicyNormalizer::new(&inputs.iso, config).normalize(&inputs.policies)?;
    let populations = PopulationTable::from_rows(inputs.populations.iter().cloned())?;

    let mut needed = BTreeSet::new();
    for (&level, cases) in &inputs.cases {
        let units: Vec<AdminUnit> = cases
            .iter()
            .map(CasesRow::unit)
            .filter(|unit| unit.level() == level)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        needed.extend(weighting_units(&units, normalized.records()));
    }
    let prepared =
        PopulationResolver::new(&populations, config.population_mode()).prepare(needed)?;
    let builder = PanelBuilder::with_prepared(config, &prepared);

    let mut panels = Vec::with_capacity(inputs.cases.len());
    for (&level, cases) in &inputs.cases {
        let panel = builder
            .build_panel(cases, normalized.records(), level)
            .map_err(|source| BatchError::Panel { level, source })?;
        panels.push(panel);
    }
    Ok((panels, normalized.len()))
}

#[derive(Debug, Clone, PartialEq)]
pub struct PanelSummary {
    pub level: usize,
    pub rows: usize,
    pub units: usize,
    pub dates: usize,
    pub policy_columns: Vec<String>,
    pub dropped_rows: usize,
    pub imputed_populations: usize,
    pub output: Option<PathBuf>,
}

impl PanelSummary {
    fn of(panel: &MergedPanel, output: Option<PathBuf>) -> Self {
        Self {
            level: panel.analysis_level,
            rows: panel.len(),
            units: panel.policy_panel.units().len(),
            dates: panel.policy_panel.dates().len(),
            policy_columns: panel.policy_columns.clone(),
            dropped_rows: panel
                .join_warning
                .as_ref()
                .map(|warning| warning.dropped_rows)
                .unwrap_or(0),
            imputed_populations: panel.policy_panel.imputed_populations().len(),
            output,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CountrySummary {
    pub iso: String,
    pub policies: usize,
    pub panels: Vec<PanelSummary>,
}

/// Outcome of a batch run, keyed by country ISO code.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub results: BTreeMap<String, Result<CountrySummary, BatchError>>,
}

impl BatchReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &CountrySummary> {
        self.results.values().filter_map(|result| result.as_ref().ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = (&str, &BatchError)> {
        self.results
            .iter()
            .filter_map(|(iso, result)| result.as_ref().err().map(|err| (iso.as_str(), err)))
    }

    pub fn is_success(&self) -> bool {
        self.failed().next().is_none()
    }
}

/// Process every configured country, or only those in `filter` when it is
/// non-empty. With `dry_run` set, panels are built but nothing is written.
pub fn run_batch(config: &RunConfig, filter: &[String], dry_run: bool) -> BatchReport {
    let mut report = BatchReport::default();

    for iso in filter {
        if config.country(iso).is_none() {
            report.results.insert(
                iso.clone(),
                Err(BatchError::UnknownCountry { iso: iso.clone() }),
            );
        }
    }

    for run in config.countries() {
        if !filter.is_empty() && !filter.contains(&run.iso) {
            continue;
        }
        tracing::info!(
            target: "policy_panel::batch",
            country = %run.iso,
            levels = ?run.analysis_levels,
            "batch.country_started"
        );
        let result = run_country(config, &run.iso, &run.analysis_levels, dry_run);
        match &result {
            Ok(summary) => tracing::info!(
                target: "policy_panel::batch",
                country = %run.iso,
                panels = summary.panels.len(),
                "batch.country_finished"
            ),
            Err(err) => tracing::error!(
                target: "policy_panel::batch",
                country = %run.iso,
                error = %err,
                "batch.country_failed"
            ),
        }
        report.results.insert(run.iso.clone(), result);
    }
    report
}

fn run_country(
    config: &RunConfig,
    iso: &str,
    levels: &[usize],
    dry_run: bool,
) -> Result<CountrySummary, BatchError> {
    let inputs = load_country_inputs(config.data_root(), iso, levels)?;
    let (panels, policies) = process_country(config, &inputs)?;

    if !dry_run {
        fs::create_dir_all(config.output_root()).map_err(|source| BatchError::Io {
            path: config.output_root().to_path_buf(),
            source,
        })?;
    }

    let mut summaries = Vec::with_capacity(panels.len());
    for panel in &panels {
        let output = if dry_run {
            None
        } else {
            let path = config
                .output_root()
                .join(panel_file(iso, panel.analysis_level));
            let file = fs::File::create(&path).map_err(|source| BatchError::Io {
                path: path.clone(),
                source,
            })?;
            panel
                .write_csv(io::BufWriter::new(file))
                .map_err(|source| BatchError::Csv {
                    path: path.clone(),
                    source,
                })?;
            tracing::info!(
                target: "policy_panel::batch",
                country = iso,
                path = %path.display(),
                rows = panel.len(),
                "batch.panel_written"
            );
            Some(path)
        };
        summaries.push(PanelSummary::of(panel, output));
    }

    Ok(CountrySummary {
        iso: iso.to_string(),
        policies,
        panels: summaries,
    })
}
