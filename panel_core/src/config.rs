use std::{
    env, fs, io,
    path::{Path, PathBuf},
};

use chrono::NaiveDate;
use serde::Deserialize;
use thiserror::Error;

pub const BUILTIN_RUN_CONFIG: &str = include_str!("data/run_config.json");

/// Environment variable pointing at a JSON run configuration.
pub const RUN_CONFIG_ENV: &str = "POLICY_PANEL_CONFIG_PATH";

/// Everything a panel run needs to know, passed explicitly to each stage.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    countries: Vec<CountryRun>,
    data_root: PathBuf,
    output_root: PathBuf,
    population_mode: PopulationMode,
    optional_flag_policy: OptionalFlagPolicy,
    single_change_categories: Vec<String>,
    multi_valued_categories: Vec<String>,
    popwt_exclusions: Vec<String>,
    independent_optional_categories: Vec<String>,
    open_end_sentinel: NaiveDate,
    intensity_tolerance: f64,
    parallel: bool,
}

impl RunConfig {
    pub fn builtin() -> Self {
        serde_json::from_str(BUILTIN_RUN_CONFIG).expect("builtin run config should parse")
    }

    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_file(path: &Path) -> Result<Self, RunConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| RunConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let config = RunConfig::from_json_str(&contents)?;
        Ok(config)
    }

    pub fn countries(&self) -> &[CountryRun] {
        &self.countries
    }

    pub fn country(&self, iso: &str) -> Option<&CountryRun> {
        self.countries.iter().find(|run| run.iso == iso)
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub fn population_mode(&self) -> PopulationMode {
        self.population_mode
    }

    pub fn optional_flag_policy(&self) -> OptionalFlagPolicy {
        self.optional_flag_policy
    }

    /// Categories expected to occur at most once in a country's policy list.
    pub fn is_single_change(&self, category: &str) -> bool {
        self.single_change_categories.iter().any(|c| c == category)
            && !self.multi_valued_categories.iter().any(|c| c == category)
    }

    /// Categories that never receive a pop-weighted column.
    pub fn excludes_popwt(&self, category: &str) -> bool {
        self.popwt_exclusions.iter().any(|c| c == category)
    }

    /// Categories whose optional rows become a separate `{category}_opt`
    /// policy instead of going through the optional/mandatory overlap logic.
    pub fn treats_optional_independently(&self, category: &str) -> bool {
        self.independent_optional_categories
            .iter()
            .any(|c| c == category)
    }

    pub fn open_end_sentinel(&self) -> NaiveDate {
        self.open_end_sentinel
    }

    pub fn intensity_tolerance(&self) -> f64 {
        self.intensity_tolerance
    }

    pub fn parallel(&self) -> bool {
        self.parallel
    }

    pub fn with_population_mode(mut self, mode: PopulationMode) -> Self {
        self.population_mode = mode;
        self
    }

    pub fn with_optional_flag_policy(mut self, policy: OptionalFlagPolicy) -> Self {
        self.optional_flag_policy = policy;
        self
    }

    pub fn with_multi_valued(mut self, category: impl Into<String>) -> Self {
        self.multi_valued_categories.push(category.into());
        self
    }

    pub fn with_independent_optional(mut self, category: impl Into<String>) -> Self {
        self.independent_optional_categories.push(category.into());
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_roots(mut self, data_root: PathBuf, output_root: PathBuf) -> Self {
        self.data_root = data_root;
        self.output_root = output_root;
        self
    }

    pub fn with_countries(mut self, countries: Vec<CountryRun>) -> Self {
        self.countries = countries;
        self
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            countries: Vec::new(),
            data_root: PathBuf::from("data/processed"),
            output_root: PathBuf::from("data/panels"),
            population_mode: PopulationMode::Strict,
            optional_flag_policy: OptionalFlagPolicy::Reject,
            single_change_categories: vec!["testing_regime".to_string()],
            multi_valued_categories: Vec::new(),
            popwt_exclusions: vec![
                "testing_regime".to_string(),
                "travel_ban_intl_in".to_string(),
                "travel_ban_intl_out".to_string(),
            ],
            independent_optional_categories: Vec::new(),
            open_end_sentinel: NaiveDate::from_ymd_opt(2099, 12, 31).unwrap_or(NaiveDate::MAX),
            intensity_tolerance: 1e-9,
            parallel: true,
        }
    }
}

/// One country to process and the analysis levels to build panels at.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CountryRun {
    pub iso: String,
    #[serde(default = "default_analysis_levels")]
    pub analysis_levels: Vec<usize>,
}

impl CountryRun {
    pub fn new(iso: impl Into<String>, analysis_levels: Vec<usize>) -> Self {
        Self {
            iso: iso.into(),
            analysis_levels,
        }
    }
}

fn default_analysis_levels() -> Vec<usize> {
    vec![1]
}

/// How unresolved population lookups are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PopulationMode {
    /// A missing population is fatal for the country.
    #[default]
    Strict,
    /// Missing populations are filled with the parent's residual population
    /// and flagged as imputed.
    Lenient,
}

/// What to do with optional-flag values that are not a recognized encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionalFlagPolicy {
    #[default]
    Reject,
    DefaultMandatory,
}

#[derive(Debug, Error)]
pub enum RunConfigError {
    #[error("failed to parse run config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read run config from {path:?}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Load the run configuration named by [`RUN_CONFIG_ENV`], falling back to the
/// builtin defaults. Returns the path the config came from, if any.
pub fn load_run_config_from_env() -> (RunConfig, Option<PathBuf>) {
    let Some(path) = env::var(RUN_CONFIG_ENV).ok().map(PathBuf::from) else {
        tracing::info!(target: "policy_panel::config", "run_config.loaded=builtin");
        return (RunConfig::builtin(), None);
    };

    match RunConfig::from_file(&path) {
        Ok(config) => {
            tracing::info!(
                target: "policy_panel::config",
                path = %path.display(),
                "run_config.loaded=file"
            );
            (config, Some(path))
        }
        Err(err) => {
            tracing::warn!(
                target: "policy_panel::config",
                path = %path.display(),
                error = %err,
                "run_config.load_failed"
            );
            tracing::info!(target: "policy_panel::config", "run_config.loaded=builtin");
            (RunConfig::builtin(), None)
        }
    }
}
