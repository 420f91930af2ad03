//! Policy panel engine.
//!
//! Turns a country's raw policy list into a dense daily panel of policy
//! indicators and population-weighted intensities per administrative unit,
//! then joins it onto the cases panel. The pipeline runs leaf-first:
//! [`PopulationResolver`] → [`PolicyNormalizer`] → [`scope`] predicates →
//! [`IntensityAggregator`] → [`PanelBuilder`]. [`batch::run_batch`] drives it
//! for every configured country.

pub mod aggregate;
pub mod batch;
pub mod config;
mod export;
pub mod hashing;
pub mod normalize;
pub mod panel;
pub mod population;
pub mod scope;

pub use aggregate::{
    AggregationError, CacheStats, CellCache, CellFlags, CellResolution, IntensityAggregator,
};
pub use batch::{
    load_country_inputs, process_country, run_batch, BatchError, BatchReport, CountryInputs,
    CountrySummary, PanelSummary,
};
pub use config::{
    load_run_config_from_env, CountryRun, OptionalFlagPolicy, PopulationMode, RunConfig,
    RunConfigError,
};
pub use hashing::PolicySetFingerprint;
pub use normalize::{InvalidPolicyData, NormalizeError, NormalizedPolicies, PolicyNormalizer};
pub use panel::{
    ColumnKind, JoinIntegrityWarning, MergedPanel, MergedRow, PanelBuilder, PanelColumn,
    PanelError, PolicyPanel,
};
pub use population::{
    ImputedPopulation, PopulationEntry, PopulationError, PopulationResolver, PopulationTable,
    PreparedPopulations,
};
pub use scope::{applies, is_contained_in, relation, ScopeRelation};
