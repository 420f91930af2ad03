//! Column names of the merged panel. Downstream regression code selects
//! covariates by these names, so they must stay stable.

pub const DATE: &str = "date";
pub const CUM_CONFIRMED_CASES: &str = "cum_confirmed_cases";
pub const CUM_DEATHS: &str = "cum_deaths";
pub const CUM_RECOVERIES: &str = "cum_recoveries";
pub const ACTIVE_CASES: &str = "active_cases";
pub const POPULATION: &str = "population";
pub const LATITUDE: &str = "lat";
pub const LONGITUDE: &str = "lon";
pub const IMPUTED_POPULATION: &str = "imputed_population";
pub const POLICIES_ENACTED: &str = "policies_enacted";

pub const POPWT_SUFFIX: &str = "_popwt";
pub const OPT_SUFFIX: &str = "_opt";

pub fn adm_name(level: usize) -> String {
    format!("adm{level}_name")
}

pub fn popwt(category: &str) -> String {
    format!("{category}{POPWT_SUFFIX}")
}

pub fn optional(category: &str) -> String {
    format!("{category}{OPT_SUFFIX}")
}

pub fn optional_popwt(category: &str) -> String {
    format!("{category}{OPT_SUFFIX}{POPWT_SUFFIX}")
}
