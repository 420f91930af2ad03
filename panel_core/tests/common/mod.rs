#![allow(dead_code)]

use chrono::NaiveDate;
use panel_schema::{CasesRow, PopulationRow, RawFlag, RawPolicyRow};

pub fn day(month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, month, day).expect("valid date")
}

fn chain(names: &[&str], level: usize) -> Option<String> {
    names.get(level).map(|name| name.to_string())
}

pub fn population(names: &[&str], population: f64) -> PopulationRow {
    PopulationRow {
        adm0_name: names[0].to_string(),
        adm1_name: chain(names, 1),
        adm2_name: chain(names, 2),
        adm3_name: chain(names, 3),
        population,
        latitude: None,
        longitude: None,
    }
}

/// Cases rows for `names` on every day from `first` to `last`.
pub fn cases_span(names: &[&str], first: NaiveDate, last: NaiveDate) -> Vec<CasesRow> {
    first
        .iter_days()
        .take_while(|date| *date <= last)
        .enumerate()
        .map(|(idx, date)| CasesRow {
            adm0_name: names[0].to_string(),
            adm1_name: chain(names, 1),
            adm2_name: chain(names, 2),
            adm3_name: chain(names, 3),
            date,
            cum_confirmed_cases: Some(idx as f64 * 10.0),
            cum_deaths: Some(0.0),
            cum_recoveries: Some(0.0),
            active_cases: None,
            extra: Default::default(),
        })
        .collect()
}

pub struct PolicyRow {
    raw: RawPolicyRow,
}

impl PolicyRow {
    pub fn new(scope: &[&str], policy: &str, start: NaiveDate) -> Self {
        Self {
            raw: RawPolicyRow {
                adm0_name: scope[0].to_string(),
                adm1_name: chain(scope, 1),
                adm2_name: chain(scope, 2),
                adm3_name: chain(scope, 3),
                date_start: start,
                date_end: None,
                policy: policy.to_string(),
                policy_intensity: None,
                optional: None,
            },
        }
    }

    pub fn intensity(mut self, intensity: f64) -> Self {
        self.raw.policy_intensity = Some(intensity);
        self
    }

    pub fn optional(mut self) -> Self {
        self.raw.optional = Some(RawFlag::Text("Y".into()));
        self
    }

    pub fn until(mut self, end: NaiveDate) -> Self {
        self.raw.date_end = Some(end);
        self
    }

    pub fn build(self) -> RawPolicyRow {
        self.raw
    }
}
