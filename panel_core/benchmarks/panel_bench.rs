use chrono::NaiveDate;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use panel_core::{PanelBuilder, PopulationTable, RunConfig};
use panel_schema::{AdminUnit, PolicyId, PolicyRecord, PolicyScope, PopulationRow};

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 1, 1).expect("valid date") + chrono::Days::new(u64::from(day))
}

fn fixture(states: usize) -> (Vec<AdminUnit>, Vec<PolicyRecord>, PopulationTable) {
    let mut populations = vec![PopulationRow {
        adm0_name: "USA".into(),
        adm1_name: None,
        adm2_name: None,
        adm3_name: None,
        population: 1.0e9,
        latitude: None,
        longitude: None,
    }];
    let mut units = Vec::with_capacity(states);
    let mut policies = Vec::new();
    let categories = ["school_closure", "event_cancel", "business_closure", "home_isolation"];

    for state in 0..states {
        let state_name = format!("State {state}");
        units.push(AdminUnit::new(["USA", state_name.as_str()]));
        populations.push(PopulationRow {
            adm0_name: "USA".into(),
            adm1_name: Some(state_name.clone()),
            adm2_name: None,
            adm3_name: None,
            population: 1.0e6,
            latitude: None,
            longitude: None,
        });
        for county in 0..4 {
            let county_name = format!("County {county}");
            populations.push(PopulationRow {
                adm0_name: "USA".into(),
                adm1_name: Some(state_name.clone()),
                adm2_name: Some(county_name.clone()),
                adm3_name: None,
                population: 2.0e5,
                latitude: None,
                longitude: None,
            });
            let category = categories[(state + county) % categories.len()];
            let scope =
                PolicyScope::from_columns("USA", [Some(state_name.as_str()), Some(county_name.as_str()), None]);
            policies.push(PolicyRecord {
                id: PolicyId(policies.len() as u32),
                specificity_level: scope.specificity_level(),
                scope,
                category: category.into(),
                optional: county % 2 == 1,
                intensity: 0.5 + 0.1 * county as f64,
                date_start: date((state * 3 + county * 7) as u32 % 60),
                date_end: date(90),
            });
        }
    }
    for (idx, category) in categories.iter().enumerate() {
        let scope = PolicyScope::from_columns("USA", [None, None, None]);
        policies.push(PolicyRecord {
            id: PolicyId(policies.len() as u32),
            specificity_level: 0,
            scope,
            category: (*category).into(),
            optional: false,
            intensity: 0.5,
            date_start: date(30 + idx as u32 * 5),
            date_end: date(120),
        });
    }

    let table = PopulationTable::from_rows(populations).expect("bench populations");
    (units, policies, table)
}

fn bench_policy_panel(c: &mut Criterion) {
    let mut group = c.benchmark_group("policy_panel");

    for states in [10usize, 50] {
        let (units, policies, table) = fixture(states);
        for parallel in [false, true] {
            let config = RunConfig::default().with_parallel(parallel);
            let label = if parallel { "parallel" } else { "serial" };
            group.bench_with_input(BenchmarkId::new(label, states), &states, |b, _| {
                let builder = PanelBuilder::new(&config, &table);
                b.iter(|| {
                    builder
                        .build_policy_panel(&units, date(0), date(120), &policies)
                        .expect("panel builds")
                })
            });
        }
    }

    group.finish();
}

criterion_group!(panel_benches, bench_policy_panel);
criterion_main!(panel_benches);
