//! CSV rendering of a merged panel.

use std::io;

use panel_schema::columns;
use serde_json::Value;

use crate::panel::{MergedPanel, MergedRow};

impl MergedPanel {
    /// Header row: unit names, date, case counts, any extra upstream
    /// columns, population columns, policy columns, `policies_enacted`.
    pub fn csv_header(&self) -> Vec<String> {
        let mut header: Vec<String> = (0..=self.analysis_level).map(columns::adm_name).collect();
        header.extend(
            [
                columns::DATE,
                columns::CUM_CONFIRMED_CASES,
                columns::CUM_DEATHS,
                columns::CUM_RECOVERIES,
                columns::ACTIVE_CASES,
            ]
            .map(str::to_string),
        );
        header.extend(self.extra_columns().into_iter().map(str::to_string));
        header.extend(
            [
                columns::POPULATION,
                columns::LATITUDE,
                columns::LONGITUDE,
                columns::IMPUTED_POPULATION,
            ]
            .map(str::to_string),
        );
        header.extend(self.policy_columns.iter().cloned());
        header.push(columns::POLICIES_ENACTED.to_string());
        header
    }

    /// Write the header and every merged row to `out`.
    pub fn write_csv<W: io::Write>(&self, out: W) -> csv::Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(out);
        writer.write_record(self.csv_header())?;
        let extras = self.extra_columns();
        for row in &self.rows {
            writer.write_record(self.csv_record(row, &extras))?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn to_csv(&self) -> csv::Result<String> {
        let mut buf = Vec::new();
        self.write_csv(&mut buf)?;
        String::from_utf8(buf)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err).into())
    }

    fn csv_record(&self, row: &MergedRow, extras: &[&str]) -> Vec<String> {
        let mut fields: Vec<String> = Vec::with_capacity(extras.len() + 16);
        for level in 0..=self.analysis_level {
            fields.push(row.unit.name_at(level).unwrap_or_default().to_string());
        }
        fields.push(row.cases.date.to_string());
        fields.push(optional_number(row.cases.cum_confirmed_cases));
        fields.push(optional_number(row.cases.cum_deaths));
        fields.push(optional_number(row.cases.cum_recoveries));
        fields.push(optional_number(row.cases.active_cases()));
        for name in extras {
            fields.push(extra_value(row, name));
        }
        fields.push(number(row.population));
        fields.push(optional_number(row.latitude));
        fields.push(optional_number(row.longitude));
        fields.push(u8::from(row.imputed_population).to_string());
        fields.extend(row.policies.iter().copied().map(number));
        fields.push(number(row.policies_enacted));
        fields
    }
}

fn number(value: f64) -> String {
    value.to_string()
}

fn optional_number(value: Option<f64>) -> String {
    value.map(number).unwrap_or_default()
}

fn extra_value(row: &MergedRow, name: &str) -> String {
    match row.cases.extra.get(name) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::NaiveDate;
    use panel_schema::{CasesRow, PopulationRow};

    use super::*;
    use crate::config::RunConfig;
    use crate::panel::PanelBuilder;
    use crate::population::PopulationTable;

    fn capital_panel() -> MergedPanel {
        let table = PopulationTable::from_rows([PopulationRow {
            adm0_name: "USA".into(),
            adm1_name: Some("Washington, D.C.".into()),
            adm2_name: None,
            adm3_name: None,
            population: 700.0,
            latitude: None,
            longitude: None,
        }])
        .expect("table builds");
        let mut extra = BTreeMap::new();
        extra.insert("source".to_string(), Value::String("say \"hi\"".into()));
        let cases = [CasesRow {
            adm0_name: "USA".into(),
            adm1_name: Some("Washington, D.C.".into()),
            adm2_name: None,
            adm3_name: None,
            date: NaiveDate::from_ymd_opt(2020, 3, 1).expect("valid date"),
            cum_confirmed_cases: Some(3.0),
            cum_deaths: None,
            cum_recoveries: None,
            active_cases: None,
            extra,
        }];
        let config = RunConfig::default();
        PanelBuilder::new(&config, &table)
            .build_panel(&cases, &[], 1)
            .expect("panel builds")
    }

    #[test]
    fn quotes_fields_with_separators() {
        let csv = capital_panel().to_csv().expect("renders");
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(
            lines[0],
            "adm0_name,adm1_name,date,cum_confirmed_cases,cum_deaths,cum_recoveries,active_cases,source,population,lat,lon,imputed_population,policies_enacted"
        );
        assert_eq!(
            lines[1],
            "USA,\"Washington, D.C.\",2020-03-01,3,,,,\"say \"\"hi\"\"\",700,,,0,0"
        );
        assert!(csv.ends_with('\n') && !csv.contains('\r'));
    }

    #[test]
    fn numbers_render_compactly() {
        assert_eq!(number(1.0), "1");
        assert_eq!(number(0.25), "0.25");
        assert_eq!(optional_number(None), "");
    }
}
