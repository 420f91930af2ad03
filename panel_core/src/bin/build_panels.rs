use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use panel_core::{load_run_config_from_env, run_batch, RunConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Build daily policy panels per country", long_about = None)]
struct Cli {
    /// JSON run configuration. Falls back to POLICY_PANEL_CONFIG_PATH, then
    /// the builtin defaults.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Only process these countries (ISO codes). Repeatable.
    #[arg(long = "country")]
    countries: Vec<String>,
    /// Build panels without writing any output.
    #[arg(long)]
    dry_run: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match RunConfig::from_file(path) {
            Ok(config) => config,
            Err(err) => {
                error!(path = %path.display(), error = %err, "run_config.load_failed");
                return ExitCode::FAILURE;
            }
        },
        None => load_run_config_from_env().0,
    };

    let report = run_batch(&config, &cli.countries, cli.dry_run);

    for summary in report.succeeded() {
        for panel in &summary.panels {
            let output = panel
                .output
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "(dry run)".to_string());
            println!(
                "{} adm{}: {} rows, {} units x {} days, {} policy columns, {} dropped -> {}",
                summary.iso,
                panel.level,
                panel.rows,
                panel.units,
                panel.dates,
                panel.policy_columns.len(),
                panel.dropped_rows,
                output
            );
        }
    }
    for (iso, err) in report.failed() {
        eprintln!("{iso}: {err}");
    }

    info!(
        succeeded = report.succeeded().count(),
        failed = report.failed().count(),
        "batch.finished"
    );

    if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
