#![allow(dead_code)]

use std::path::{Path, PathBuf};

use panel_core::RunConfig;

pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
}

/// Fixture run configuration reading from the checked-in data directory and
/// writing into `output_root`.
pub fn fixture_config(output_root: &Path) -> RunConfig {
    let config_path = fixtures_dir().join("run_config.json");
    debug_assert!(
        config_path.exists(),
        "missing fixture run config at {}",
        config_path.display()
    );
    RunConfig::from_file(&config_path)
        .expect("fixture config parses")
        .with_roots(fixtures_dir().join("data"), output_root.to_path_buf())
}
