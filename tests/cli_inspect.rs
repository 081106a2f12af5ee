use std::path::Path;
use std::process::{Command, Output};

use sluice_test_utils::test_config;

fn write_config(dir: &Path) -> std::path::PathBuf {
    let mut config = test_config(&["USA", "India"]);
    config.warehouse.database = dir.join("state/wh.db").display().to_string();
    config.warehouse.storage_root = dir.join("storage").display().to_string();
    let path = dir.join("sluice.toml");
    std::fs::write(&path, toml::to_string_pretty(&config).unwrap()).unwrap();
    path
}

fn sluice(config: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_sluice"))
        .arg("--config")
        .arg(config)
        .args(args)
        .env("RUST_LOG", "off")
        .output()
        .expect("run sluice")
}

#[test]
fn test_validate_does_not_create_database() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    let out = sluice(&config, &["validate"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("7 nodes"), "{}", stdout);
    assert!(!dir.path().join("state").exists());
}

#[test]
fn test_plan_prints_graph_and_sql() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    let out = sluice(&config, &["plan", "--partition", "Germany"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("create_view_germany"), "{}", stdout);
    assert!(!stdout.contains("create_view_usa"), "{}", stdout);
    assert!(stdout.contains("CREATE OR REPLACE TABLE `transform_dataset.germany_table` AS"));
    assert!(stdout.contains("WHERE `country` = 'Germany'"));
    assert!(stdout.contains("CREATE OR REPLACE VIEW `reporting_dataset.germany_view` AS"));
    assert!(!dir.path().join("state").exists());
}
