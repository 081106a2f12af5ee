use std::io::Write;

use sluice_core::config::PipelineConfig;
use sluice_core::error::SluiceError;
use sluice_core::types::{JoinPolicy, SchemaMode};

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[pipeline]
name = "load_create_views"
partitions = ["USA", "India", "Germany", "Japan", "France", "Canada", "Italy"]
retries = 2
join_policy = "best_effort"

[source]
bucket = "bkt-src-global-health-data"
object = "global_health_data.csv"

[sensor]
timeout_secs = 600
poll_interval_secs = 15

[load]
destination = "staging_dataset.global_data"
skip_header_rows = 1
schema_mode = "all_text"
max_bad_records = 3

[transform]
dataset = "transform_dataset"
partition_column = "country"

[project]
dataset = "reporting_dataset"
filter = "`Year` >= 2020"

[[project.columns]]
source = "Year"
alias = "year"

[[project.columns]]
source = "Disease Name"
alias = "disease_name"

[warehouse]
database = "/tmp/sluice-test/warehouse.db"
storage_root = "/tmp/sluice-test/storage"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = PipelineConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.pipeline.name, "load_create_views");
    assert_eq!(config.partition_keys().len(), 7);
    assert_eq!(config.pipeline.retries, 2);
    assert_eq!(config.pipeline.join_policy, JoinPolicy::BestEffort);
    assert_eq!(config.source_location().to_string(), "bkt-src-global-health-data/global_health_data.csv");
    assert_eq!(config.poll_timeout().as_secs(), 600);
    assert_eq!(config.poll_interval().as_secs(), 15);
    assert_eq!(config.load.schema_mode, SchemaMode::AllText);
    assert_eq!(config.load_options().error_tolerance.max_bad_records, 3);
    assert_eq!(config.project.columns.len(), 2);
    assert_eq!(config.project.filter.as_deref(), Some("`Year` >= 2020"));
    assert_eq!(
        config.database_path().to_str(),
        Some("/tmp/sluice-test/warehouse.db")
    );
}

#[test]
fn test_env_expansion_in_file() {
    std::env::set_var("SLUICE_TEST_BUCKET", "bkt-from-env");
    let toml_content = r#"
[pipeline]
name = "p"

[source]
bucket = "${SLUICE_TEST_BUCKET}"
object = "data.csv"
"#;
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = PipelineConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.source.bucket, "bkt-from-env");
    std::env::remove_var("SLUICE_TEST_BUCKET");
}

#[test]
fn test_missing_file() {
    let err = PipelineConfig::load(std::path::Path::new("/nonexistent/sluice.toml")).unwrap_err();
    assert!(matches!(err, SluiceError::ConfigNotFound(_)));
}

#[test]
fn test_missing_source_section() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[pipeline]\nname = \"p\"\n").expect("write toml");
    let err = PipelineConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, SluiceError::Config(_)));
}

#[test]
fn test_example_config_parses() {
    let content = include_str!("../sluice.toml.example");
    let config = PipelineConfig::from_toml_str(content).expect("example config");
    assert_eq!(config.partition_keys().len(), 7);
    assert_eq!(config.pipeline.join_policy, JoinPolicy::Strict);
}
