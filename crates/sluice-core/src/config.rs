use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SluiceError};
use crate::types::{
    ErrorTolerance, JoinPolicy, LoadOptions, Location, PartitionKey, SchemaMode, TableRef,
};

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub pipeline: PipelineSection,
    pub source: SourceConfig,
    #[serde(default)]
    pub sensor: SensorConfig,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub transform: TransformConfig,
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub warehouse: WarehouseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Definition name; at most one run per name is active at a time.
    pub name: String,
    /// Static fan-out keys, fixed when the graph is built.
    #[serde(default)]
    pub partitions: Vec<String>,
    /// Retries per node after the first attempt.
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default)]
    pub join_policy: JoinPolicy,
}

/// Object whose arrival triggers the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub bucket: String,
    pub object: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    #[serde(default = "default_sensor_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_sensor_timeout(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    /// `dataset.table` or `project.dataset.table`.
    #[serde(default = "default_load_destination")]
    pub destination: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_skip_header_rows")]
    pub skip_header_rows: usize,
    #[serde(default)]
    pub schema_mode: SchemaMode,
    #[serde(default = "default_true")]
    pub overwrite: bool,
    #[serde(default = "default_true")]
    pub allow_jagged_rows: bool,
    #[serde(default = "default_true")]
    pub ignore_unknown_values: bool,
    #[serde(default)]
    pub max_bad_records: usize,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            destination: default_load_destination(),
            delimiter: default_delimiter(),
            skip_header_rows: default_skip_header_rows(),
            schema_mode: SchemaMode::default(),
            overwrite: true,
            allow_jagged_rows: true,
            ignore_unknown_values: true,
            max_bad_records: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    #[serde(default = "default_transform_dataset")]
    pub dataset: String,
    /// Column compared against the partition key.
    #[serde(default = "default_partition_column")]
    pub partition_column: String,
    #[serde(default = "default_table_suffix")]
    pub table_suffix: String,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            dataset: default_transform_dataset(),
            partition_column: default_partition_column(),
            table_suffix: default_table_suffix(),
        }
    }
}

/// One projected column: `source AS alias`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnConfig {
    pub source: String,
    pub alias: String,
}

impl ColumnConfig {
    fn new(source: &str, alias: &str) -> Self {
        Self {
            source: source.to_string(),
            alias: alias.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default = "default_reporting_dataset")]
    pub dataset: String,
    #[serde(default = "default_view_suffix")]
    pub view_suffix: String,
    #[serde(default = "default_columns")]
    pub columns: Vec<ColumnConfig>,
    /// Row predicate applied by every view; `None` keeps all rows.
    #[serde(default = "default_filter")]
    pub filter: Option<String>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            dataset: default_reporting_dataset(),
            view_suffix: default_view_suffix(),
            columns: default_columns(),
            filter: default_filter(),
        }
    }
}

/// Local backend used by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseConfig {
    /// Optional project prefix for every table reference.
    #[serde(default)]
    pub project: Option<String>,
    /// SQLite database file.
    #[serde(default = "default_database")]
    pub database: String,
    /// Directory that holds one sub-directory per bucket.
    #[serde(default = "default_storage_root")]
    pub storage_root: String,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            project: None,
            database: default_database(),
            storage_root: default_storage_root(),
        }
    }
}

fn default_retries() -> u32 { 1 }
fn default_sensor_timeout() -> u64 { 300 }
fn default_poll_interval() -> u64 { 30 }
fn default_load_destination() -> String { "staging_dataset.global_data".to_string() }
fn default_delimiter() -> char { ',' }
fn default_skip_header_rows() -> usize { 1 }
fn default_true() -> bool { true }
fn default_transform_dataset() -> String { "transform_dataset".to_string() }
fn default_partition_column() -> String { "country".to_string() }
fn default_table_suffix() -> String { "_table".to_string() }
fn default_reporting_dataset() -> String { "reporting_dataset".to_string() }
fn default_view_suffix() -> String { "_view".to_string() }
fn default_database() -> String { "sluice.db".to_string() }
fn default_storage_root() -> String { "storage".to_string() }

fn default_columns() -> Vec<ColumnConfig> {
    vec![
        ColumnConfig::new("Year", "year"),
        ColumnConfig::new("Disease Name", "disease_name"),
        ColumnConfig::new("Disease Category", "disease_category"),
        ColumnConfig::new("Prevalence Rate", "prevalence_rate"),
        ColumnConfig::new("Incidence Rate", "incidence_rate"),
    ]
}

fn default_filter() -> Option<String> {
    Some("`Availability of Vaccines Treatment` = False".to_string())
}

impl PipelineConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| SluiceError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text, expanding `${ENV_VAR}` references first.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| SluiceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline.name.trim().is_empty() {
            return Err(SluiceError::Config("pipeline.name must not be empty".into()));
        }
        if self.source.bucket.is_empty() || self.source.object.is_empty() {
            return Err(SluiceError::Config(
                "source.bucket and source.object are required".into(),
            ));
        }
        if self.sensor.poll_interval_secs == 0 {
            return Err(SluiceError::Config(
                "sensor.poll_interval_secs must be greater than zero".into(),
            ));
        }
        if matches!(self.load.delimiter, '\n' | '\r' | '"') || !self.load.delimiter.is_ascii() {
            return Err(SluiceError::Config(format!(
                "load.delimiter {:?} is not a usable single-byte delimiter",
                self.load.delimiter
            )));
        }
        if TableRef::parse(&self.load.destination).is_none() {
            return Err(SluiceError::Config(format!(
                "load.destination '{}' must be dataset.table or project.dataset.table",
                self.load.destination
            )));
        }

        let ident = identifier_pattern();
        for (field, value) in [
            ("transform.dataset", &self.transform.dataset),
            ("project.dataset", &self.project.dataset),
        ] {
            if !ident.is_match(value) {
                return Err(SluiceError::Config(format!(
                    "{} '{}' is not a valid identifier",
                    field, value
                )));
            }
        }
        if let Some(project) = &self.warehouse.project {
            if !ident.is_match(project) {
                return Err(SluiceError::Config(format!(
                    "warehouse.project '{}' is not a valid identifier",
                    project
                )));
            }
        }

        let quoted = std::iter::once(&self.transform.partition_column)
            .chain(self.project.columns.iter().map(|c| &c.source))
            .chain(self.project.columns.iter().map(|c| &c.alias));
        for name in quoted {
            if name.is_empty() || name.contains('`') {
                return Err(SluiceError::Config(format!(
                    "column name '{}' must be non-empty and free of backticks",
                    name
                )));
            }
        }
        if self.project.columns.is_empty() {
            return Err(SluiceError::Config(
                "project.columns must list at least one column".into(),
            ));
        }

        let mut slugs = HashSet::new();
        for key in &self.pipeline.partitions {
            if key.trim().is_empty() {
                return Err(SluiceError::Config("partition keys must not be empty".into()));
            }
            let slug = PartitionKey::new(key.as_str()).slug();
            if !slugs.insert(slug.clone()) {
                return Err(SluiceError::Config(format!(
                    "partition '{}' collides with another partition as '{}'",
                    key, slug
                )));
            }
        }
        Ok(())
    }

    pub fn partition_keys(&self) -> Vec<PartitionKey> {
        self.pipeline
            .partitions
            .iter()
            .map(|p| PartitionKey::new(p.as_str()))
            .collect()
    }

    pub fn source_location(&self) -> Location {
        Location::new(&self.source.bucket, &self.source.object)
    }

    /// Destination of the bulk load, with the warehouse project applied
    /// unless the destination names its own.
    pub fn load_destination(&self) -> Result<TableRef> {
        let table = TableRef::parse(&self.load.destination).ok_or_else(|| {
            SluiceError::Config(format!("invalid load.destination '{}'", self.load.destination))
        })?;
        if table.project.is_some() {
            Ok(table)
        } else {
            Ok(table.in_project(self.warehouse.project.clone()))
        }
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            delimiter: self.load.delimiter,
            skip_header_rows: self.load.skip_header_rows,
            schema_mode: self.load.schema_mode,
            overwrite: self.load.overwrite,
            error_tolerance: ErrorTolerance {
                allow_jagged_rows: self.load.allow_jagged_rows,
                ignore_unknown_values: self.load.ignore_unknown_values,
                max_bad_records: self.load.max_bad_records,
            },
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.sensor.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.sensor.poll_interval_secs)
    }

    pub fn database_path(&self) -> PathBuf {
        expand_home(&self.warehouse.database)
    }

    pub fn storage_root(&self) -> PathBuf {
        expand_home(&self.warehouse.storage_root)
    }
}

fn identifier_pattern() -> Regex {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_\-]*$").expect("static identifier regex")
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
