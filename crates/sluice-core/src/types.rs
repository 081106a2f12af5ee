use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

static NEXT_RUN_ID: AtomicU64 = AtomicU64::new(1);

/// Monotonic, process-wide run identifier.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RunId(pub u64);

impl RunId {
    pub fn next() -> Self {
        Self(NEXT_RUN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

/// What a graph node does.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Wait,
    Load,
    Transform,
    Project,
    Join,
}

impl NodeKind {
    /// Whether nodes of this kind belong to a partition branch.
    pub fn is_partitioned(&self) -> bool {
        matches!(self, Self::Transform | Self::Project)
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Wait => "wait",
            Self::Load => "load",
            Self::Transform => "transform",
            Self::Project => "project",
            Self::Join => "join",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of a node within one run.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Retrying,
    Cancelled,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Opaque key of one fan-out branch (e.g. a country code).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identifier-safe form used in node and table names: lower-case,
    /// anything outside `[a-z0-9]` becomes `_`.
    pub fn slug(&self) -> String {
        self.0
            .chars()
            .map(|c| {
                let c = c.to_ascii_lowercase();
                if c.is_ascii_alphanumeric() {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// An object in a storage bucket.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub bucket: String,
    pub object: String,
}

impl Location {
    pub fn new(bucket: impl Into<String>, object: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            object: object.into(),
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.object)
    }
}

/// Fully qualified warehouse table or view name.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct TableRef {
    #[serde(default)]
    pub project: Option<String>,
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(dataset: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            project: None,
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    pub fn in_project(mut self, project: Option<String>) -> Self {
        self.project = project;
        self
    }

    /// Parse `dataset.table` or `project.dataset.table`.
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return None;
        }
        match parts.as_slice() {
            [dataset, table] => Some(Self::new(*dataset, *table)),
            [project, dataset, table] => {
                Some(Self::new(*dataset, *table).in_project(Some(project.to_string())))
            }
            _ => None,
        }
    }

    /// Backtick-quoted form for SQL text.
    pub fn quoted(&self) -> String {
        format!("`{}`", self)
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.project {
            Some(project) => write!(f, "{}.{}.{}", project, self.dataset, self.table),
            None => write!(f, "{}.{}", self.dataset, self.table),
        }
    }
}

/// How a bulk load derives the destination schema.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaMode {
    /// Infer column types from the source at load time.
    #[default]
    Autodetect,
    /// Load every column as text.
    AllText,
}

/// How tolerant a bulk load is of malformed rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorTolerance {
    /// Rows with fewer fields than the header are padded with NULLs.
    pub allow_jagged_rows: bool,
    /// Fields beyond the header width are dropped.
    pub ignore_unknown_values: bool,
    /// Malformed rows that may be skipped before the load fails.
    pub max_bad_records: usize,
}

impl Default for ErrorTolerance {
    fn default() -> Self {
        Self {
            allow_jagged_rows: true,
            ignore_unknown_values: true,
            max_bad_records: 0,
        }
    }
}

/// Options passed to a bulk load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOptions {
    pub delimiter: char,
    pub skip_header_rows: usize,
    pub schema_mode: SchemaMode,
    /// Replace destination contents instead of appending.
    pub overwrite: bool,
    pub error_tolerance: ErrorTolerance,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            delimiter: ',',
            skip_header_rows: 1,
            schema_mode: SchemaMode::Autodetect,
            overwrite: true,
            error_tolerance: ErrorTolerance::default(),
        }
    }
}

/// Outcome of a successful bulk load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    pub rows_loaded: usize,
    pub rows_skipped: usize,
}

/// What a query job materializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    CreateOrReplaceTable,
    CreateOrReplaceView,
}

impl QueryMode {
    pub fn statement_prefix(&self) -> &'static str {
        match self {
            Self::CreateOrReplaceTable => "CREATE OR REPLACE TABLE",
            Self::CreateOrReplaceView => "CREATE OR REPLACE VIEW",
        }
    }
}

/// A SQL job that materializes `destination` from `select`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryJob {
    pub destination: TableRef,
    pub mode: QueryMode,
    /// The `SELECT` body, in standard SQL with backtick-quoted identifiers.
    pub select: String,
}

impl QueryJob {
    /// Full statement text, e.g. `CREATE OR REPLACE TABLE `d.t` AS SELECT ...`.
    pub fn sql(&self) -> String {
        format!(
            "{} {} AS\n{}",
            self.mode.statement_prefix(),
            self.destination.quoted(),
            self.select
        )
    }
}

/// What the join barrier does when a partition branch fails for good.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Every branch must succeed; one terminal failure fails the run.
    #[default]
    Strict,
    /// Join once every branch has settled; succeed if at least one did.
    BestEffort,
}

impl std::str::FromStr for JoinPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "strict" => Ok(Self::Strict),
            "best_effort" | "best-effort" => Ok(Self::BestEffort),
            other => Err(format!(
                "unknown join policy '{}' (expected strict or best-effort)",
                other
            )),
        }
    }
}

impl std::fmt::Display for JoinPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Strict => f.write_str("strict"),
            Self::BestEffort => f.write_str("best_effort"),
        }
    }
}

/// Events published while a run executes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// A run started.
    RunStarted {
        run_id: RunId,
        pipeline: String,
        nodes: usize,
        started_at: DateTime<Utc>,
    },
    /// A node moved between lifecycle states.
    NodeStateChanged {
        run_id: RunId,
        node: String,
        from: NodeState,
        to: NodeState,
        attempt: u32,
    },
    /// A node attempt failed.
    NodeAttemptFailed {
        run_id: RunId,
        node: String,
        attempt: u32,
        kind: ErrorKind,
        message: String,
    },
    /// A run reached its end.
    RunFinished {
        run_id: RunId,
        pipeline: String,
        succeeded: bool,
        elapsed_ms: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_ids_are_monotonic() {
        let a = RunId::next();
        let b = RunId::next();
        assert!(b > a);
    }

    #[test]
    fn test_partition_slug() {
        assert_eq!(PartitionKey::new("USA").slug(), "usa");
        assert_eq!(PartitionKey::new("United Kingdom").slug(), "united_kingdom");
        assert_eq!(PartitionKey::new("Côte").slug(), "c_te");
    }

    #[test]
    fn test_table_ref_parse_and_display() {
        let t = TableRef::parse("staging.global_data").unwrap();
        assert_eq!(t.dataset, "staging");
        assert_eq!(t.table, "global_data");
        assert_eq!(t.to_string(), "staging.global_data");

        let t = TableRef::parse("proj.staging.global_data").unwrap();
        assert_eq!(t.project.as_deref(), Some("proj"));
        assert_eq!(t.quoted(), "`proj.staging.global_data`");

        assert!(TableRef::parse("nodot").is_none());
        assert!(TableRef::parse("a..b").is_none());
    }

    #[test]
    fn test_query_job_sql() {
        let job = QueryJob {
            destination: TableRef::new("transform", "usa_table"),
            mode: QueryMode::CreateOrReplaceTable,
            select: "SELECT 1".into(),
        };
        assert_eq!(
            job.sql(),
            "CREATE OR REPLACE TABLE `transform.usa_table` AS\nSELECT 1"
        );
    }

    #[test]
    fn test_join_policy_parse() {
        assert_eq!("strict".parse::<JoinPolicy>().unwrap(), JoinPolicy::Strict);
        assert_eq!(
            "best-effort".parse::<JoinPolicy>().unwrap(),
            JoinPolicy::BestEffort
        );
        assert!("lenient".parse::<JoinPolicy>().is_err());
    }

    #[test]
    fn test_node_state_classification() {
        assert!(NodeState::Succeeded.is_terminal());
        assert!(NodeState::Cancelled.is_terminal());
        assert!(!NodeState::Retrying.is_terminal());
        assert!(!NodeState::Pending.is_terminal());
    }
}
