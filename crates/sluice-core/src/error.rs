use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SluiceError {
    // Step errors
    #[error("Precondition not met after {attempts} polls ({timeout_secs}s): {target}")]
    TimeoutExceeded {
        target: String,
        timeout_secs: u64,
        attempts: u32,
    },

    #[error("Capability error: {0}")]
    Capability(String),

    #[error("Load failed: {0}")]
    Load(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Retry budget exhausted for {node} after {attempts} attempts: {last}")]
    RetryBudgetExhausted {
        node: String,
        attempts: u32,
        last: Box<SluiceError>,
    },

    #[error("Join unsatisfied: none of {upstream} upstream branches succeeded")]
    JoinUnsatisfied { upstream: usize },

    #[error("Run cancelled")]
    Cancelled,

    // Graph errors
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("A run of pipeline '{0}' is already active")]
    RunAlreadyActive(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a [`SluiceError`], carried in run results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TimeoutExceeded,
    CapabilityError,
    LoadError,
    QueryError,
    RetryBudgetExhausted,
    JoinUnsatisfied,
    Cancelled,
    InvalidGraph,
    RunAlreadyActive,
    Config,
    Internal,
}

impl SluiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TimeoutExceeded { .. } => ErrorKind::TimeoutExceeded,
            Self::Capability(_) => ErrorKind::CapabilityError,
            Self::Load(_) => ErrorKind::LoadError,
            Self::Query(_) => ErrorKind::QueryError,
            Self::RetryBudgetExhausted { .. } => ErrorKind::RetryBudgetExhausted,
            Self::JoinUnsatisfied { .. } => ErrorKind::JoinUnsatisfied,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InvalidGraph(_) => ErrorKind::InvalidGraph,
            Self::RunAlreadyActive(_) => ErrorKind::RunAlreadyActive,
            Self::Config(_) | Self::ConfigNotFound(_) => ErrorKind::Config,
            Self::Database(_) | Self::Io(_) => ErrorKind::Internal,
        }
    }

    /// Kind of the underlying error, looking through retry exhaustion.
    pub fn root_kind(&self) -> ErrorKind {
        match self {
            Self::RetryBudgetExhausted { last, .. } => last.root_kind(),
            other => other.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SluiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_kind_unwraps_exhaustion() {
        let err = SluiceError::RetryBudgetExhausted {
            node: "check_source".into(),
            attempts: 2,
            last: Box::new(SluiceError::TimeoutExceeded {
                target: "bkt/data.csv".into(),
                timeout_secs: 300,
                attempts: 10,
            }),
        };
        assert_eq!(err.kind(), ErrorKind::RetryBudgetExhausted);
        assert_eq!(err.root_kind(), ErrorKind::TimeoutExceeded);
    }

    #[test]
    fn test_display_includes_context() {
        let err = SluiceError::TimeoutExceeded {
            target: "bkt/data.csv".into(),
            timeout_secs: 300,
            attempts: 10,
        };
        let s = err.to_string();
        assert!(s.contains("10 polls"));
        assert!(s.contains("bkt/data.csv"));
    }
}
