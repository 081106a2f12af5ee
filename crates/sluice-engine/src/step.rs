use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sluice_core::error::Result;
use sluice_core::types::{JoinPolicy, NodeKind, NodeState, PartitionKey, RunId};

/// State of one upstream node at the moment a step was dispatched.
#[derive(Debug, Clone)]
pub struct UpstreamStatus {
    pub node: String,
    pub state: NodeState,
}

/// Everything a step sees about the dispatch it is running in.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: RunId,
    pub node: String,
    pub kind: NodeKind,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Unique id of this dispatch, for correlating logs.
    pub dispatch_id: Uuid,
    pub partition: Option<PartitionKey>,
    pub upstream: Vec<UpstreamStatus>,
    /// Join policy of the graph being executed.
    pub join_policy: JoinPolicy,
    pub cancel: CancellationToken,
}

/// The single contract every node kind implements.
///
/// The scheduler only depends on this trait; what a node does (poll storage,
/// bulk load, run SQL, join) lives entirely in the implementation.
pub trait Step: Send + Sync + 'static {
    fn run<'a>(&'a self, ctx: &'a StepContext) -> BoxFuture<'a, Result<()>>;
}
