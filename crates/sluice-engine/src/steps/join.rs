use futures::future::BoxFuture;
use tracing::{info, warn};

use sluice_core::error::{Result, SluiceError};
use sluice_core::types::{JoinPolicy, NodeState};

use crate::step::{Step, StepContext};

/// Terminal node converging every partition branch.
///
/// The scheduler decides when the barrier is dispatched; the barrier itself
/// only checks the upstream snapshot against the graph's join policy.
#[derive(Debug, Default)]
pub struct JoinBarrier;

impl JoinBarrier {
    pub fn new() -> Self {
        Self
    }
}

impl Step for JoinBarrier {
    fn run<'a>(&'a self, ctx: &'a StepContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let policy = ctx.join_policy;
            let total = ctx.upstream.len();
            let succeeded = ctx
                .upstream
                .iter()
                .filter(|u| u.state == NodeState::Succeeded)
                .count();

            let satisfied = match policy {
                JoinPolicy::Strict => succeeded == total,
                JoinPolicy::BestEffort => succeeded > 0 || total == 0,
            };
            if !satisfied {
                warn!(node = %ctx.node, succeeded, total, policy = %policy, "Join unsatisfied");
                return Err(SluiceError::JoinUnsatisfied { upstream: total });
            }

            info!(node = %ctx.node, succeeded, total, policy = %policy, "All branches joined");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::UpstreamStatus;
    use sluice_core::types::{NodeKind, RunId};
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn ctx(policy: JoinPolicy, states: &[NodeState]) -> StepContext {
        StepContext {
            run_id: RunId(1),
            node: "success".into(),
            kind: NodeKind::Join,
            attempt: 1,
            dispatch_id: Uuid::new_v4(),
            partition: None,
            upstream: states
                .iter()
                .enumerate()
                .map(|(i, s)| UpstreamStatus {
                    node: format!("create_view_{}", i),
                    state: *s,
                })
                .collect(),
            join_policy: policy,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_strict_requires_all() {
        let join = JoinBarrier::new();
        let strict = |states: &[NodeState]| ctx(JoinPolicy::Strict, states);
        join.run(&strict(&[NodeState::Succeeded, NodeState::Succeeded]))
            .await
            .unwrap();
        let err = join
            .run(&strict(&[NodeState::Succeeded, NodeState::Failed]))
            .await
            .unwrap_err();
        assert!(matches!(err, SluiceError::JoinUnsatisfied { upstream: 2 }));
    }

    #[tokio::test]
    async fn test_best_effort_needs_one() {
        let join = JoinBarrier::new();
        let best_effort = |states: &[NodeState]| ctx(JoinPolicy::BestEffort, states);
        join.run(&best_effort(&[NodeState::Failed, NodeState::Succeeded]))
            .await
            .unwrap();
        assert!(join
            .run(&best_effort(&[NodeState::Failed, NodeState::Pending]))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_policy_follows_context() {
        let join = JoinBarrier::new();
        let states = [NodeState::Succeeded, NodeState::Failed];
        assert!(join.run(&ctx(JoinPolicy::Strict, &states)).await.is_err());
        join.run(&ctx(JoinPolicy::BestEffort, &states)).await.unwrap();
    }
}
