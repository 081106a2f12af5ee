use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use sluice_core::error::{Result, SluiceError};
use sluice_core::event::EventBus;
use sluice_core::types::{NodeState, PartitionKey, RunEvent};

use crate::graph::GraphTemplate;
use crate::pipeline::IngestPipeline;
use crate::run::{RunResult, RunState};
use crate::step::StepContext;

static GLOBAL_ACTIVE_RUNS: OnceLock<ActiveRuns> = OnceLock::new();

/// Names of pipelines with a run in progress.
#[derive(Clone, Default)]
pub struct ActiveRuns {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl ActiveRuns {
    /// A registry of its own, not shared with [`ActiveRuns::global`].
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry every [`GraphScheduler::new`] uses.
    pub fn global() -> Self {
        GLOBAL_ACTIVE_RUNS.get_or_init(Self::new).clone()
    }

    /// Claim `pipeline`, failing if a run of it is already active.
    pub fn acquire(&self, pipeline: &str) -> Result<ActiveRunGuard> {
        let mut active = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(pipeline.to_string()) {
            return Err(SluiceError::RunAlreadyActive(pipeline.to_string()));
        }
        Ok(ActiveRunGuard {
            runs: self.clone(),
            pipeline: pipeline.to_string(),
        })
    }

    pub fn is_active(&self, pipeline: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(pipeline)
    }
}

/// Releases the pipeline claim on drop.
pub struct ActiveRunGuard {
    runs: ActiveRuns,
    pipeline: String,
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        self.runs
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.pipeline);
    }
}

type Outcome = (usize, Result<()>);

/// Executes graph templates: dispatches every ready node concurrently,
/// retries failures within their budget, and stops at the first quiet point
/// where nothing is running and nothing else can start.
pub struct GraphScheduler {
    event_bus: Arc<EventBus>,
    active: ActiveRuns,
}

impl GraphScheduler {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            event_bus,
            active: ActiveRuns::global(),
        }
    }

    /// Replace the process-wide overlap guard with `active`.
    pub fn with_active_runs(mut self, active: ActiveRuns) -> Self {
        self.active = active;
        self
    }

    pub fn active_runs(&self) -> &ActiveRuns {
        &self.active
    }

    pub async fn execute(&self, template: &GraphTemplate) -> Result<RunResult> {
        self.execute_with_cancel(template, CancellationToken::new())
            .await
    }

    /// Build the pipeline's graph for `partitions` and execute it.
    pub async fn execute_pipeline(
        &self,
        pipeline: &IngestPipeline,
        partitions: &[PartitionKey],
    ) -> Result<RunResult> {
        let template = pipeline.template(partitions)?;
        self.execute(&template).await
    }

    /// Execute `template` until it settles or `cancel` fires.
    ///
    /// Only an invalid template or an overlapping run is an `Err`; node
    /// failures are reported in the [`RunResult`].
    pub async fn execute_with_cancel(
        &self,
        template: &GraphTemplate,
        cancel: CancellationToken,
    ) -> Result<RunResult> {
        template.validate()?;
        let _guard = self.active.acquire(template.name())?;
        let mut run = RunState::new(template)?;

        info!(
            run_id = %run.run_id,
            pipeline = %template.name(),
            nodes = template.nodes().len(),
            policy = %template.join_policy(),
            "Run started"
        );
        self.event_bus.publish(RunEvent::RunStarted {
            run_id: run.run_id,
            pipeline: template.name().to_string(),
            nodes: template.nodes().len(),
            started_at: run.started_at(),
        });

        let mut inflight: FuturesUnordered<BoxFuture<'static, Outcome>> = FuturesUnordered::new();
        let mut aborted = false;

        loop {
            if cancel.is_cancelled() {
                aborted = true;
                break;
            }

            for i in run.ready_nodes() {
                self.set_state(&mut run, template, i, NodeState::Ready);
                inflight.push(self.dispatch(&mut run, template, i, &cancel));
            }

            if inflight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    aborted = true;
                    break;
                }
                Some((i, outcome)) = inflight.next() => {
                    self.settle(&mut run, template, i, outcome, &cancel, &mut inflight);
                }
            }
        }

        if aborted {
            warn!(run_id = %run.run_id, in_flight = inflight.len(), "Run cancelled");
            drop(inflight);
            for i in run.unfinished() {
                self.set_state(&mut run, template, i, NodeState::Cancelled);
            }
        }

        let result = run.into_result(aborted);
        info!(
            run_id = %result.run_id,
            status = %result.status,
            failed = result.failures.len(),
            blocked = result.blocked.len(),
            elapsed_ms = result.elapsed_ms,
            "Run finished"
        );
        self.event_bus.publish(RunEvent::RunFinished {
            run_id: result.run_id,
            pipeline: result.pipeline.clone(),
            succeeded: result.succeeded(),
            elapsed_ms: result.elapsed_ms,
        });
        Ok(result)
    }

    /// Move node `i` to Running and build its step future.
    fn dispatch(
        &self,
        run: &mut RunState<'_>,
        template: &GraphTemplate,
        i: usize,
        cancel: &CancellationToken,
    ) -> BoxFuture<'static, Outcome> {
        self.set_state(run, template, i, NodeState::Running);

        let node = &template.nodes()[i];
        let ctx = StepContext {
            run_id: run.run_id,
            node: node.name.clone(),
            kind: node.kind,
            attempt: run.attempts(i),
            dispatch_id: Uuid::new_v4(),
            partition: node.partition.clone(),
            upstream: run.upstream_status(i),
            join_policy: template.join_policy(),
            cancel: cancel.child_token(),
        };
        info!(
            run_id = %ctx.run_id,
            node = %ctx.node,
            kind = %ctx.kind,
            attempt = ctx.attempt,
            dispatch_id = %ctx.dispatch_id,
            "Dispatching node"
        );

        let step = node.step.clone();
        async move {
            let outcome = step.run(&ctx).await;
            (i, outcome)
        }
        .boxed()
    }

    /// Apply one step outcome: succeed, retry, or fail for good.
    fn settle(
        &self,
        run: &mut RunState<'_>,
        template: &GraphTemplate,
        i: usize,
        outcome: Result<()>,
        cancel: &CancellationToken,
        inflight: &mut FuturesUnordered<BoxFuture<'static, Outcome>>,
    ) {
        let name = &template.nodes()[i].name;
        let attempt = run.attempts(i);

        let err = match outcome {
            Ok(()) => {
                self.set_state(run, template, i, NodeState::Succeeded);
                return;
            }
            Err(e) => e,
        };

        warn!(run_id = %run.run_id, node = %name, attempt, error = %err, "Node attempt failed");
        self.event_bus.publish(RunEvent::NodeAttemptFailed {
            run_id: run.run_id,
            node: name.clone(),
            attempt,
            kind: err.kind(),
            message: err.to_string(),
        });
        self.set_state(run, template, i, NodeState::Failed);

        if is_retryable(&err) && run.take_retry(i) {
            self.set_state(run, template, i, NodeState::Retrying);
            inflight.push(self.dispatch(run, template, i, cancel));
            return;
        }

        let err = if is_retryable(&err) {
            SluiceError::RetryBudgetExhausted {
                node: name.clone(),
                attempts: attempt,
                last: Box::new(err),
            }
        } else {
            err
        };
        error!(run_id = %run.run_id, node = %name, error = %err, "Node failed");
        run.record_failure(i, err);
    }

    fn set_state(&self, run: &mut RunState<'_>, template: &GraphTemplate, i: usize, to: NodeState) {
        let from = run.transition(i, to);
        let node = &template.nodes()[i].name;
        debug!(run_id = %run.run_id, node = %node, from = %from, to = %to, "Node state changed");
        self.event_bus.publish(RunEvent::NodeStateChanged {
            run_id: run.run_id,
            node: node.clone(),
            from,
            to,
            attempt: run.attempts(i),
        });
    }
}

/// Cancellation, an unsatisfied join and an expired wait are final; everything
/// else may be retried within the node's budget.
fn is_retryable(err: &SluiceError) -> bool {
    !matches!(
        err,
        SluiceError::Cancelled
            | SluiceError::JoinUnsatisfied { .. }
            | SluiceError::TimeoutExceeded { .. }
    )
}
