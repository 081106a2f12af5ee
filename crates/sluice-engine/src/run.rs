use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use sluice_core::error::{ErrorKind, Result, SluiceError};
use sluice_core::types::{JoinPolicy, NodeKind, NodeState, PartitionKey, RunId};

use crate::graph::GraphTemplate;
use crate::step::UpstreamStatus;

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every sink succeeded and nothing failed.
    Succeeded,
    /// The join succeeded under best-effort policy but some branches failed.
    PartiallySucceeded,
    Failed,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Succeeded => "succeeded",
            Self::PartiallySucceeded => "partially_succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Final state of one node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeOutcome {
    pub name: String,
    pub kind: NodeKind,
    pub partition: Option<PartitionKey>,
    pub state: NodeState,
    /// Dispatches, including retries. Zero if never dispatched.
    pub attempts: u32,
    pub elapsed_ms: u64,
}

/// A node that ended `Failed`.
#[derive(Debug, Clone, Serialize)]
pub struct NodeFailure {
    pub node: String,
    /// Root error kind, looking through retry exhaustion.
    pub kind: ErrorKind,
    pub attempts: u32,
    pub message: String,
}

/// Result of executing a graph template once.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub pipeline: String,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub status: RunStatus,
    /// Per-node outcomes in template order.
    pub nodes: Vec<NodeOutcome>,
    /// Terminal failures in the order they happened.
    pub failures: Vec<NodeFailure>,
    /// Nodes never dispatched because an upstream failed.
    pub blocked: Vec<String>,
    pub cancelled: Vec<String>,
}

impl RunResult {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn state_of(&self, node: &str) -> Option<NodeState> {
        self.nodes.iter().find(|n| n.name == node).map(|n| n.state)
    }

    pub fn attempts_of(&self, node: &str) -> Option<u32> {
        self.nodes.iter().find(|n| n.name == node).map(|n| n.attempts)
    }

    /// Root error kind of the first terminal failure.
    pub fn cause(&self) -> Option<ErrorKind> {
        self.failures.first().map(|f| f.kind)
    }
}

struct NodeRecord {
    state: NodeState,
    attempts: u32,
    retries_left: u32,
    error: Option<SluiceError>,
    first_dispatch: Option<Instant>,
    elapsed_ms: u64,
}

/// Mutable state of a single run. Owned and mutated only by the scheduler loop.
pub(crate) struct RunState<'t> {
    template: &'t GraphTemplate,
    pub(crate) run_id: RunId,
    started_at: DateTime<Utc>,
    started: Instant,
    records: Vec<NodeRecord>,
    upstream: Vec<Vec<usize>>,
    order: Vec<usize>,
    failure_order: Vec<usize>,
}

impl<'t> RunState<'t> {
    pub(crate) fn new(template: &'t GraphTemplate) -> Result<Self> {
        let order = template.topological_order()?;
        let index: HashMap<&str, usize> = template
            .nodes()
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.as_str(), i))
            .collect();

        let mut upstream = Vec::with_capacity(template.nodes().len());
        for node in template.nodes() {
            let ups = node
                .upstream
                .iter()
                .map(|u| {
                    index.get(u.as_str()).copied().ok_or_else(|| {
                        SluiceError::InvalidGraph(format!("unknown node '{}'", u))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            upstream.push(ups);
        }

        let records = template
            .nodes()
            .iter()
            .map(|n| NodeRecord {
                state: NodeState::Pending,
                attempts: 0,
                retries_left: n.retries,
                error: None,
                first_dispatch: None,
                elapsed_ms: 0,
            })
            .collect();

        Ok(Self {
            template,
            run_id: RunId::next(),
            started_at: Utc::now(),
            started: Instant::now(),
            records,
            upstream,
            order,
            failure_order: Vec::new(),
        })
    }

    pub(crate) fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub(crate) fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub(crate) fn attempts(&self, i: usize) -> u32 {
        self.records[i].attempts
    }

    /// Move node `i` to `to`, returning the previous state.
    pub(crate) fn transition(&mut self, i: usize, to: NodeState) -> NodeState {
        let record = &mut self.records[i];
        let from = record.state;
        debug_assert!(is_legal(from, to), "illegal transition {} -> {}", from, to);
        record.state = to;

        match to {
            NodeState::Running => {
                record.attempts += 1;
                record.first_dispatch.get_or_insert_with(Instant::now);
            }
            NodeState::Succeeded | NodeState::Failed | NodeState::Cancelled => {
                if let Some(t) = record.first_dispatch {
                    record.elapsed_ms = t.elapsed().as_millis() as u64;
                }
            }
            _ => {}
        }
        from
    }

    /// Consume one retry if any remain.
    pub(crate) fn take_retry(&mut self, i: usize) -> bool {
        let record = &mut self.records[i];
        if record.retries_left > 0 {
            record.retries_left -= 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn record_failure(&mut self, i: usize, error: SluiceError) {
        self.records[i].error = Some(error);
        self.failure_order.push(i);
    }

    /// Upstream snapshot handed to a step at dispatch time.
    pub(crate) fn upstream_status(&self, i: usize) -> Vec<UpstreamStatus> {
        self.upstream[i]
            .iter()
            .map(|&u| UpstreamStatus {
                node: self.template.nodes()[u].name.clone(),
                state: self.records[u].state,
            })
            .collect()
    }

    fn is_best_effort_join(&self, i: usize) -> bool {
        self.template.nodes()[i].kind == NodeKind::Join
            && self.template.join_policy() == JoinPolicy::BestEffort
    }

    /// Nodes that can never succeed in this run: failed or cancelled, or
    /// waiting on something that can never succeed.
    fn doomed(&self) -> Vec<bool> {
        let mut doomed = vec![false; self.records.len()];
        for &i in &self.order {
            doomed[i] = match self.records[i].state {
                NodeState::Failed | NodeState::Cancelled => true,
                NodeState::Pending => {
                    let ups = &self.upstream[i];
                    if self.is_best_effort_join(i) {
                        !ups.is_empty() && ups.iter().all(|&u| doomed[u])
                    } else {
                        ups.iter().any(|&u| doomed[u])
                    }
                }
                _ => false,
            };
        }
        doomed
    }

    /// Pending nodes whose dependencies allow dispatch, in topological order.
    pub(crate) fn ready_nodes(&self) -> Vec<usize> {
        let doomed = self.doomed();
        self.order
            .iter()
            .copied()
            .filter(|&i| self.records[i].state == NodeState::Pending)
            .filter(|&i| {
                let ups = &self.upstream[i];
                let succeeded = |u: &usize| self.records[*u].state == NodeState::Succeeded;
                if self.is_best_effort_join(i) {
                    ups.iter().all(|u| succeeded(u) || doomed[*u])
                        && (ups.is_empty() || ups.iter().any(succeeded))
                } else {
                    ups.iter().all(succeeded)
                }
            })
            .collect()
    }

    /// Indices of nodes not yet in a terminal state.
    pub(crate) fn unfinished(&self) -> Vec<usize> {
        (0..self.records.len())
            .filter(|&i| !self.records[i].state.is_terminal())
            .collect()
    }

    pub(crate) fn into_result(mut self, aborted: bool) -> RunResult {
        let nodes = self.template.nodes();

        let failures = std::mem::take(&mut self.failure_order)
            .into_iter()
            .filter_map(|i| {
                let record = &self.records[i];
                record.error.as_ref().map(|e| NodeFailure {
                    node: nodes[i].name.clone(),
                    kind: e.root_kind(),
                    attempts: record.attempts,
                    message: e.to_string(),
                })
            })
            .collect::<Vec<_>>();

        let names_in = |state: NodeState| -> Vec<String> {
            nodes
                .iter()
                .zip(&self.records)
                .filter(|(_, r)| r.state == state)
                .map(|(n, _)| n.name.clone())
                .collect()
        };
        let blocked = names_in(NodeState::Pending);
        let cancelled = names_in(NodeState::Cancelled);

        let sinks_ok = self
            .template
            .sinks()
            .iter()
            .all(|s| self.state_by_name(&s.name) == Some(NodeState::Succeeded));
        let status = if aborted {
            RunStatus::Cancelled
        } else if sinks_ok && failures.is_empty() {
            RunStatus::Succeeded
        } else if sinks_ok {
            RunStatus::PartiallySucceeded
        } else {
            RunStatus::Failed
        };

        let outcomes = nodes
            .iter()
            .zip(&self.records)
            .map(|(n, r)| NodeOutcome {
                name: n.name.clone(),
                kind: n.kind,
                partition: n.partition.clone(),
                state: r.state,
                attempts: r.attempts,
                elapsed_ms: r.elapsed_ms,
            })
            .collect();

        RunResult {
            run_id: self.run_id,
            pipeline: self.template.name().to_string(),
            started_at: self.started_at,
            elapsed_ms: self.elapsed_ms(),
            status,
            nodes: outcomes,
            failures,
            blocked,
            cancelled,
        }
    }

    fn state_by_name(&self, name: &str) -> Option<NodeState> {
        self.template
            .nodes()
            .iter()
            .position(|n| n.name == name)
            .map(|i| self.records[i].state)
    }
}

fn is_legal(from: NodeState, to: NodeState) -> bool {
    use NodeState::*;
    matches!(
        (from, to),
        (Pending, Ready)
            | (Ready, Running)
            | (Running, Succeeded)
            | (Running, Failed)
            | (Failed, Retrying)
            | (Retrying, Running)
            | (Pending | Ready | Running | Retrying, Cancelled)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::graph::TemplateNode;
    use crate::steps::JoinBarrier;

    fn template(policy: JoinPolicy) -> GraphTemplate {
        let step = Arc::new(JoinBarrier::new());
        let mut g = GraphTemplate::new("p").with_join_policy(policy);
        g.add_node(TemplateNode::new("wait", NodeKind::Wait, step.clone()));
        g.add_node(TemplateNode::new("load", NodeKind::Load, step.clone()).after("wait"));
        for key in ["a", "b"] {
            g.add_node(
                TemplateNode::new(format!("t_{}", key), NodeKind::Transform, step.clone())
                    .after("load")
                    .with_partition(PartitionKey::new(key)),
            );
            g.add_node(
                TemplateNode::new(format!("p_{}", key), NodeKind::Project, step.clone())
                    .after(format!("t_{}", key))
                    .with_partition(PartitionKey::new(key)),
            );
        }
        g.add_node(TemplateNode::new("join", NodeKind::Join, step).after_all(["p_a", "p_b"]));
        g
    }

    fn settle(run: &mut RunState<'_>, i: usize, to: NodeState) {
        run.transition(i, NodeState::Ready);
        run.transition(i, NodeState::Running);
        run.transition(i, to);
    }

    fn names(run: &RunState<'_>, idx: Vec<usize>) -> Vec<String> {
        idx.into_iter()
            .map(|i| run.template.nodes()[i].name.clone())
            .collect()
    }

    #[test]
    fn test_ready_follows_dependencies() {
        let g = template(JoinPolicy::Strict);
        let mut run = RunState::new(&g).unwrap();
        assert_eq!(names(&run, run.ready_nodes()), vec!["wait"]);
        settle(&mut run, 0, NodeState::Succeeded);
        assert_eq!(names(&run, run.ready_nodes()), vec!["load"]);
        settle(&mut run, 1, NodeState::Succeeded);
        let mut ready = names(&run, run.ready_nodes());
        ready.sort();
        assert_eq!(ready, vec!["t_a", "t_b"]);
    }

    #[test]
    fn test_strict_join_blocked_by_failed_branch() {
        let g = template(JoinPolicy::Strict);
        let mut run = RunState::new(&g).unwrap();
        for i in [0, 1, 2, 3] {
            settle(&mut run, i, NodeState::Succeeded);
        }
        settle(&mut run, 4, NodeState::Failed);
        run.record_failure(4, SluiceError::Query("boom".into()));
        assert!(run.ready_nodes().is_empty());

        let result = run.into_result(false);
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.blocked, vec!["p_b", "join"]);
        assert_eq!(result.cause(), Some(ErrorKind::QueryError));
    }

    #[test]
    fn test_best_effort_join_waits_for_settled_branches() {
        let g = template(JoinPolicy::BestEffort);
        let mut run = RunState::new(&g).unwrap();
        for i in [0, 1, 2] {
            settle(&mut run, i, NodeState::Succeeded);
        }
        // p_a still pending, t_b failed: join must wait for p_a.
        settle(&mut run, 4, NodeState::Failed);
        assert_eq!(names(&run, run.ready_nodes()), vec!["p_a"]);
        settle(&mut run, 3, NodeState::Succeeded);
        assert_eq!(names(&run, run.ready_nodes()), vec!["join"]);
    }

    #[test]
    fn test_best_effort_join_blocked_when_nothing_succeeds() {
        let g = template(JoinPolicy::BestEffort);
        let mut run = RunState::new(&g).unwrap();
        settle(&mut run, 0, NodeState::Failed);
        assert!(run.ready_nodes().is_empty());
    }

    #[test]
    fn test_legal_transitions() {
        assert!(is_legal(NodeState::Failed, NodeState::Retrying));
        assert!(is_legal(NodeState::Running, NodeState::Cancelled));
        assert!(!is_legal(NodeState::Succeeded, NodeState::Running));
        assert!(!is_legal(NodeState::Pending, NodeState::Running));
    }
}
