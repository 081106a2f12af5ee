use std::collections::{HashMap, HashSet, VecDeque};

use sluice_core::error::{Result, SluiceError};
use sluice_core::types::{JoinPolicy, NodeKind};

use super::edge::Edge;
use super::node::TemplateNode;

/// Static graph of a pipeline: nodes plus the edges implied by their
/// upstream lists. Validated before every run.
#[derive(Debug, Clone)]
pub struct GraphTemplate {
    name: String,
    join_policy: JoinPolicy,
    nodes: Vec<TemplateNode>,
}

impl GraphTemplate {
    /// Create an empty template. `name` identifies the pipeline definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            join_policy: JoinPolicy::default(),
            nodes: Vec::new(),
        }
    }

    pub fn with_join_policy(mut self, policy: JoinPolicy) -> Self {
        self.join_policy = policy;
        self
    }

    pub fn add_node(&mut self, node: TemplateNode) -> &mut Self {
        self.nodes.push(node);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn join_policy(&self) -> JoinPolicy {
        self.join_policy
    }

    pub fn nodes(&self) -> &[TemplateNode] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&TemplateNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Explicit edge list, in node declaration order.
    pub fn edges(&self) -> Vec<Edge> {
        self.nodes
            .iter()
            .flat_map(|n| n.upstream.iter().map(move |u| Edge::new(u.clone(), n.name.clone())))
            .collect()
    }

    /// Nodes nothing depends on.
    pub fn sinks(&self) -> Vec<&TemplateNode> {
        let referenced: HashSet<&str> = self
            .nodes
            .iter()
            .flat_map(|n| n.upstream.iter().map(String::as_str))
            .collect();
        self.nodes
            .iter()
            .filter(|n| !referenced.contains(n.name.as_str()))
            .collect()
    }

    /// Check the structural invariants:
    ///
    /// - node names are unique and every upstream exists
    /// - exactly one root, every other node has an upstream
    /// - the graph is acyclic
    /// - partition keys appear exactly on Transform/Project nodes
    /// - at most one Join, which is the only sink and depends on exactly the
    ///   Project nodes (or, with no Project nodes, on something)
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(invalid("graph has no nodes"));
        }

        let mut names = HashSet::new();
        for node in &self.nodes {
            if node.name.is_empty() {
                return Err(invalid("node name must not be empty"));
            }
            if !names.insert(node.name.as_str()) {
                return Err(invalid(format!("duplicate node '{}'", node.name)));
            }
        }

        for node in &self.nodes {
            let mut seen = HashSet::new();
            for up in &node.upstream {
                if up == &node.name {
                    return Err(invalid(format!("node '{}' depends on itself", node.name)));
                }
                if !names.contains(up.as_str()) {
                    return Err(invalid(format!(
                        "node '{}' depends on unknown node '{}'",
                        node.name, up
                    )));
                }
                if !seen.insert(up.as_str()) {
                    return Err(invalid(format!(
                        "node '{}' lists upstream '{}' twice",
                        node.name, up
                    )));
                }
            }
            match (node.kind.is_partitioned(), &node.partition) {
                (true, None) => {
                    return Err(invalid(format!(
                        "{} node '{}' has no partition key",
                        node.kind, node.name
                    )))
                }
                (false, Some(_)) => {
                    return Err(invalid(format!(
                        "{} node '{}' must not carry a partition key",
                        node.kind, node.name
                    )))
                }
                _ => {}
            }
        }

        let roots: Vec<&str> = self
            .nodes
            .iter()
            .filter(|n| n.upstream.is_empty())
            .map(|n| n.name.as_str())
            .collect();
        if roots.len() != 1 {
            return Err(invalid(format!(
                "graph must have exactly one root, found {:?}",
                roots
            )));
        }

        self.topological_order()?;
        self.validate_join()
    }

    fn validate_join(&self) -> Result<()> {
        let joins: Vec<&TemplateNode> = self
            .nodes
            .iter()
            .filter(|n| n.kind == NodeKind::Join)
            .collect();
        let join = match joins.as_slice() {
            [] => return Ok(()),
            [join] => *join,
            _ => return Err(invalid("graph has more than one join node")),
        };

        let projects: HashSet<&str> = self
            .nodes
            .iter()
            .filter(|n| n.kind == NodeKind::Project)
            .map(|n| n.name.as_str())
            .collect();
        let upstream: HashSet<&str> = join.upstream.iter().map(String::as_str).collect();
        if !projects.is_empty() && upstream != projects {
            let mut missing: Vec<&str> = projects.difference(&upstream).copied().collect();
            let mut extra: Vec<&str> = upstream.difference(&projects).copied().collect();
            missing.sort_unstable();
            extra.sort_unstable();
            return Err(invalid(format!(
                "join '{}' must depend on exactly the project nodes (missing {:?}, extra {:?})",
                join.name, missing, extra
            )));
        }

        let sinks = self.sinks();
        if sinks.len() != 1 || sinks[0].name != join.name {
            return Err(invalid(format!(
                "join '{}' must be the only sink",
                join.name
            )));
        }
        Ok(())
    }

    /// Node indices in dependency order (Kahn's algorithm). Fails on cycles.
    pub fn topological_order(&self) -> Result<Vec<usize>> {
        let index: HashMap<&str, usize> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.as_str(), i))
            .collect();

        let mut in_degree = vec![0usize; self.nodes.len()];
        let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            for up in &node.upstream {
                let &u = index
                    .get(up.as_str())
                    .ok_or_else(|| invalid(format!("unknown node '{}'", up)))?;
                downstream[u].push(i);
                in_degree[i] += 1;
            }
        }

        let mut queue: VecDeque<usize> = (0..self.nodes.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &d in &downstream[i] {
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    queue.push_back(d);
                }
            }
        }

        if order.len() != self.nodes.len() {
            let mut cyclic: Vec<&str> = (0..self.nodes.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| self.nodes[i].name.as_str())
                .collect();
            cyclic.sort_unstable();
            return Err(invalid(format!("cycle detected among {:?}", cyclic)));
        }
        Ok(order)
    }
}

fn invalid(msg: impl Into<String>) -> SluiceError {
    SluiceError::InvalidGraph(msg.into())
}
