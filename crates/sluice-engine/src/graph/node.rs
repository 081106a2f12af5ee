use std::sync::Arc;

use sluice_core::types::{NodeKind, PartitionKey};

use crate::step::Step;

/// A node in a graph template: identity, wiring, retry budget, and the step
/// that does the work.
#[derive(Clone)]
pub struct TemplateNode {
    /// Unique name within the template.
    pub name: String,
    pub kind: NodeKind,
    /// Present only for Transform/Project nodes.
    pub partition: Option<PartitionKey>,
    /// Names of nodes that must succeed first.
    pub upstream: Vec<String>,
    /// Retries after the first attempt.
    pub retries: u32,
    pub step: Arc<dyn Step>,
}

impl TemplateNode {
    /// Create a node with no upstream and the default retry budget.
    pub fn new(name: impl Into<String>, kind: NodeKind, step: Arc<dyn Step>) -> Self {
        Self {
            name: name.into(),
            kind,
            partition: None,
            upstream: vec![],
            retries: 1,
            step,
        }
    }

    /// Add an upstream dependency.
    pub fn after(mut self, upstream: impl Into<String>) -> Self {
        self.upstream.push(upstream.into());
        self
    }

    /// Add several upstream dependencies.
    pub fn after_all<I, S>(mut self, upstream: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.upstream.extend(upstream.into_iter().map(Into::into));
        self
    }

    pub fn with_partition(mut self, key: PartitionKey) -> Self {
        self.partition = Some(key);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

impl std::fmt::Debug for TemplateNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateNode")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("partition", &self.partition)
            .field("upstream", &self.upstream)
            .field("retries", &self.retries)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::JoinBarrier;

    #[test]
    fn test_node_builder() {
        let step = Arc::new(JoinBarrier::new());
        let node = TemplateNode::new("create_view_usa", NodeKind::Project, step)
            .after("create_table_usa")
            .with_partition(PartitionKey::new("USA"))
            .with_retries(3);

        assert_eq!(node.name, "create_view_usa");
        assert_eq!(node.upstream, vec!["create_table_usa"]);
        assert_eq!(node.partition.as_ref().map(|p| p.as_str()), Some("USA"));
        assert_eq!(node.retries, 3);
        assert!(format!("{:?}", node).contains("create_view_usa"));
    }

    #[test]
    fn test_after_all() {
        let step = Arc::new(JoinBarrier::new());
        let node = TemplateNode::new("success", NodeKind::Join, step).after_all(["a", "b"]);
        assert_eq!(node.upstream, vec!["a", "b"]);
        assert_eq!(node.retries, 1);
    }
}
