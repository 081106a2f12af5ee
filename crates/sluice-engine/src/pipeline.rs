use std::collections::BTreeMap;
use std::sync::Arc;

use sluice_core::config::PipelineConfig;
use sluice_core::error::{Result, SluiceError};
use sluice_core::traits::{BulkLoad, ExistenceCheck, QueryExecutor};
use sluice_core::types::{NodeKind, PartitionKey, TableRef};

use crate::graph::{GraphTemplate, TemplateNode};
use crate::steps::{
    JoinBarrier, LoadStep, PartitionPipeline, ProjectStep, Projection, TransformStep, WaitStep,
};

pub const WAIT_NODE: &str = "check_file_exists";
pub const LOAD_NODE: &str = "load_source";
pub const JOIN_NODE: &str = "success";

pub fn transform_node(key: &PartitionKey) -> String {
    format!("create_table_{}", key.slug())
}

pub fn project_node(key: &PartitionKey) -> String {
    format!("create_view_{}", key.slug())
}

/// External services a pipeline's steps call into.
#[derive(Clone)]
pub struct Capabilities {
    pub storage: Arc<dyn ExistenceCheck>,
    pub loader: Arc<dyn BulkLoad>,
    pub queries: Arc<dyn QueryExecutor>,
}

impl Capabilities {
    pub fn new(
        storage: Arc<dyn ExistenceCheck>,
        loader: Arc<dyn BulkLoad>,
        queries: Arc<dyn QueryExecutor>,
    ) -> Self {
        Self {
            storage,
            loader,
            queries,
        }
    }
}

/// The ingest pipeline definition: wait for the source object, load it,
/// fan out per partition, join.
pub struct IngestPipeline {
    config: PipelineConfig,
    caps: Capabilities,
}

impl IngestPipeline {
    pub fn new(config: PipelineConfig, caps: Capabilities) -> Self {
        Self { config, caps }
    }

    pub fn name(&self) -> &str {
        &self.config.pipeline.name
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Partition keys configured for the pipeline.
    pub fn default_partitions(&self) -> Vec<PartitionKey> {
        self.config.partition_keys()
    }

    fn qualify(&self, table: TableRef) -> TableRef {
        table.in_project(self.config.warehouse.project.clone())
    }

    /// Build the `key → PartitionPipeline` map for one graph.
    pub fn partition_pipelines(
        &self,
        partitions: &[PartitionKey],
    ) -> Result<BTreeMap<PartitionKey, Arc<PartitionPipeline>>> {
        let source = self.config.load_destination()?;
        let projection = Projection {
            columns: self.config.project.columns.clone(),
            filter: self.config.project.filter.clone(),
        };

        let mut map = BTreeMap::new();
        for key in partitions {
            if key.as_str().trim().is_empty() {
                return Err(SluiceError::InvalidGraph("empty partition key".into()));
            }
            let slug = key.slug();
            let pipeline = PartitionPipeline {
                key: key.clone(),
                source: source.clone(),
                partition_column: self.config.transform.partition_column.clone(),
                table: self.qualify(TableRef::new(
                    &self.config.transform.dataset,
                    format!("{}{}", slug, self.config.transform.table_suffix),
                )),
                view: self.qualify(TableRef::new(
                    &self.config.project.dataset,
                    format!("{}{}", slug, self.config.project.view_suffix),
                )),
                projection: projection.clone(),
            };
            if map.insert(key.clone(), Arc::new(pipeline)).is_some() {
                return Err(SluiceError::InvalidGraph(format!(
                    "duplicate partition key '{}'",
                    key
                )));
            }
        }
        Ok(map)
    }

    /// Build the graph template for a set of partition keys.
    ///
    /// With no partitions the join hangs directly off the load.
    pub fn template(&self, partitions: &[PartitionKey]) -> Result<GraphTemplate> {
        let retries = self.config.pipeline.retries;
        let branches = self.partition_pipelines(partitions)?;

        let mut graph =
            GraphTemplate::new(self.name()).with_join_policy(self.config.pipeline.join_policy);

        let wait = WaitStep::new(
            self.caps.storage.clone(),
            self.config.source_location(),
            self.config.poll_timeout(),
            self.config.poll_interval(),
        );
        // The waiter owns its polling budget; a timeout or capability error
        // ends the wait for good.
        graph.add_node(
            TemplateNode::new(WAIT_NODE, NodeKind::Wait, Arc::new(wait)).with_retries(0),
        );

        let load = LoadStep::new(
            self.caps.loader.clone(),
            self.config.source_location(),
            self.config.load_destination()?,
            self.config.load_options(),
        );
        graph.add_node(
            TemplateNode::new(LOAD_NODE, NodeKind::Load, Arc::new(load))
                .after(WAIT_NODE)
                .with_retries(retries),
        );

        // Declaration order follows the caller's partition order.
        let mut join_upstream = Vec::with_capacity(partitions.len());
        for key in partitions {
            let Some(branch) = branches.get(key) else {
                continue;
            };
            let transform = TransformStep::new(branch.clone(), self.caps.queries.clone());
            let project = ProjectStep::new(branch.clone(), self.caps.queries.clone());
            let transform_name = transform_node(key);
            let project_name = project_node(key);

            graph.add_node(
                TemplateNode::new(&transform_name, NodeKind::Transform, Arc::new(transform))
                    .after(LOAD_NODE)
                    .with_partition(key.clone())
                    .with_retries(retries),
            );
            graph.add_node(
                TemplateNode::new(&project_name, NodeKind::Project, Arc::new(project))
                    .after(&transform_name)
                    .with_partition(key.clone())
                    .with_retries(retries),
            );
            join_upstream.push(project_name);
        }
        if join_upstream.is_empty() {
            join_upstream.push(LOAD_NODE.to_string());
        }

        let join = JoinBarrier::new();
        graph.add_node(
            TemplateNode::new(JOIN_NODE, NodeKind::Join, Arc::new(join))
                .after_all(join_upstream)
                .with_retries(retries),
        );

        graph.validate()?;
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::types::JoinPolicy;
    use sluice_test_utils::{test_config, FakeServices};

    fn caps() -> Capabilities {
        let fakes = FakeServices::new();
        Capabilities::new(fakes.existence, fakes.loader, fakes.queries)
    }

    fn pipeline(partitions: &[&str]) -> IngestPipeline {
        IngestPipeline::new(test_config(partitions), caps())
    }

    fn keys(names: &[&str]) -> Vec<PartitionKey> {
        names.iter().map(|n| PartitionKey::new(*n)).collect()
    }

    #[test]
    fn test_template_shape() {
        let p = pipeline(&["USA", "India"]);
        let graph = p.template(&p.default_partitions()).unwrap();
        let names: Vec<&str> = graph.nodes().iter().map(|n| n.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "check_file_exists",
                "load_source",
                "create_table_usa",
                "create_view_usa",
                "create_table_india",
                "create_view_india",
                "success",
            ]
        );
        let join = graph.node(JOIN_NODE).unwrap();
        assert_eq!(join.upstream, vec!["create_view_usa", "create_view_india"]);
        assert_eq!(graph.node(WAIT_NODE).unwrap().retries, 0);
        assert!(graph
            .nodes()
            .iter()
            .filter(|n| n.name != WAIT_NODE)
            .all(|n| n.retries == 1));
    }

    #[test]
    fn test_zero_partitions_join_after_load() {
        let p = pipeline(&[]);
        let graph = p.template(&[]).unwrap();
        assert_eq!(graph.nodes().len(), 3);
        assert_eq!(graph.node(JOIN_NODE).unwrap().upstream, vec![LOAD_NODE]);
    }

    #[test]
    fn test_partition_tables() {
        let p = pipeline(&["USA"]);
        let branches = p.partition_pipelines(&keys(&["USA"])).unwrap();
        let usa = &branches[&PartitionKey::new("USA")];
        assert_eq!(usa.table.to_string(), "transform_dataset.usa_table");
        assert_eq!(usa.view.to_string(), "reporting_dataset.usa_view");
        assert_eq!(usa.source.to_string(), "staging_dataset.global_data");
        assert_eq!(usa.partition_column, "country");
    }

    #[test]
    fn test_warehouse_project_applied() {
        let mut config = test_config(&["USA"]);
        config.warehouse.project = Some("health-project".into());
        let p = IngestPipeline::new(config, caps());
        let branches = p.partition_pipelines(&keys(&["USA"])).unwrap();
        let usa = &branches[&PartitionKey::new("USA")];
        assert_eq!(usa.table.to_string(), "health-project.transform_dataset.usa_table");
        assert_eq!(usa.source.to_string(), "health-project.staging_dataset.global_data");
    }

    #[test]
    fn test_duplicate_partition_rejected() {
        let p = pipeline(&[]);
        assert!(p.template(&keys(&["USA", "USA"])).is_err());
        // Distinct keys that collide on node names.
        assert!(p.template(&keys(&["new york", "new-york"])).is_err());
    }

    #[test]
    fn test_join_policy_from_config() {
        let mut config = test_config(&["USA"]);
        config.pipeline.join_policy = JoinPolicy::BestEffort;
        let p = IngestPipeline::new(config, caps());
        assert_eq!(p.template(&keys(&["USA"])).unwrap().join_policy(), JoinPolicy::BestEffort);
    }
}
