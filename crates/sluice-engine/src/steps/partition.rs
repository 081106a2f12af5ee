use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::info;

use sluice_core::config::ColumnConfig;
use sluice_core::error::{Result, SluiceError};
use sluice_core::traits::QueryExecutor;
use sluice_core::types::{PartitionKey, QueryJob, QueryMode, TableRef};

use crate::step::{Step, StepContext};

/// Column subset and row predicate applied by every partition's projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    pub columns: Vec<ColumnConfig>,
    /// SQL boolean expression; `None` or blank keeps every row.
    pub filter: Option<String>,
}

/// The two-step sub-pipeline of one partition branch: materialize the
/// partition's rows as a table, then expose a projected view over it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPipeline {
    pub key: PartitionKey,
    /// Staging table the branch filters from.
    pub source: TableRef,
    pub partition_column: String,
    pub table: TableRef,
    pub view: TableRef,
    pub projection: Projection,
}

impl PartitionPipeline {
    /// `CREATE OR REPLACE TABLE` job selecting this partition's rows.
    pub fn transform_job(&self) -> QueryJob {
        let select = format!(
            "SELECT *\nFROM {}\nWHERE `{}` = '{}'",
            self.source.quoted(),
            self.partition_column,
            escape_literal(self.key.as_str())
        );
        QueryJob {
            destination: self.table.clone(),
            mode: QueryMode::CreateOrReplaceTable,
            select,
        }
    }

    /// `CREATE OR REPLACE VIEW` job projecting the partition table.
    pub fn project_job(&self) -> QueryJob {
        let columns = self
            .projection
            .columns
            .iter()
            .map(|c| format!("  `{}` AS `{}`", c.source, c.alias))
            .collect::<Vec<_>>()
            .join(",\n");
        let mut select = format!("SELECT\n{}\nFROM {}", columns, self.table.quoted());
        if let Some(filter) = self.projection.filter.as_deref().map(str::trim) {
            if !filter.is_empty() {
                select.push_str("\nWHERE ");
                select.push_str(filter);
            }
        }
        QueryJob {
            destination: self.view.clone(),
            mode: QueryMode::CreateOrReplaceView,
            select,
        }
    }
}

fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

async fn submit(
    queries: &dyn QueryExecutor,
    job: QueryJob,
    ctx: &StepContext,
) -> Result<()> {
    tokio::select! {
        _ = ctx.cancel.cancelled() => return Err(SluiceError::Cancelled),
        done = queries.execute(&job) => done?,
    }
    info!(
        node = %ctx.node,
        destination = %job.destination,
        mode = job.mode.statement_prefix(),
        attempt = ctx.attempt,
        "Query job complete"
    );
    Ok(())
}

/// First step of a partition branch.
pub struct TransformStep {
    pipeline: Arc<PartitionPipeline>,
    queries: Arc<dyn QueryExecutor>,
}

impl TransformStep {
    pub fn new(pipeline: Arc<PartitionPipeline>, queries: Arc<dyn QueryExecutor>) -> Self {
        Self { pipeline, queries }
    }
}

impl Step for TransformStep {
    fn run<'a>(&'a self, ctx: &'a StepContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(submit(self.queries.as_ref(), self.pipeline.transform_job(), ctx))
    }
}

/// Second step of a partition branch; runs after its transform.
pub struct ProjectStep {
    pipeline: Arc<PartitionPipeline>,
    queries: Arc<dyn QueryExecutor>,
}

impl ProjectStep {
    pub fn new(pipeline: Arc<PartitionPipeline>, queries: Arc<dyn QueryExecutor>) -> Self {
        Self { pipeline, queries }
    }
}

impl Step for ProjectStep {
    fn run<'a>(&'a self, ctx: &'a StepContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(submit(self.queries.as_ref(), self.pipeline.project_job(), ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(key: &str) -> PartitionPipeline {
        PartitionPipeline {
            key: PartitionKey::new(key),
            source: TableRef::new("staging_dataset", "global_data"),
            partition_column: "country".into(),
            table: TableRef::new("transform_dataset", "usa_table"),
            view: TableRef::new("reporting_dataset", "usa_view"),
            projection: Projection {
                columns: vec![
                    ColumnConfig {
                        source: "Year".into(),
                        alias: "year".into(),
                    },
                    ColumnConfig {
                        source: "Disease Name".into(),
                        alias: "disease_name".into(),
                    },
                ],
                filter: Some("`Availability of Vaccines Treatment` = False".into()),
            },
        }
    }

    #[test]
    fn test_transform_job() {
        let job = pipeline("USA").transform_job();
        assert_eq!(job.mode, QueryMode::CreateOrReplaceTable);
        assert_eq!(
            job.sql(),
            "CREATE OR REPLACE TABLE `transform_dataset.usa_table` AS\n\
             SELECT *\nFROM `staging_dataset.global_data`\nWHERE `country` = 'USA'"
        );
    }

    #[test]
    fn test_transform_escapes_key() {
        let job = pipeline("Cote d'Ivoire").transform_job();
        assert!(job.select.ends_with("= 'Cote d''Ivoire'"), "{}", job.select);
    }

    #[test]
    fn test_project_job() {
        let job = pipeline("USA").project_job();
        assert_eq!(job.mode, QueryMode::CreateOrReplaceView);
        assert_eq!(job.destination.to_string(), "reporting_dataset.usa_view");
        assert_eq!(
            job.select,
            "SELECT\n  `Year` AS `year`,\n  `Disease Name` AS `disease_name`\n\
             FROM `transform_dataset.usa_table`\n\
             WHERE `Availability of Vaccines Treatment` = False"
        );
    }

    #[test]
    fn test_project_without_filter() {
        let mut p = pipeline("USA");
        p.projection.filter = Some("   ".into());
        assert!(!p.project_job().select.contains("WHERE"));
        p.projection.filter = None;
        assert!(!p.project_job().select.contains("WHERE"));
    }
}
