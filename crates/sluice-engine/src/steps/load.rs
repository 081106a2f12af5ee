use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::info;

use sluice_core::error::{Result, SluiceError};
use sluice_core::traits::BulkLoad;
use sluice_core::types::{LoadOptions, LoadReport, Location, TableRef};

use crate::step::{Step, StepContext};

/// Ingests the source object into the staging table.
pub struct LoadStep {
    loader: Arc<dyn BulkLoad>,
    source: Location,
    destination: TableRef,
    options: LoadOptions,
}

impl LoadStep {
    pub fn new(
        loader: Arc<dyn BulkLoad>,
        source: Location,
        destination: TableRef,
        options: LoadOptions,
    ) -> Self {
        Self {
            loader,
            source,
            destination,
            options,
        }
    }

    pub async fn load(&self) -> Result<LoadReport> {
        self.loader
            .load(&self.source, &self.destination, &self.options)
            .await
    }
}

impl Step for LoadStep {
    fn run<'a>(&'a self, ctx: &'a StepContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let report = tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(SluiceError::Cancelled),
                report = self.load() => report?,
            };
            info!(
                source = %self.source,
                destination = %self.destination,
                rows_loaded = report.rows_loaded,
                rows_skipped = report.rows_skipped,
                attempt = ctx.attempt,
                "Load complete"
            );
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_test_utils::RecordingLoader;

    #[tokio::test]
    async fn test_load_passes_options() {
        let loader = Arc::new(RecordingLoader::new());
        let options = LoadOptions {
            delimiter: ';',
            ..LoadOptions::default()
        };
        let step = LoadStep::new(
            loader.clone(),
            Location::new("bkt", "data.csv"),
            TableRef::new("staging_dataset", "global_data"),
            options,
        );
        step.load().await.unwrap();

        assert_eq!(loader.calls(), 1);
        let (source, destination, options) = loader.last_call().unwrap();
        assert_eq!(source.to_string(), "bkt/data.csv");
        assert_eq!(destination.to_string(), "staging_dataset.global_data");
        assert_eq!(options.delimiter, ';');
        assert!(options.overwrite);
    }

    #[tokio::test]
    async fn test_load_error_propagates() {
        let loader = Arc::new(RecordingLoader::failing_times(1));
        let step = LoadStep::new(
            loader.clone(),
            Location::new("bkt", "data.csv"),
            TableRef::new("staging_dataset", "global_data"),
            LoadOptions::default(),
        );
        assert!(matches!(step.load().await, Err(SluiceError::Load(_))));
        step.load().await.unwrap();
        assert_eq!(loader.calls(), 2);
    }
}
