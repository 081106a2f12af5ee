use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// Storage existence check, polled by the precondition waiter.
pub trait ExistenceCheck: Send + Sync + 'static {
    /// Whether the object exists. Transport or auth failures are
    /// `SluiceError::Capability`; a missing object is `Ok(false)`.
    fn exists(&self, location: &Location) -> BoxFuture<'_, Result<bool>>;
}

/// Bulk loader: ingests a source object into a warehouse table.
pub trait BulkLoad: Send + Sync + 'static {
    /// Load `source` into `destination`. Failures are `SluiceError::Load`.
    fn load(
        &self,
        source: &Location,
        destination: &TableRef,
        options: &LoadOptions,
    ) -> BoxFuture<'_, Result<LoadReport>>;
}

/// SQL job execution. Materializes tables and views.
pub trait QueryExecutor: Send + Sync + 'static {
    /// Run a query job. Failures are `SluiceError::Query`.
    fn execute(&self, job: &QueryJob) -> BoxFuture<'_, Result<()>>;
}
