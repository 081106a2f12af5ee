use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use sluice_core::error::{Result, SluiceError};
use sluice_core::traits::{BulkLoad, ExistenceCheck, QueryExecutor};
use sluice_core::types::{LoadOptions, LoadReport, Location, QueryJob, TableRef};

enum Script {
    /// Report missing for this many polls, then found.
    FoundAfter(u32),
    Never,
    Fail(String),
}

/// Existence check that follows a fixed script and counts polls.
pub struct ScriptedExistence {
    script: Script,
    polls: AtomicU32,
}

impl ScriptedExistence {
    pub fn found_after(misses: u32) -> Self {
        Self::with_script(Script::FoundAfter(misses))
    }

    pub fn never() -> Self {
        Self::with_script(Script::Never)
    }

    /// Every poll fails with a capability error.
    pub fn failing(message: &str) -> Self {
        Self::with_script(Script::Fail(message.to_string()))
    }

    fn with_script(script: Script) -> Self {
        Self {
            script,
            polls: AtomicU32::new(0),
        }
    }

    pub fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }
}

impl ExistenceCheck for ScriptedExistence {
    fn exists(&self, _location: &Location) -> BoxFuture<'_, Result<bool>> {
        let poll = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        let outcome = match &self.script {
            Script::FoundAfter(misses) => Ok(poll > *misses),
            Script::Never => Ok(false),
            Script::Fail(msg) => Err(SluiceError::Capability(msg.clone())),
        };
        Box::pin(async move { outcome })
    }
}

/// Bulk loader that records calls and can fail a set number of times.
pub struct RecordingLoader {
    fail_remaining: AtomicU32,
    calls: Mutex<Vec<(Location, TableRef, LoadOptions)>>,
    rows: usize,
}

impl RecordingLoader {
    pub fn new() -> Self {
        Self::failing_times(0)
    }

    /// Fail the first `n` loads with a load error.
    pub fn failing_times(n: u32) -> Self {
        Self {
            fail_remaining: AtomicU32::new(n),
            calls: Mutex::new(Vec::new()),
            rows: 42,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn last_call(&self) -> Option<(Location, TableRef, LoadOptions)> {
        self.calls.lock().unwrap().last().cloned()
    }
}

impl Default for RecordingLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl BulkLoad for RecordingLoader {
    fn load(
        &self,
        source: &Location,
        destination: &TableRef,
        options: &LoadOptions,
    ) -> BoxFuture<'_, Result<LoadReport>> {
        self.calls
            .lock()
            .unwrap()
            .push((source.clone(), destination.clone(), options.clone()));
        let fail = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let rows = self.rows;
        Box::pin(async move {
            if fail {
                return Err(SluiceError::Load("injected load failure".into()));
            }
            Ok(LoadReport {
                rows_loaded: rows,
                rows_skipped: 0,
            })
        })
    }
}

/// Query executor that records every submitted job.
///
/// Failures are injected per destination (`dataset.table`): either always,
/// or for the first `n` submissions.
pub struct RecordingQueries {
    jobs: Mutex<Vec<QueryJob>>,
    failures: Mutex<HashMap<String, Option<u32>>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingQueries {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            delay: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Every job writing `destination` fails.
    pub fn fail_for(self, destination: &str) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(destination.to_string(), None);
        self
    }

    /// The first `n` jobs writing `destination` fail.
    pub fn fail_times_for(self, destination: &str, n: u32) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(destination.to_string(), Some(n));
        self
    }

    /// Sleep this long inside every job.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn jobs(&self) -> Vec<QueryJob> {
        self.jobs.lock().unwrap().clone()
    }

    /// Submissions (including failed ones) for a destination.
    pub fn submissions(&self, destination: &str) -> usize {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.destination.to_string() == destination)
            .count()
    }

    /// Highest number of jobs observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn should_fail(&self, destination: &str) -> bool {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(destination) {
            Some(None) => true,
            Some(Some(n)) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

impl Default for RecordingQueries {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryExecutor for RecordingQueries {
    fn execute(&self, job: &QueryJob) -> BoxFuture<'_, Result<()>> {
        let destination = job.destination.to_string();
        self.jobs.lock().unwrap().push(job.clone());
        let fail = self.should_fail(&destination);

        Box::pin(async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if fail {
                return Err(SluiceError::Query(format!(
                    "injected failure for {}",
                    destination
                )));
            }
            Ok(())
        })
    }
}

/// One of each fake, all healthy by default.
pub struct FakeServices {
    pub existence: Arc<ScriptedExistence>,
    pub loader: Arc<RecordingLoader>,
    pub queries: Arc<RecordingQueries>,
}

impl FakeServices {
    pub fn new() -> Self {
        Self {
            existence: Arc::new(ScriptedExistence::found_after(0)),
            loader: Arc::new(RecordingLoader::new()),
            queries: Arc::new(RecordingQueries::new()),
        }
    }

    pub fn with_existence(mut self, existence: ScriptedExistence) -> Self {
        self.existence = Arc::new(existence);
        self
    }

    pub fn with_loader(mut self, loader: RecordingLoader) -> Self {
        self.loader = Arc::new(loader);
        self
    }

    pub fn with_queries(mut self, queries: RecordingQueries) -> Self {
        self.queries = Arc::new(queries);
        self
    }
}

impl Default for FakeServices {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::types::QueryMode;

    fn job(dest: &str) -> QueryJob {
        QueryJob {
            destination: TableRef::parse(dest).unwrap(),
            mode: QueryMode::CreateOrReplaceTable,
            select: "SELECT 1".into(),
        }
    }

    #[tokio::test]
    async fn test_scripted_existence() {
        let check = ScriptedExistence::found_after(2);
        let loc = Location::new("b", "o");
        assert!(!check.exists(&loc).await.unwrap());
        assert!(!check.exists(&loc).await.unwrap());
        assert!(check.exists(&loc).await.unwrap());
        assert_eq!(check.polls(), 3);
    }

    #[tokio::test]
    async fn test_queries_fail_times() {
        let queries = RecordingQueries::new().fail_times_for("d.t", 1);
        assert!(queries.execute(&job("d.t")).await.is_err());
        assert!(queries.execute(&job("d.t")).await.is_ok());
        assert!(queries.execute(&job("d.other")).await.is_ok());
        assert_eq!(queries.submissions("d.t"), 2);
        assert_eq!(queries.jobs().len(), 3);
    }
}
