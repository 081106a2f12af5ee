use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sluice_core::error::{Result, SluiceError};
use sluice_core::traits::ExistenceCheck;
use sluice_core::types::Location;

use crate::step::{Step, StepContext};

/// Polls an existence check until the target shows up or the timeout runs out.
pub struct PreconditionWaiter {
    check: Arc<dyn ExistenceCheck>,
}

impl PreconditionWaiter {
    pub fn new(check: Arc<dyn ExistenceCheck>) -> Self {
        Self { check }
    }

    /// Upper bound on polls for a timeout/interval pair.
    pub fn max_polls(timeout: Duration, interval: Duration) -> u32 {
        if interval.is_zero() {
            return 1;
        }
        let polls = timeout.as_millis().div_ceil(interval.as_millis());
        u32::try_from(polls).unwrap_or(u32::MAX).max(1)
    }

    /// Wait for `target`. Returns the number of polls it took.
    ///
    /// A capability error ends the wait immediately. A poll is never started
    /// at or past `timeout`.
    pub async fn wait(
        &self,
        target: &Location,
        timeout: Duration,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<u32> {
        let started = Instant::now();
        let max_polls = Self::max_polls(timeout, interval);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let found = tokio::select! {
                _ = cancel.cancelled() => return Err(SluiceError::Cancelled),
                found = self.check.exists(target) => found?,
            };
            if found {
                info!(target_object = %target, attempts, "Precondition satisfied");
                return Ok(attempts);
            }

            if attempts >= max_polls || started.elapsed() + interval >= timeout {
                warn!(target_object = %target, attempts, "Precondition not met before timeout");
                return Err(SluiceError::TimeoutExceeded {
                    target: target.to_string(),
                    timeout_secs: timeout.as_secs(),
                    attempts,
                });
            }

            debug!(target_object = %target, attempts, "Not found yet, sleeping");
            tokio::select! {
                _ = cancel.cancelled() => return Err(SluiceError::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

/// Graph step wrapping a [`PreconditionWaiter`] for one target.
pub struct WaitStep {
    waiter: PreconditionWaiter,
    target: Location,
    timeout: Duration,
    interval: Duration,
}

impl WaitStep {
    pub fn new(
        check: Arc<dyn ExistenceCheck>,
        target: Location,
        timeout: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            waiter: PreconditionWaiter::new(check),
            target,
            timeout,
            interval,
        }
    }
}

impl Step for WaitStep {
    fn run<'a>(&'a self, ctx: &'a StepContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.waiter
                .wait(&self.target, self.timeout, self.interval, &ctx.cancel)
                .await
                .map(|_| ())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_test_utils::ScriptedExistence;

    fn target() -> Location {
        Location::new("bkt-src-global-health-data", "global_health_data.csv")
    }

    #[test]
    fn test_max_polls() {
        let s = Duration::from_secs;
        assert_eq!(PreconditionWaiter::max_polls(s(300), s(30)), 10);
        assert_eq!(PreconditionWaiter::max_polls(s(301), s(30)), 11);
        assert_eq!(PreconditionWaiter::max_polls(s(0), s(30)), 1);
        assert_eq!(PreconditionWaiter::max_polls(s(10), s(30)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_found_on_first_poll() {
        let check = Arc::new(ScriptedExistence::found_after(0));
        let waiter = PreconditionWaiter::new(check.clone());
        let attempts = waiter
            .wait(
                &target(),
                Duration::from_secs(300),
                Duration::from_secs(30),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(attempts, 1);
        assert_eq!(check.polls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_found_after_some_polls() {
        let check = Arc::new(ScriptedExistence::found_after(3));
        let waiter = PreconditionWaiter::new(check.clone());
        let started = Instant::now();
        let attempts = waiter
            .wait(
                &target(),
                Duration::from_secs(300),
                Duration::from_secs(30),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(attempts, 4);
        assert_eq!(started.elapsed(), Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_after_ten_polls() {
        let check = Arc::new(ScriptedExistence::never());
        let waiter = PreconditionWaiter::new(check.clone());
        let err = waiter
            .wait(
                &target(),
                Duration::from_secs(300),
                Duration::from_secs(30),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        match err {
            SluiceError::TimeoutExceeded { attempts, timeout_secs, .. } => {
                assert_eq!(attempts, 10);
                assert_eq!(timeout_secs, 300);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(check.polls(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capability_error_fails_immediately() {
        let check = Arc::new(ScriptedExistence::failing("permission denied"));
        let waiter = PreconditionWaiter::new(check.clone());
        let err = waiter
            .wait(
                &target(),
                Duration::from_secs(300),
                Duration::from_secs(30),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SluiceError::Capability(_)));
        assert_eq!(check.polls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_sleeping() {
        let check = Arc::new(ScriptedExistence::never());
        let waiter = PreconditionWaiter::new(check.clone());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(45)).await;
            trigger.cancel();
        });
        let err = waiter
            .wait(&target(), Duration::from_secs(300), Duration::from_secs(30), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SluiceError::Cancelled));
        assert_eq!(check.polls(), 2);
    }
}
