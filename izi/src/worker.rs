//! The worker trait and the outcome type handlers return.

use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeDelta;
use serde_json::Value;
use tokio::task::JoinError;

use crate::isolation::IsolationSpec;
use crate::job::{Job, DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY, DEFAULT_QUEUE};

/// Default handler timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A named handler with default options.
///
/// Implementations are registered in a [`crate::registry::WorkerRegistry`]
/// and looked up by [`Worker::name`] when a claimed job is executed. The
/// option getters provide insert-time defaults; all of them can be overridden
/// per job at insertion.
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;

    async fn perform(&self, job: Job) -> WorkerResult;

    fn queue(&self) -> &str {
        DEFAULT_QUEUE
    }

    fn max_attempts(&self) -> i32 {
        DEFAULT_MAX_ATTEMPTS
    }

    fn priority(&self) -> i32 {
        DEFAULT_PRIORITY
    }

    /// How long a single attempt may run before it is failed with a timeout.
    fn timeout(&self) -> Duration {
        DEFAULT_TIMEOUT
    }

    /// Retry delay override. `None` uses the orchestrator's default backoff.
    fn backoff(&self, _job: &Job) -> Option<TimeDelta> {
        None
    }

    /// When set, attempts run in the isolation pool rather than on the
    /// dispatcher's runtime.
    fn isolation(&self) -> Option<IsolationSpec> {
        None
    }
}

/// What a handler's attempt produced.
#[derive(Debug)]
pub enum WorkerResult {
    /// Success. The value is reported through telemetry, never persisted.
    Done(Option<Value>),
    /// Failure; retried while attempts remain, discarded after.
    Error(BoxError),
    /// Terminal non-failure; the reason is appended to the job's errors.
    Cancelled { reason: String },
    /// Reschedule this many seconds/millis into the future.
    Snooze { delay: TimeDelta },
}

impl WorkerResult {
    pub fn ok() -> Self {
        Self::Done(None)
    }

    pub fn ok_with(value: impl Into<Value>) -> Self {
        Self::Done(Some(value.into()))
    }

    pub fn error(error: impl Into<BoxError>) -> Self {
        Self::Error(error.into())
    }

    pub fn cancel(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    pub fn snooze(delay: TimeDelta) -> Self {
        Self::Snooze { delay }
    }

    pub fn snooze_secs(seconds: i64) -> Self {
        Self::snooze(TimeDelta::seconds(seconds))
    }
}

impl<E> From<Result<(), E>> for WorkerResult
where
    E: Into<BoxError>,
{
    fn from(value: Result<(), E>) -> Self {
        match value {
            Ok(()) => Self::ok(),
            Err(error) => Self::Error(error.into()),
        }
    }
}

/// Extracts a panic payload from a joined task, for mapping a panicking
/// handler onto an error outcome.
pub(crate) fn panic_message(error: JoinError) -> String {
    let fallback = error.to_string();
    match error.try_into_panic() {
        Ok(panic) => panic
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or(fallback),
        Err(_) => fallback,
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Fails until the configured attempt, then succeeds. Retries are
    /// scheduled with no delay so tests drain quickly.
    pub(crate) struct FlakyWorker {
        pub succeed_on: i32,
        pub calls: Arc<AtomicUsize>,
    }

    impl FlakyWorker {
        pub(crate) fn new(succeed_on: i32) -> Self {
            Self {
                succeed_on,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Worker for FlakyWorker {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn perform(&self, job: Job) -> WorkerResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if job.attempt >= self.succeed_on {
                WorkerResult::ok()
            } else {
                WorkerResult::error("temp")
            }
        }

        fn backoff(&self, _job: &Job) -> Option<TimeDelta> {
            Some(TimeDelta::zero())
        }
    }

    #[tokio::test]
    async fn result_from_unit_result() {
        let ok: WorkerResult = Result::<(), std::io::Error>::Ok(()).into();
        assert!(matches!(ok, WorkerResult::Done(None)));

        let err: WorkerResult =
            Result::<(), std::io::Error>::Err(std::io::Error::other("nope")).into();
        match err {
            WorkerResult::Error(e) => assert_eq!(e.to_string(), "nope"),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn panic_message_extracts_payload() {
        let join_error = tokio::spawn(async { panic!("kaboom {}", 42) })
            .await
            .unwrap_err();
        assert_eq!(panic_message(join_error), "kaboom 42");
    }
}
