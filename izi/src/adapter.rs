//! The storage adapter contract.
//!
//! Every backend (PostgreSQL, MySQL, SQLite, the in-memory reference) must
//! present the same observable behavior through this trait; the rest of the
//! system is written against it alone.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::job::{Job, JobId, JobState, JobUpdate, NewJob, UniqueOptions};

pub mod memory;

pub use memory::InMemoryAdapter;

/// Invoked with the queue name when a notify message arrives.
pub type NotifyCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Row selection for [`StorageAdapter::cancel_jobs`]. Empty criteria cancel
/// every non-terminal row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CancelCriteria {
    pub queue: Option<String>,
    pub worker: Option<String>,
    pub state: Option<JobState>,
}

impl CancelCriteria {
    pub fn queue(queue: impl Into<String>) -> Self {
        Self {
            queue: Some(queue.into()),
            ..Default::default()
        }
    }

    pub fn worker(worker: impl Into<String>) -> Self {
        Self {
            worker: Some(worker.into()),
            ..Default::default()
        }
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("error encoding or decoding job data")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("job {0} not found")]
    JobNotFound(JobId),
    /// An illegal state transition was requested. This is a bug in the
    /// caller, not a runtime condition, and is never swallowed.
    #[error("illegal job state transition: {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },
    #[error("adapter does not support {0}")]
    Unsupported(&'static str),
    #[error("storage layer in a bad state")]
    BadState,
    #[error("database error: {0}")]
    Database(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl AdapterError {
    pub fn database(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Database(Box::new(error))
    }
}

/// Persistence operations the core depends on.
///
/// The one operation with real coordination requirements is
/// [`StorageAdapter::fetch_jobs`]: two concurrent callers, in the same or in
/// different processes, must never receive overlapping rows.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Brings the schema to the current version. Idempotent.
    async fn migrate(&self) -> Result<(), AdapterError>;

    /// Reverses migrations strictly above `target_version`.
    async fn rollback(&self, target_version: i64) -> Result<(), AdapterError>;

    /// Persists a row and returns it with the server-assigned id and
    /// `inserted_at`. The initial state is `scheduled` for future-dated
    /// jobs, `available` otherwise.
    async fn insert_job(&self, new: NewJob) -> Result<Job, AdapterError>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, AdapterError>;

    /// Applies the non-`None` fields of `update` and returns the post-update
    /// row, or `None` for an unknown id. A state change that is not a legal
    /// transition fails with [`AdapterError::InvalidTransition`].
    async fn update_job(&self, id: JobId, update: JobUpdate) -> Result<Option<Job>, AdapterError>;

    /// Atomically claims up to `limit` available, due jobs on `queue` in
    /// `(priority ASC, scheduled_at ASC, id ASC)` order: sets them
    /// `executing`, stamps `attempted_at`, increments `attempt`, and returns
    /// the resulting rows in claim order.
    async fn fetch_jobs(&self, queue: &str, limit: usize) -> Result<Vec<Job>, AdapterError>;

    /// Promotes due `scheduled` and `retryable` rows to `available`.
    async fn stage_jobs(&self) -> Result<u64, AdapterError>;

    /// Cancels non-terminal rows matching the criteria.
    async fn cancel_jobs(&self, criteria: CancelCriteria) -> Result<u64, AdapterError>;

    /// Recovers `executing` rows whose attempt started more than `after`
    /// ago (their process crashed): rows with attempts remaining return to
    /// `available` rescheduled for now, exhausted rows are discarded.
    async fn rescue_stuck_jobs(&self, after: Duration) -> Result<u64, AdapterError>;

    /// Deletes terminal rows whose terminal timestamp is older than
    /// `max_age`.
    async fn prune_jobs(&self, max_age: Duration) -> Result<u64, AdapterError>;

    /// Finds an existing row the candidate would duplicate under `options`,
    /// if any.
    async fn check_unique(
        &self,
        options: &UniqueOptions,
        candidate: &NewJob,
    ) -> Result<Option<Job>, AdapterError>;

    /// Counts rows in the given states, optionally restricted to one queue.
    async fn count_jobs<'a>(
        &'a self,
        queue: Option<&'a str>,
        states: &'a [JobState],
    ) -> Result<u64, AdapterError>;

    /// Whether [`StorageAdapter::listen`] and [`StorageAdapter::notify`] do
    /// anything. Polling remains the fallback wake-up path either way.
    fn supports_notify(&self) -> bool {
        false
    }

    /// Installs a callback invoked with the queue name whenever an insert
    /// notification arrives from another process.
    async fn listen(&self, callback: NotifyCallback) -> Result<(), AdapterError> {
        drop(callback);
        Err(AdapterError::Unsupported("listen"))
    }

    /// Announces an insert on `queue` to listening processes.
    async fn notify(&self, queue: &str) -> Result<(), AdapterError> {
        let _ = queue;
        Ok(())
    }

    async fn close(&self) -> Result<(), AdapterError>;
}

/// Applies a partial update to a job in place, enforcing transition
/// legality. Shared by adapters that patch rows in application code.
pub fn apply_update(job: &mut Job, update: JobUpdate) -> Result<(), AdapterError> {
    if let Some(to) = update.state {
        if !job.state.can_transition(to) {
            return Err(AdapterError::InvalidTransition {
                from: job.state,
                to,
            });
        }
        job.state = to;
    }
    if let Some(errors) = update.errors {
        job.errors = errors;
    }
    if let Some(meta) = update.meta {
        job.meta = meta;
    }
    if let Some(tags) = update.tags {
        job.tags = tags;
    }
    if let Some(max_attempts) = update.max_attempts {
        job.max_attempts = max_attempts;
    }
    if let Some(priority) = update.priority {
        job.priority = priority;
    }
    if let Some(scheduled_at) = update.scheduled_at {
        job.scheduled_at = scheduled_at;
    }
    if let Some(attempted_at) = update.attempted_at {
        job.attempted_at = Some(attempted_at);
    }
    if let Some(completed_at) = update.completed_at {
        job.completed_at = Some(completed_at);
    }
    if let Some(discarded_at) = update.discarded_at {
        job.discarded_at = Some(discarded_at);
    }
    if let Some(cancelled_at) = update.cancelled_at {
        job.cancelled_at = Some(cancelled_at);
    }
    Ok(())
}
