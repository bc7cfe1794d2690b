//! Executes a single claimed job and persists the outcome.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{instrument, Instrument};

use crate::adapter::StorageAdapter;
use crate::backoff::{RetryBackoff, Strategy};
use crate::isolation::pool::RemoteError;
use crate::isolation::IsolationPool;
use crate::job::{Job, JobError, JobState, JobUpdate};
use crate::registry::WorkerRegistry;
use crate::telemetry::{Event, EventPayload, TelemetryBus};
use crate::worker::{panic_message, WorkerResult};

pub(crate) struct JobRunner<A: StorageAdapter> {
    adapter: Arc<A>,
    registry: WorkerRegistry,
    telemetry: TelemetryBus,
    isolation: Option<Arc<IsolationPool>>,
    backoff: RetryBackoff,
}

impl<A: StorageAdapter + 'static> JobRunner<A> {
    pub(crate) fn new(
        adapter: Arc<A>,
        registry: WorkerRegistry,
        telemetry: TelemetryBus,
        isolation: Option<Arc<IsolationPool>>,
        backoff: RetryBackoff,
    ) -> Self {
        Self {
            adapter,
            registry,
            telemetry,
            isolation,
            backoff,
        }
    }

    /// Runs one claimed job to its next state. Never panics and never
    /// propagates: every failure mode ends in a state transition or, if even
    /// the persistence write fails, a logged error.
    #[instrument(skip(self, job), fields(job_id = %job.id, worker = %job.worker))]
    pub(crate) async fn run(&self, job: Job) {
        let started = Instant::now();
        self.telemetry
            .emit(EventPayload::new(Event::JobStart).with_job(&job));

        let outcome = self.execute(&job).await;
        self.persist(job, outcome, started.elapsed()).await;
    }

    async fn execute(&self, job: &Job) -> WorkerResult {
        let Some(worker) = self.registry.get(&job.worker) else {
            return WorkerResult::error(format!("worker {} not registered", job.worker));
        };

        let timeout = worker.timeout();
        if let Some(spec) = worker.isolation() {
            let Some(pool) = self.isolation.as_ref() else {
                return WorkerResult::error(format!(
                    "worker {} requires isolation but no pool is configured",
                    job.worker
                ));
            };
            self.telemetry
                .emit(EventPayload::new(Event::JobIsolatedStart).with_job(job));
            return pool.execute(job, &spec, timeout).await;
        }

        // The handler runs in its own task so a panic is contained. On
        // timeout the task is left running (it cannot be forcibly stopped);
        // we only stop waiting for it.
        let handle = tokio::spawn({
            let job = job.clone();
            async move { worker.perform(job).await }.in_current_span()
        });

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => WorkerResult::error(panic_message(join_error)),
            Err(_elapsed) => {
                WorkerResult::error(format!("timed out after {}ms", timeout.as_millis()))
            }
        }
    }

    async fn persist(&self, job: Job, outcome: WorkerResult, duration: Duration) {
        match outcome {
            WorkerResult::Done(value) => self.complete(job, value, duration).await,
            WorkerResult::Error(error) => {
                let record = error_record(&job, error);
                if job.is_final_attempt() {
                    self.discard(job, record, duration).await
                } else {
                    self.retry(job, record, duration).await
                }
            }
            WorkerResult::Cancelled { reason } => self.cancel(job, reason, duration).await,
            WorkerResult::Snooze { delay } => self.snooze(job, delay, duration).await,
        }
    }

    async fn complete(&self, job: Job, value: Option<serde_json::Value>, duration: Duration) {
        tracing::debug!(job_id = %job.id, "job complete");
        let update = JobUpdate {
            state: Some(JobState::Completed),
            completed_at: Some(Utc::now()),
            ..Default::default()
        };
        if self.write(&job, update).await {
            self.telemetry.emit(
                EventPayload::new(Event::JobComplete)
                    .with_job(&job)
                    .with_duration(duration)
                    .with_result(value),
            );
        }
    }

    async fn retry(&self, mut job: Job, record: JobError, duration: Duration) {
        let delay = self
            .registry
            .get(&job.worker)
            .and_then(|worker| worker.backoff(&job))
            .unwrap_or_else(|| self.backoff.delay(job.attempt));
        tracing::warn!(
            job_id = %job.id,
            error = %record.error,
            "job failed, retrying in {delay}"
        );

        let error = record.error.clone();
        job.errors.push(record);
        let update = JobUpdate {
            state: Some(JobState::Retryable),
            scheduled_at: Some(Utc::now() + delay),
            errors: Some(job.errors.clone()),
            ..Default::default()
        };
        if self.write(&job, update).await {
            self.telemetry.emit(
                EventPayload::new(Event::JobError)
                    .with_job(&job)
                    .with_duration(duration)
                    .with_error(error),
            );
        }
    }

    async fn discard(&self, mut job: Job, record: JobError, duration: Duration) {
        tracing::error!(
            job_id = %job.id,
            error = %record.error,
            "job failed on its final attempt and will be discarded"
        );

        let error = record.error.clone();
        job.errors.push(record);
        let update = JobUpdate {
            state: Some(JobState::Discarded),
            discarded_at: Some(Utc::now()),
            errors: Some(job.errors.clone()),
            ..Default::default()
        };
        if self.write(&job, update).await {
            self.telemetry.emit(
                EventPayload::new(Event::JobError)
                    .with_job(&job)
                    .with_duration(duration)
                    .with_error(error),
            );
        }
    }

    async fn cancel(&self, mut job: Job, reason: String, duration: Duration) {
        tracing::debug!(job_id = %job.id, %reason, "job cancelled itself");
        job.errors.push(JobError::new(job.attempt, reason.clone()));
        let update = JobUpdate {
            state: Some(JobState::Cancelled),
            cancelled_at: Some(Utc::now()),
            errors: Some(job.errors.clone()),
            ..Default::default()
        };
        if self.write(&job, update).await {
            self.telemetry.emit(
                EventPayload::new(Event::JobCancel)
                    .with_job(&job)
                    .with_duration(duration)
                    .with_error(reason),
            );
        }
    }

    async fn snooze(&self, mut job: Job, delay: chrono::TimeDelta, duration: Duration) {
        let now = Utc::now();
        tracing::debug!(job_id = %job.id, "job snoozed for {delay}");
        job.meta.insert(
            "snoozedAt".to_owned(),
            serde_json::Value::String(now.to_rfc3339()),
        );
        let update = JobUpdate {
            state: Some(JobState::Scheduled),
            scheduled_at: Some(now + delay),
            meta: Some(job.meta.clone()),
            ..Default::default()
        };
        if self.write(&job, update).await {
            self.telemetry.emit(
                EventPayload::new(Event::JobSnooze)
                    .with_job(&job)
                    .with_duration(duration),
            );
        }
    }

    /// The single outcome write. A failure here must not take the dispatcher
    /// down: it is logged and surfaced as telemetry, and the row is left for
    /// the rescuer.
    async fn write(&self, job: &Job, update: JobUpdate) -> bool {
        match self.adapter.update_job(job.id, update).await {
            Ok(Some(_)) => true,
            Ok(None) => {
                tracing::error!(job_id = %job.id, "job row vanished before its outcome write");
                false
            }
            Err(error) => {
                tracing::error!(
                    ?error,
                    job_id = %job.id,
                    "failed to persist job outcome"
                );
                self.telemetry.emit(
                    EventPayload::new(Event::JobError)
                        .with_job(job)
                        .with_error(error.to_string()),
                );
                false
            }
        }
    }
}

/// Builds the error record appended to `job.errors` for a failed attempt.
fn error_record(job: &Job, error: crate::worker::BoxError) -> JobError {
    let mut record = JobError::new(job.attempt, error.to_string());
    if let Some(remote) = error.downcast_ref::<RemoteError>() {
        record.stacktrace = remote.stack.clone();
    }
    record
}
