//! izi: a database-backed job queue.
//!
//! Jobs are rows in a relational database; registered [`Worker`]s in one or
//! more processes execute them with at-least-once semantics. Retries back
//! off exponentially, queues bound their own concurrency, scheduled and
//! unique inserts are first-class, and CPU-bound workers can run in killable
//! child processes. There is no broker: the database's row locking is the
//! only coordination.
//!
//! ```no_run
//! use izi::prelude::*;
//! use async_trait::async_trait;
//!
//! struct SendEmail;
//!
//! #[async_trait]
//! impl Worker for SendEmail {
//!     fn name(&self) -> &str {
//!         "send_email"
//!     }
//!
//!     async fn perform(&self, job: Job) -> WorkerResult {
//!         // deliver job.args ...
//!         WorkerResult::ok()
//!     }
//! }
//!
//! # async fn example() -> Result<(), izi::IziError> {
//! let adapter = izi::adapter::InMemoryAdapter::new();
//! let mut izi = Izi::new(adapter, Config::new().with_queue("default", 10));
//! izi.migrate().await?;
//! izi.register(SendEmail);
//! izi.start().await?;
//!
//! izi.insert(JobBuilder::new("send_email").with_args(serde_json::json!({"user_id": 1})))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;

pub mod adapter;
pub mod backoff;
pub mod config;
pub mod dispatcher;
pub mod isolation;
pub mod job;
pub mod plugin;
pub mod registry;
pub mod telemetry;
pub mod worker;

mod runner;

pub mod prelude;

use adapter::{AdapterError, CancelCriteria, StorageAdapter};
use backoff::RetryBackoff;
use config::Config;
use dispatcher::{QueueDispatcher, QueueHandle, QueueStatus};
use isolation::IsolationPool;
use job::{Job, JobBuilder, JobId, JobState, NewJob};
use plugin::{DispatchWaker, Plugin, PluginContext, Pruner, Rescuer, Stager};
use registry::WorkerRegistry;
use runner::JobRunner;
use telemetry::{Event, EventPayload, Subscription, TelemetryBus};
use worker::Worker;

/// Default prune age for the manual [`Izi::prune_jobs`] call: seven days.
pub const DEFAULT_PRUNE_MAX_AGE: Duration = Duration::from_secs(7 * 86_400);
/// Default rescue threshold for the manual [`Izi::rescue_stuck_jobs`] call.
pub const DEFAULT_RESCUE_AFTER: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum IziError {
    /// Raised synchronously from configuration and validation; prevents
    /// startup.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("unknown queue {0}")]
    UnknownQueue(String),
    #[error("orchestrator is not running")]
    NotStarted,
    #[error("orchestrator is already running")]
    AlreadyStarted,
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

/// Outcome of [`Izi::insert_with_result`].
#[derive(Debug, Clone)]
pub struct InsertResult {
    pub job: Job,
    /// True when a uniqueness hit returned an existing row instead of
    /// inserting.
    pub conflict: bool,
}

/// The orchestrator: composes the adapter, registry, dispatchers, plugins,
/// telemetry, and the isolation pool behind one surface.
pub struct Izi<A: StorageAdapter + 'static> {
    config: Config,
    adapter: Arc<A>,
    registry: WorkerRegistry,
    telemetry: TelemetryBus,
    backoff: RetryBackoff,
    user_plugins: Vec<Arc<dyn Plugin>>,
    // populated by start()
    queues: Option<Arc<HashMap<String, QueueHandle>>>,
    running_plugins: Vec<Arc<dyn Plugin>>,
    isolation: Option<Arc<IsolationPool>>,
}

impl<A: StorageAdapter + 'static> Izi<A> {
    pub fn new(adapter: A, config: Config) -> Self {
        Self {
            config,
            adapter: Arc::new(adapter),
            registry: WorkerRegistry::new(),
            telemetry: TelemetryBus::new(),
            backoff: RetryBackoff::new(),
            user_plugins: Vec::new(),
            queues: None,
            running_plugins: Vec::new(),
            isolation: None,
        }
    }

    /// Adds a user plugin, started and stopped with the orchestrator.
    pub fn with_plugin(mut self, plugin: impl Plugin + 'static) -> Self {
        self.user_plugins.push(Arc::new(plugin));
        self
    }

    /// Replaces the default retry backoff.
    pub fn with_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn telemetry(&self) -> &TelemetryBus {
        &self.telemetry
    }

    pub fn adapter(&self) -> &Arc<A> {
        &self.adapter
    }

    pub fn register(&self, worker: impl Worker + 'static) {
        self.registry.register(worker);
    }

    pub async fn migrate(&self) -> Result<(), IziError> {
        Ok(self.adapter.migrate().await?)
    }

    /// Subscribes to one event. The returned [`Subscription`] unsubscribes
    /// via [`Subscription::cancel`].
    pub fn on<F>(&self, event: Event, handler: F) -> Subscription
    where
        F: Fn(&EventPayload) + Send + Sync + 'static,
    {
        self.telemetry.subscribe(event, handler)
    }

    /// Subscribes to every event.
    pub fn on_any<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&EventPayload) + Send + Sync + 'static,
    {
        self.telemetry.subscribe_all(handler)
    }

    /// Validates everything, then brings the system up: dispatchers first,
    /// then the stager and the other plugins, then the notify listener.
    pub async fn start(&mut self) -> Result<(), IziError> {
        if self.queues.is_some() {
            return Err(IziError::AlreadyStarted);
        }

        let mut plugins: Vec<Arc<dyn Plugin>> =
            vec![Arc::new(Stager::new(self.config.stage_interval))];
        if self.config.rescuer.enabled {
            plugins.push(Arc::new(Rescuer::new(
                self.config.rescuer.interval,
                self.config.rescuer.rescue_after,
            )));
        }
        if self.config.pruner.enabled {
            plugins.push(Arc::new(Pruner::new(
                self.config.pruner.interval,
                self.config.pruner.max_age,
            )));
        }
        plugins.extend(self.user_plugins.iter().cloned());

        let mut errors = self.config.validate();
        for plugin in &plugins {
            errors.extend(
                plugin
                    .validate()
                    .into_iter()
                    .map(|error| format!("{}: {error}", plugin.name())),
            );
        }
        if !errors.is_empty() {
            return Err(IziError::InvalidConfig(errors.join("; ")));
        }

        self.isolation = self.config.isolation.clone().map(|config| {
            let pool = IsolationPool::new(config, self.telemetry.clone());
            pool.start_reaper();
            pool
        });

        let runner = Arc::new(JobRunner::new(
            self.adapter.clone(),
            self.registry.clone(),
            self.telemetry.clone(),
            self.isolation.clone(),
            self.backoff,
        ));

        let mut queues = HashMap::new();
        for queue in &self.config.queues {
            queues.insert(
                queue.name.clone(),
                QueueDispatcher::spawn(
                    queue,
                    self.config.poll_interval,
                    self.adapter.clone(),
                    runner.clone(),
                    self.telemetry.clone(),
                ),
            );
        }
        let queues = Arc::new(queues);
        self.queues = Some(queues.clone());

        let waker = DispatchWaker::new({
            let queues = queues.clone();
            move |target| match target {
                Some(name) => {
                    if let Some(handle) = queues.get(name) {
                        handle.dispatch();
                    }
                }
                None => queues.values().for_each(QueueHandle::dispatch),
            }
        });

        if self.adapter.supports_notify() {
            let listen_waker = waker.clone();
            if let Err(error) = self
                .adapter
                .listen(Box::new(move |queue| listen_waker.wake(queue)))
                .await
            {
                tracing::warn!(?error, "could not install the notify listener, relying on polling");
            }
        }

        let context = PluginContext {
            adapter: self.adapter.clone(),
            node_id: self.config.node_id.clone(),
            queues: self.config.queues.iter().map(|q| q.name.clone()).collect(),
            telemetry: self.telemetry.clone(),
            waker,
        };
        for plugin in &plugins {
            plugin.start(context.clone()).await?;
            self.telemetry
                .emit(EventPayload::new(Event::PluginStart).with_plugin(plugin.name()));
        }
        self.running_plugins = plugins;

        tracing::info!(node_id = %self.config.node_id, "izi started");
        Ok(())
    }

    /// Stops plugins and dispatchers. In-flight jobs get up to `grace` to
    /// finish; stragglers stay `executing` for the rescuer.
    pub async fn stop(&mut self, grace: Duration) {
        for plugin in self.running_plugins.drain(..) {
            plugin.stop().await;
            self.telemetry
                .emit(EventPayload::new(Event::PluginStop).with_plugin(plugin.name()));
        }
        if let Some(queues) = self.queues.take() {
            futures::future::join_all(queues.values().map(|handle| handle.stop(grace))).await;
        }
        tracing::info!(node_id = %self.config.node_id, "izi stopped");
    }

    /// [`Izi::stop`], then isolation-pool shutdown, adapter close, and
    /// registry clear.
    pub async fn shutdown(&mut self, grace: Duration) -> Result<(), IziError> {
        self.stop(grace).await;
        if let Some(pool) = self.isolation.take() {
            pool.shutdown().await;
        }
        self.adapter.close().await?;
        self.registry.clear();
        Ok(())
    }

    pub async fn insert(&self, builder: JobBuilder) -> Result<Job, IziError> {
        Ok(self.insert_with_result(builder).await?.job)
    }

    /// Inserts, reporting whether a uniqueness conflict returned an existing
    /// row instead.
    pub async fn insert_with_result(&self, builder: JobBuilder) -> Result<InsertResult, IziError> {
        let new = self.resolve(builder)?;

        if let Some(options) = new.unique.clone() {
            if let Some(existing) = self.adapter.check_unique(&options, &new).await? {
                tracing::debug!(job_id = %existing.id, "unique conflict, returning existing job");
                self.telemetry
                    .emit(EventPayload::new(Event::JobUniqueConflict).with_job(&existing));
                return Ok(InsertResult {
                    job: existing,
                    conflict: true,
                });
            }
        }

        let job = self.adapter.insert_job(new).await?;
        tracing::debug!(job_id = %job.id, queue = %job.queue, worker = %job.worker, "inserted job");

        self.dispatch(Some(&job.queue));
        if self.adapter.supports_notify() {
            if let Err(error) = self.adapter.notify(&job.queue).await {
                tracing::warn!(?error, "failed to notify other processes of the insert");
            }
        }

        Ok(InsertResult {
            job,
            conflict: false,
        })
    }

    pub async fn insert_all(
        &self,
        builders: impl IntoIterator<Item = JobBuilder>,
    ) -> Result<Vec<Job>, IziError> {
        let mut jobs = Vec::new();
        for builder in builders {
            jobs.push(self.insert(builder).await?);
        }
        Ok(jobs)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>, IziError> {
        Ok(self.adapter.get_job(id).await?)
    }

    /// Cancels non-terminal jobs matching the criteria; empty criteria
    /// cancel everything non-terminal.
    pub async fn cancel_jobs(&self, criteria: CancelCriteria) -> Result<u64, IziError> {
        Ok(self.adapter.cancel_jobs(criteria).await?)
    }

    /// Deletes terminal rows older than `max_age` (default seven days).
    pub async fn prune_jobs(&self, max_age: Option<Duration>) -> Result<u64, IziError> {
        Ok(self
            .adapter
            .prune_jobs(max_age.unwrap_or(DEFAULT_PRUNE_MAX_AGE))
            .await?)
    }

    /// Recovers `executing` rows abandoned by a crashed process (default
    /// threshold 300 seconds).
    pub async fn rescue_stuck_jobs(&self, after: Option<Duration>) -> Result<u64, IziError> {
        Ok(self
            .adapter
            .rescue_stuck_jobs(after.unwrap_or(DEFAULT_RESCUE_AFTER))
            .await?)
    }

    pub fn pause_queue(&self, queue: &str) -> Result<(), IziError> {
        self.queue_handle(queue)?.pause();
        Ok(())
    }

    pub fn resume_queue(&self, queue: &str) -> Result<(), IziError> {
        self.queue_handle(queue)?.resume();
        Ok(())
    }

    /// Changes the queue's concurrency limit in place; running jobs finish
    /// regardless.
    pub fn scale_queue(&self, queue: &str, limit: usize) -> Result<(), IziError> {
        self.queue_handle(queue)?.scale(limit);
        Ok(())
    }

    pub fn queue_status(&self, queue: &str) -> Result<QueueStatus, IziError> {
        Ok(self.queue_handle(queue)?.status())
    }

    pub fn all_queue_status(&self) -> Vec<QueueStatus> {
        let mut statuses: Vec<_> = self
            .queues
            .iter()
            .flat_map(|queues| queues.values())
            .map(QueueHandle::status)
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Wakes one dispatcher (or all of them) outside the poll interval.
    pub fn dispatch(&self, queue: Option<&str>) {
        if let Some(queues) = &self.queues {
            match queue {
                Some(name) => {
                    if let Some(handle) = queues.get(name) {
                        handle.dispatch();
                    }
                }
                None => queues.values().for_each(QueueHandle::dispatch),
            }
        }
    }

    /// Blocks until the queue (or every queue) has no runnable work left:
    /// repeatedly stages, wakes dispatchers, and waits for `available` and
    /// `executing` counts to reach zero. Rows scheduled in the future are
    /// not waited for.
    pub async fn drain(&self, queue: Option<&str>) -> Result<(), IziError> {
        if self.queues.is_none() {
            return Err(IziError::NotStarted);
        }
        loop {
            self.adapter.stage_jobs().await?;
            self.dispatch(queue);
            let pending = self
                .adapter
                .count_jobs(queue, &[JobState::Available, JobState::Executing])
                .await?;
            if pending == 0 {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    fn queue_handle(&self, queue: &str) -> Result<&QueueHandle, IziError> {
        self.queues
            .as_ref()
            .ok_or(IziError::NotStarted)?
            .get(queue)
            .ok_or_else(|| IziError::UnknownQueue(queue.to_owned()))
    }

    /// Applies insert defaults: explicit option, then the registered
    /// worker's default, then the crate-wide default.
    fn resolve(&self, builder: JobBuilder) -> Result<NewJob, IziError> {
        let args = builder.args.map_err(AdapterError::from)?;
        let worker = self.registry.get(&builder.worker);

        let queue = builder
            .queue
            .or_else(|| worker.as_ref().map(|w| w.queue().to_owned()))
            .unwrap_or_else(|| job::DEFAULT_QUEUE.to_owned());
        let max_attempts = builder
            .max_attempts
            .or_else(|| worker.as_ref().map(|w| w.max_attempts()))
            .unwrap_or(job::DEFAULT_MAX_ATTEMPTS);
        let priority = builder
            .priority
            .or_else(|| worker.as_ref().map(|w| w.priority()))
            .unwrap_or(job::DEFAULT_PRIORITY);

        Ok(NewJob {
            queue,
            worker: builder.worker,
            args,
            meta: builder.meta,
            tags: builder.tags,
            max_attempts,
            priority,
            scheduled_at: builder.scheduled_at.unwrap_or_else(Utc::now),
            unique: builder.unique,
        })
    }
}
