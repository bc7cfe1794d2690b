//! Per-queue dispatch: bounded-concurrency polling over the adapter's
//! atomic claim.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};

use crate::adapter::StorageAdapter;
use crate::config::QueueConfig;
use crate::runner::JobRunner;
use crate::telemetry::{Event, EventPayload, TelemetryBus};

/// Lifecycle state of one dispatcher.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum QueueState {
    Stopped,
    Running,
    Paused,
}

impl QueueState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => QueueState::Running,
            2 => QueueState::Paused,
            _ => QueueState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            QueueState::Stopped => 0,
            QueueState::Running => 1,
            QueueState::Paused => 2,
        }
    }
}

/// Point-in-time view of a dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    pub name: String,
    pub limit: usize,
    pub paused: bool,
    pub state: QueueState,
    /// Jobs currently under execution in this process.
    pub running: usize,
}

pub(crate) enum QueueCommand {
    /// Poll now instead of waiting for the interval.
    Dispatch,
    Pause,
    Resume,
    Scale(usize),
    Stop {
        grace: Duration,
        done: oneshot::Sender<()>,
    },
}

pub(crate) struct QueueShared {
    name: String,
    limit: AtomicUsize,
    paused: AtomicBool,
    state: AtomicU8,
    inflight: AtomicUsize,
}

/// Control handle owned by the orchestrator; the dispatcher itself runs as a
/// detached task.
pub(crate) struct QueueHandle {
    shared: Arc<QueueShared>,
    sender: mpsc::UnboundedSender<QueueCommand>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl QueueHandle {
    pub(crate) fn name(&self) -> &str {
        &self.shared.name
    }

    pub(crate) fn dispatch(&self) {
        let _ = self.sender.send(QueueCommand::Dispatch);
    }

    pub(crate) fn pause(&self) {
        let _ = self.sender.send(QueueCommand::Pause);
    }

    pub(crate) fn resume(&self) {
        let _ = self.sender.send(QueueCommand::Resume);
    }

    pub(crate) fn scale(&self, limit: usize) {
        let _ = self.sender.send(QueueCommand::Scale(limit));
    }

    pub(crate) async fn stop(&self, grace: Duration) {
        let (done, ack) = oneshot::channel();
        if self.sender.send(QueueCommand::Stop { grace, done }).is_ok() {
            let _ = ack.await;
        }
        let handle = self.join.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub(crate) fn status(&self) -> QueueStatus {
        QueueStatus {
            name: self.shared.name.clone(),
            limit: self.shared.limit.load(Ordering::SeqCst),
            paused: self.shared.paused.load(Ordering::SeqCst),
            state: QueueState::from_u8(self.shared.state.load(Ordering::SeqCst)),
            running: self.shared.inflight.load(Ordering::SeqCst),
        }
    }
}

pub(crate) struct QueueDispatcher<A: StorageAdapter + 'static> {
    shared: Arc<QueueShared>,
    runner: Arc<JobRunner<A>>,
    adapter: Arc<A>,
    telemetry: TelemetryBus,
    poll_interval: Duration,
    receiver: mpsc::UnboundedReceiver<QueueCommand>,
    inflight: JoinSet<()>,
}

impl<A: StorageAdapter + 'static> QueueDispatcher<A> {
    /// Spawns the dispatcher task for one queue and returns its handle.
    pub(crate) fn spawn(
        config: &QueueConfig,
        default_poll_interval: Duration,
        adapter: Arc<A>,
        runner: Arc<JobRunner<A>>,
        telemetry: TelemetryBus,
    ) -> QueueHandle {
        let shared = Arc::new(QueueShared {
            name: config.name.clone(),
            limit: AtomicUsize::new(config.limit),
            paused: AtomicBool::new(config.paused),
            state: AtomicU8::new(if config.paused {
                QueueState::Paused.as_u8()
            } else {
                QueueState::Running.as_u8()
            }),
            inflight: AtomicUsize::new(0),
        });
        let (sender, receiver) = mpsc::unbounded_channel();

        let dispatcher = Self {
            shared: shared.clone(),
            runner,
            adapter,
            telemetry,
            poll_interval: config.poll_interval.unwrap_or(default_poll_interval),
            receiver,
            inflight: JoinSet::new(),
        };
        let join = tokio::spawn(dispatcher.run());

        QueueHandle {
            shared,
            sender,
            join: Mutex::new(Some(join)),
        }
    }

    async fn run(mut self) {
        self.telemetry
            .emit(EventPayload::new(Event::QueueStart).with_queue(self.shared.name.clone()));
        self.tick().await;

        loop {
            tokio::select! {
                command = self.receiver.recv() => {
                    match command {
                        Some(QueueCommand::Dispatch) => self.tick().await,
                        Some(QueueCommand::Pause) => self.pause(),
                        Some(QueueCommand::Resume) => self.resume().await,
                        Some(QueueCommand::Scale(limit)) => {
                            self.shared.limit.store(limit, Ordering::SeqCst);
                        }
                        Some(QueueCommand::Stop { grace, done }) => {
                            self.stop(grace).await;
                            let _ = done.send(());
                            return;
                        }
                        // orchestrator dropped; shut down without grace
                        None => {
                            self.stop(Duration::ZERO).await;
                            return;
                        }
                    }
                }
                Some(_) = self.inflight.join_next(), if !self.inflight.is_empty() => {
                    self.note_inflight();
                    // a slot freed up; top the queue back up immediately
                    self.tick().await;
                }
                _ = tokio::time::sleep(self.poll_interval) => self.tick().await,
            }
        }
    }

    fn state(&self) -> QueueState {
        QueueState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: QueueState) {
        self.shared.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn note_inflight(&self) {
        self.shared
            .inflight
            .store(self.inflight.len(), Ordering::SeqCst);
    }

    /// One poll: claim up to the free capacity and start executions in claim
    /// order. A fetch failure is logged and the next poll happens as
    /// scheduled; the dispatcher never dies with the database.
    async fn tick(&mut self) {
        if self.state() != QueueState::Running {
            return;
        }

        let limit = self.shared.limit.load(Ordering::SeqCst);
        let available = limit.saturating_sub(self.inflight.len());
        if available == 0 {
            return;
        }

        match self.adapter.fetch_jobs(&self.shared.name, available).await {
            Ok(jobs) => {
                for job in jobs {
                    let runner = self.runner.clone();
                    self.inflight.spawn(async move { runner.run(job).await });
                }
                self.note_inflight();
            }
            Err(error) => {
                tracing::error!(
                    ?error,
                    queue = %self.shared.name,
                    "failed to fetch jobs, will poll again"
                );
            }
        }
    }

    /// Stops polling without touching in-flight jobs.
    fn pause(&mut self) {
        if self.state() != QueueState::Running {
            return;
        }
        self.set_state(QueueState::Paused);
        self.shared.paused.store(true, Ordering::SeqCst);
        self.telemetry
            .emit(EventPayload::new(Event::QueuePause).with_queue(self.shared.name.clone()));
    }

    async fn resume(&mut self) {
        if self.state() != QueueState::Paused {
            return;
        }
        self.set_state(QueueState::Running);
        self.shared.paused.store(false, Ordering::SeqCst);
        self.telemetry
            .emit(EventPayload::new(Event::QueueResume).with_queue(self.shared.name.clone()));
        self.tick().await;
    }

    /// Waits up to `grace` for in-flight jobs, then abandons the rest: their
    /// rows stay `executing` and the rescuer recovers them later.
    async fn stop(&mut self, grace: Duration) {
        self.set_state(QueueState::Stopped);

        let drained = tokio::time::timeout(grace, async {
            while self.inflight.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                queue = %self.shared.name,
                abandoned = self.inflight.len(),
                "grace expired, abandoning in-flight jobs to the rescuer"
            );
            self.inflight.detach_all();
        }
        self.note_inflight();
        self.telemetry
            .emit(EventPayload::new(Event::QueueStop).with_queue(self.shared.name.clone()));
    }
}
