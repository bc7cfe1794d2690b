//! The managed pool of isolation contexts.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::proto::{Request, Response};
use super::{IsolationConfig, IsolationSpec, ENV_MAX_CPU_SECONDS, ENV_MAX_MEMORY_BYTES};
use crate::job::Job;
use crate::telemetry::{Event, EventPayload, TelemetryBus};
use crate::worker::WorkerResult;

/// An error a context reported for the job it was running. Carries the
/// remote stack trace when one was included.
#[derive(Debug)]
pub(crate) struct RemoteError {
    pub message: String,
    pub stack: Option<String>,
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RemoteError {}

struct Context {
    id: u64,
    program: PathBuf,
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    last_used: Instant,
}

#[derive(Default)]
struct PoolInner {
    idle: Vec<Context>,
    /// Contexts currently owned by an executing job.
    active: usize,
    reaper: Option<JoinHandle<()>>,
}

/// A pool of child-process execution contexts.
///
/// Contexts are spawned on demand up to `max_contexts`, handed exclusively
/// to one job at a time, and returned to the idle set afterwards. A timeout
/// or shutdown kills the context outright; the reaper trims idle contexts
/// above `min_contexts`.
pub struct IsolationPool {
    config: IsolationConfig,
    telemetry: TelemetryBus,
    inner: Mutex<PoolInner>,
    token: CancellationToken,
    next_context_id: AtomicU64,
}

impl IsolationPool {
    pub fn new(config: IsolationConfig, telemetry: TelemetryBus) -> Arc<Self> {
        Arc::new(Self {
            config,
            telemetry,
            inner: Mutex::new(PoolInner::default()),
            token: CancellationToken::new(),
            next_context_id: AtomicU64::new(0),
        })
    }

    /// Spawns the idle-reaping loop. Runs until [`IsolationPool::shutdown`].
    pub fn start_reaper(self: &Arc<Self>) {
        let pool = self.clone();
        let interval = (self.config.idle_timeout / 2).max(Duration::from_millis(10));
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pool.token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => pool.reap_idle().await,
                }
            }
        });
        self.lock().reaper = Some(handle);
    }

    /// Runs one job on a context, enforcing `timeout` by killing the
    /// context when it fires.
    pub(crate) async fn execute(
        &self,
        job: &Job,
        spec: &IsolationSpec,
        timeout: Duration,
    ) -> WorkerResult {
        if self.token.is_cancelled() {
            return WorkerResult::error("pool shutting down");
        }

        let program = spec
            .program
            .clone()
            .unwrap_or_else(|| self.config.program.clone());

        let context = match self.acquire(&program, spec).await {
            Ok(context) => context,
            Err(result) => return result,
        };

        let (result, context) = self.run_on(context, job, timeout).await;

        let to_destroy = {
            let mut inner = self.lock();
            inner.active -= 1;
            match context {
                Some(context) if self.token.is_cancelled() => Some(context),
                Some(mut context) => {
                    context.last_used = Instant::now();
                    inner.idle.push(context);
                    None
                }
                None => None,
            }
        };
        if let Some(context) = to_destroy {
            self.destroy(context).await;
        }
        result
    }

    /// Stops intake, fails jobs still waiting on a context with
    /// "pool shutting down", and terminates every context.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let (idle, reaper) = {
            let mut inner = self.lock();
            (std::mem::take(&mut inner.idle), inner.reaper.take())
        };
        for context in idle {
            self.destroy(context).await;
        }
        if let Some(reaper) = reaper {
            let _ = reaper.await;
        }
    }

    async fn acquire(
        &self,
        program: &PathBuf,
        spec: &IsolationSpec,
    ) -> Result<Context, WorkerResult> {
        let reuse = {
            let mut inner = self.lock();
            if let Some(position) = inner.idle.iter().position(|c| &c.program == program) {
                let context = inner.idle.remove(position);
                inner.active += 1;
                Some(context)
            } else if inner.idle.len() + inner.active >= self.config.max_contexts {
                return Err(WorkerResult::error("no available worker contexts"));
            } else {
                inner.active += 1;
                None
            }
        };

        match reuse {
            Some(context) => Ok(context),
            None => match self.spawn_context(program.clone(), spec).await {
                Ok(context) => Ok(context),
                Err(error) => {
                    self.lock().active -= 1;
                    Err(WorkerResult::error(format!(
                        "failed to spawn worker context {}: {error}",
                        program.display()
                    )))
                }
            },
        }
    }

    async fn spawn_context(
        &self,
        program: PathBuf,
        spec: &IsolationSpec,
    ) -> std::io::Result<Context> {
        let mut command = Command::new(&program);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true);
        if let Some(limits) = spec.resource_limits {
            if let Some(bytes) = limits.max_memory_bytes {
                command.env(ENV_MAX_MEMORY_BYTES, bytes.to_string());
            }
            if let Some(seconds) = limits.max_cpu_seconds {
                command.env(ENV_MAX_CPU_SECONDS, seconds.to_string());
            }
        }

        let mut child = command.spawn()?;
        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");
        let id = self.next_context_id.fetch_add(1, Ordering::SeqCst) + 1;

        tracing::debug!(context = id, program = %program.display(), "spawned isolation context");
        self.telemetry.emit(EventPayload::new(Event::ThreadSpawn).with_count(id));

        Ok(Context {
            id,
            program,
            child,
            stdin,
            lines: BufReader::new(stdout).lines(),
            last_used: Instant::now(),
        })
    }

    /// The per-job protocol. Returns the context for reuse unless it was
    /// destroyed along the way.
    async fn run_on(
        &self,
        mut context: Context,
        job: &Job,
        timeout: Duration,
    ) -> (WorkerResult, Option<Context>) {
        let request = Request::Execute {
            job_id: job.id.into(),
            job: job.clone(),
            worker: job.worker.clone(),
        };
        let mut line = match serde_json::to_vec(&request) {
            Ok(line) => line,
            Err(error) => return (WorkerResult::error(error), Some(context)),
        };
        line.push(b'\n');

        if let Err(error) = context.stdin.write_all(&line).await {
            self.destroy(context).await;
            return (
                WorkerResult::error(format!("context exited before accepting work: {error}")),
                None,
            );
        }
        if let Err(error) = context.stdin.flush().await {
            self.destroy(context).await;
            return (
                WorkerResult::error(format!("context exited before accepting work: {error}")),
                None,
            );
        }

        tokio::select! {
            _ = self.token.cancelled() => {
                self.destroy(context).await;
                (WorkerResult::error("pool shutting down"), None)
            }
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(
                    job_id = %job.id,
                    context = context.id,
                    "isolated job timed out, killing its context"
                );
                self.destroy(context).await;
                self.telemetry.emit(
                    EventPayload::new(Event::JobIsolatedTimeout)
                        .with_job(job)
                        .with_duration(timeout),
                );
                (
                    WorkerResult::error(format!(
                        "isolated job timed out after {}ms",
                        timeout.as_millis()
                    )),
                    None,
                )
            }
            line = context.lines.next_line() => match line {
                Ok(Some(text)) => match serde_json::from_str::<Response>(&text) {
                    Ok(Response::Result { result, .. }) => (result.into(), Some(context)),
                    Ok(Response::Error { error, stack, .. }) => (
                        WorkerResult::Error(Box::new(RemoteError { message: error, stack })),
                        Some(context),
                    ),
                    Err(error) => {
                        self.destroy(context).await;
                        (
                            WorkerResult::error(format!(
                                "context sent an unparseable response: {error}"
                            )),
                            None,
                        )
                    }
                },
                Ok(None) => {
                    let code = context
                        .child
                        .wait()
                        .await
                        .ok()
                        .and_then(|status| status.code())
                        .unwrap_or(-1);
                    tracing::warn!(job_id = %job.id, context = context.id, code, "context exited");
                    self.telemetry
                        .emit(EventPayload::new(Event::ThreadExit).with_count(context.id));
                    (
                        WorkerResult::error(format!("context exited with code {code}")),
                        None,
                    )
                }
                Err(error) => {
                    self.destroy(context).await;
                    (
                        WorkerResult::error(format!("lost contact with context: {error}")),
                        None,
                    )
                }
            }
        }
    }

    async fn reap_idle(&self) {
        let victims = {
            let mut inner = self.lock();
            let mut total = inner.idle.len() + inner.active;
            inner.idle.sort_by_key(|context| context.last_used);

            let mut victims = Vec::new();
            while total > self.config.min_contexts
                && inner
                    .idle
                    .first()
                    .is_some_and(|c| c.last_used.elapsed() >= self.config.idle_timeout)
            {
                victims.push(inner.idle.remove(0));
                total -= 1;
            }
            victims
        };

        for context in victims {
            tracing::debug!(context = context.id, "reaping idle isolation context");
            self.destroy(context).await;
        }
    }

    async fn destroy(&self, mut context: Context) {
        let _ = context.child.kill().await;
        self.telemetry
            .emit(EventPayload::new(Event::ThreadExit).with_count(context.id));
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}
