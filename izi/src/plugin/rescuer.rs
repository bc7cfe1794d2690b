//! Returns jobs stranded in `executing` by a crashed process to `available`.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::plugin::{Plugin, PluginContext};
use crate::telemetry::{Event, EventPayload};
use crate::IziError;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_RESCUE_AFTER: Duration = Duration::from_secs(300);

pub struct Rescuer {
    interval: Duration,
    rescue_after: Duration,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Rescuer {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL, DEFAULT_RESCUE_AFTER)
    }
}

impl Rescuer {
    pub fn new(interval: Duration, rescue_after: Duration) -> Self {
        Self {
            interval,
            rescue_after,
            token: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Plugin for Rescuer {
    fn name(&self) -> &'static str {
        "rescuer"
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.interval.is_zero() {
            errors.push("rescuer interval must be greater than zero".to_owned());
        }
        if self.rescue_after.is_zero() {
            errors.push("rescue_after must be greater than zero".to_owned());
        }
        errors
    }

    async fn start(&self, context: PluginContext) -> Result<(), IziError> {
        let interval = self.interval;
        let rescue_after = self.rescue_after;
        let token = self.token.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!("shutting down the rescuer");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        match context.adapter.rescue_stuck_jobs(rescue_after).await {
                            Ok(0) => {}
                            Ok(count) => {
                                tracing::info!(count, ?rescue_after, "rescued stuck jobs");
                                context.telemetry.emit(
                                    EventPayload::new(Event::JobRescue)
                                        .with_count(count)
                                        .with_duration(rescue_after),
                                );
                                context.waker.wake_all();
                            }
                            Err(error) => {
                                tracing::error!(?error, "failed to rescue stuck jobs");
                                context.telemetry.emit(
                                    EventPayload::new(Event::PluginError)
                                        .with_plugin("rescuer")
                                        .with_error(error.to_string()),
                                );
                            }
                        }
                    }
                }
            }
        });
        *self.handle.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.token.cancel();
        let handle = self.handle.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
