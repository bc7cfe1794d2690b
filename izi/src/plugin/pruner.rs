//! Deletes old terminal rows.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::plugin::{Plugin, PluginContext};
use crate::telemetry::{Event, EventPayload};
use crate::IziError;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(86_400);

pub struct Pruner {
    interval: Duration,
    max_age: Duration,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Pruner {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL, DEFAULT_MAX_AGE)
    }
}

impl Pruner {
    pub fn new(interval: Duration, max_age: Duration) -> Self {
        Self {
            interval,
            max_age,
            token: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Plugin for Pruner {
    fn name(&self) -> &'static str {
        "pruner"
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.interval.is_zero() {
            errors.push("pruner interval must be greater than zero".to_owned());
        }
        if self.max_age.is_zero() {
            errors.push("pruner max_age must be greater than zero".to_owned());
        }
        errors
    }

    async fn start(&self, context: PluginContext) -> Result<(), IziError> {
        let interval = self.interval;
        let max_age = self.max_age;
        let token = self.token.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!("shutting down the pruner");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        match context.adapter.prune_jobs(max_age).await {
                            Ok(0) => {}
                            Ok(count) => {
                                tracing::info!(count, ?max_age, "pruned old terminal jobs");
                                context.telemetry.emit(
                                    EventPayload::new(Event::JobComplete)
                                        .with_queue("pruner")
                                        .with_count(count)
                                        .with_duration(max_age),
                                );
                            }
                            Err(error) => {
                                tracing::error!(?error, "failed to prune jobs");
                                context.telemetry.emit(
                                    EventPayload::new(Event::PluginError)
                                        .with_plugin("pruner")
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
