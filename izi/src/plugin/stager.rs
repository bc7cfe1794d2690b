//! Moves due `scheduled` and `retryable` rows to `available`.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::plugin::{Plugin, PluginContext};
use crate::telemetry::{Event, EventPayload};
use crate::IziError;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// The staging loop. Always installed by the orchestrator; systems without a
/// notify channel rely on it (plus the poll interval) for all wake-ups.
pub struct Stager {
    interval: Duration,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Stager {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL)
    }
}

impl Stager {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            token: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Plugin for Stager {
    fn name(&self) -> &'static str {
        "stager"
    }

    fn validate(&self) -> Vec<String> {
        if self.interval.is_zero() {
            vec!["stager interval must be greater than zero".to_owned()]
        } else {
            Vec::new()
        }
    }

    async fn start(&self, context: PluginContext) -> Result<(), IziError> {
        let interval = self.interval;
        let token = self.token.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!("shutting down the stager");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        match context.adapter.stage_jobs().await {
                            Ok(0) => {}
                            Ok(count) => {
                                tracing::debug!(count, "staged jobs, waking dispatchers");
                                context.waker.wake_all();
                            }
                            Err(error) => {
                                tracing::error!(?error, "failed to stage jobs");
                                context.telemetry.emit(
                                    EventPayload::new(Event::PluginError)
                                        .with_plugin("stager")
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
