//! Background plugins: periodic maintenance loops with a shared lifecycle.

use std::sync::Arc;

use async_trait::async_trait;

use crate::adapter::StorageAdapter;
use crate::telemetry::TelemetryBus;
use crate::IziError;

pub mod pruner;
pub mod rescuer;
pub mod stager;

pub use pruner::Pruner;
pub use rescuer::Rescuer;
pub use stager::Stager;

/// Wakes dispatchers outside their poll interval.
#[derive(Clone)]
pub struct DispatchWaker {
    inner: Arc<dyn Fn(Option<&str>) + Send + Sync>,
}

impl DispatchWaker {
    pub(crate) fn new(inner: impl Fn(Option<&str>) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// A waker wired to nothing, for plugins running without dispatchers.
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn wake_all(&self) {
        (self.inner)(None);
    }

    pub fn wake(&self, queue: &str) {
        (self.inner)(Some(queue));
    }
}

impl std::fmt::Debug for DispatchWaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DispatchWaker")
    }
}

/// What a plugin gets to work with.
#[derive(Clone)]
pub struct PluginContext {
    pub adapter: Arc<dyn StorageAdapter>,
    /// Identifies this process, e.g. in logs.
    pub node_id: String,
    /// Names of the queues this process dispatches.
    pub queues: Vec<String>,
    pub telemetry: TelemetryBus,
    pub waker: DispatchWaker,
}

/// A background loop managed by the orchestrator.
///
/// `validate` runs before anything starts; returned messages abort startup.
/// A running plugin owns its own task and must catch its own errors: a
/// failed iteration is telemetry (`plugin:error`), never a crash.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn validate(&self) -> Vec<String> {
        Vec::new()
    }

    async fn start(&self, context: PluginContext) -> Result<(), IziError>;

    async fn stop(&self);
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::adapter::InMemoryAdapter;

    pub(crate) fn context(adapter: Arc<InMemoryAdapter>) -> PluginContext {
        PluginContext {
            adapter,
            node_id: "izi-test".to_owned(),
            queues: vec!["default".to_owned()],
            telemetry: TelemetryBus::new(),
            waker: DispatchWaker::noop(),
        }
    }
}
