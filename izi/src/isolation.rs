//! Process isolation for CPU-bound, blocking, or untrusted workers.
//!
//! A context is a long-lived child process speaking newline-delimited JSON
//! over its stdio. Child processes share nothing with the dispatcher and can
//! be forcibly terminated, which is what the timeout contract requires; a
//! worker binary calls [`serve`] to become one.

use std::path::PathBuf;
use std::time::Duration;

pub mod child;
pub mod pool;
pub(crate) mod proto;

pub use child::serve;
pub use pool::IsolationPool;

/// Environment variables carrying [`ResourceLimits`] to a spawned context.
pub const ENV_MAX_MEMORY_BYTES: &str = "IZI_MAX_MEMORY_BYTES";
pub const ENV_MAX_CPU_SECONDS: &str = "IZI_MAX_CPU_SECONDS";

/// Pool-wide configuration.
#[derive(Debug, Clone)]
pub struct IsolationConfig {
    /// Contexts kept alive even when idle.
    pub min_contexts: usize,
    /// Hard cap; a job arriving with every context busy fails its attempt.
    pub max_contexts: usize,
    /// Idle contexts above `min_contexts` are reaped after this long.
    pub idle_timeout: Duration,
    /// The worker binary to spawn, unless a worker overrides it.
    pub program: PathBuf,
}

impl IsolationConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            min_contexts: 0,
            max_contexts: 4,
            idle_timeout: Duration::from_secs(30),
            program: program.into(),
        }
    }

    pub fn with_min_contexts(mut self, min_contexts: usize) -> Self {
        self.min_contexts = min_contexts;
        self
    }

    pub fn with_max_contexts(mut self, max_contexts: usize) -> Self {
        self.max_contexts = max_contexts;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}

/// Limits exported to the context's environment at spawn. Enforcement
/// belongs to the worker binary or whatever launches it; nothing portable
/// can impose them from here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub max_memory_bytes: Option<u64>,
    pub max_cpu_seconds: Option<u64>,
}

/// Per-worker isolation settings, returned from
/// [`crate::worker::Worker::isolation`].
#[derive(Debug, Clone, Default)]
pub struct IsolationSpec {
    /// Overrides the pool's worker binary for this worker.
    pub program: Option<PathBuf>,
    pub resource_limits: Option<ResourceLimits>,
}

impl IsolationSpec {
    /// Run on the pool's default worker binary.
    pub fn pooled() -> Self {
        Self::default()
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    pub fn with_resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = Some(limits);
        self
    }
}
