//! Orchestrator configuration. Every default is stated here; nothing is
//! implicit.

use std::time::Duration;

use crate::isolation::IsolationConfig;
use crate::plugin::{pruner, rescuer, stager};

/// One queue this process dispatches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub name: String,
    /// Maximum jobs concurrently under execution for this queue in this
    /// process.
    pub limit: usize,
    /// Start paused; jobs accumulate until the queue is resumed.
    pub paused: bool,
    /// Overrides [`Config::poll_interval`] for this queue.
    pub poll_interval: Option<Duration>,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, limit: usize) -> Self {
        Self {
            name: name.into(),
            limit,
            paused: false,
            poll_interval: None,
        }
    }

    pub fn paused(mut self) -> Self {
        self.paused = true;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = Some(poll_interval);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RescuerConfig {
    pub enabled: bool,
    pub interval: Duration,
    /// An `executing` row whose attempt started longer ago than this is
    /// considered stranded.
    pub rescue_after: Duration,
}

impl Default for RescuerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: rescuer::DEFAULT_INTERVAL,
            rescue_after: rescuer::DEFAULT_RESCUE_AFTER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrunerConfig {
    pub enabled: bool,
    pub interval: Duration,
    /// Terminal rows older than this are deleted.
    pub max_age: Duration,
}

impl Default for PrunerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: pruner::DEFAULT_INTERVAL,
            max_age: pruner::DEFAULT_MAX_AGE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Identifies this process in logs and plugin contexts.
    pub node_id: String,
    pub queues: Vec<QueueConfig>,
    /// Default poll interval for queues that do not set their own.
    pub poll_interval: Duration,
    /// How often due `scheduled`/`retryable` rows are staged.
    pub stage_interval: Duration,
    pub rescuer: RescuerConfig,
    pub pruner: PrunerConfig,
    /// Present when isolated workers should be supported.
    pub isolation: Option<IsolationConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: format!("izi-{}", uuid::Uuid::new_v4()),
            queues: Vec::new(),
            poll_interval: Duration::from_secs(1),
            stage_interval: stager::DEFAULT_INTERVAL,
            rescuer: RescuerConfig::default(),
            pruner: PrunerConfig::default(),
            isolation: None,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue(mut self, name: impl Into<String>, limit: usize) -> Self {
        self.queues.push(QueueConfig::new(name, limit));
        self
    }

    /// The mapping-of-name-to-limit form.
    pub fn with_queues<N>(mut self, queues: impl IntoIterator<Item = (N, usize)>) -> Self
    where
        N: Into<String>,
    {
        self.queues.extend(
            queues
                .into_iter()
                .map(|(name, limit)| QueueConfig::new(name, limit)),
        );
        self
    }

    pub fn with_queue_config(mut self, queue: QueueConfig) -> Self {
        self.queues.push(queue);
        self
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_stage_interval(mut self, stage_interval: Duration) -> Self {
        self.stage_interval = stage_interval;
        self
    }

    pub fn with_rescuer(mut self, rescuer: RescuerConfig) -> Self {
        self.rescuer = rescuer;
        self
    }

    pub fn with_pruner(mut self, pruner: PrunerConfig) -> Self {
        self.pruner = pruner;
        self
    }

    pub fn with_isolation(mut self, isolation: IsolationConfig) -> Self {
        self.isolation = Some(isolation);
        self
    }

    /// Configuration problems that must prevent startup.
    pub(crate) fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for queue in &self.queues {
            if queue.name.is_empty() {
                errors.push("queue names must not be empty".to_owned());
            }
            if queue.limit == 0 {
                errors.push(format!("queue {} must have a limit above zero", queue.name));
            }
            if !seen.insert(queue.name.as_str()) {
                errors.push(format!("queue {} is configured twice", queue.name));
            }
        }
        if let Some(isolation) = &self.isolation {
            if isolation.max_contexts == 0 {
                errors.push("isolation max_contexts must be above zero".to_owned());
            }
            if isolation.min_contexts > isolation.max_contexts {
                errors.push("isolation min_contexts must not exceed max_contexts".to_owned());
            }
        }
        errors
    }
}
