use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::job::unique::UniqueOptions;

/// Fluent construction of a job insert.
///
/// Unset options fall back to the registered worker's defaults at insert
/// time, and failing that to the crate-wide defaults.
///
/// # Example
///
/// ```
/// # use izi::job::JobBuilder;
/// # use chrono::TimeDelta;
/// let builder = JobBuilder::new("send_email")
///     .with_args(serde_json::json!({"user_id": 123}))
///     .on_queue("mailers")
///     .with_max_attempts(5)
///     .schedule_in(TimeDelta::minutes(10));
/// ```
#[derive(Debug)]
pub struct JobBuilder {
    pub(crate) worker: String,
    pub(crate) queue: Option<String>,
    pub(crate) args: Result<Value, serde_json::Error>,
    pub(crate) meta: serde_json::Map<String, Value>,
    pub(crate) tags: Vec<String>,
    pub(crate) max_attempts: Option<i32>,
    pub(crate) priority: Option<i32>,
    pub(crate) scheduled_at: Option<DateTime<Utc>>,
    pub(crate) unique: Option<UniqueOptions>,
}

impl JobBuilder {
    pub fn new(worker: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
            queue: None,
            args: Ok(Value::Null),
            meta: Default::default(),
            tags: Vec::new(),
            max_attempts: None,
            priority: None,
            scheduled_at: None,
            unique: None,
        }
    }

    pub fn with_args(mut self, args: impl Serialize) -> Self {
        self.args = serde_json::to_value(args);
        self
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Lower numbers run first; 0 is normal.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn schedule_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }

    pub fn schedule_in(self, delay: TimeDelta) -> Self {
        self.schedule_at(Utc::now() + delay)
    }

    pub fn add_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_meta(mut self, meta: serde_json::Map<String, Value>) -> Self {
        self.meta = meta;
        self
    }

    pub fn unique(mut self, options: UniqueOptions) -> Self {
        self.unique = Some(options);
        self
    }
}
