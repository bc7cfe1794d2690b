//! Convenient imports for typical usage.

pub use crate::adapter::{CancelCriteria, StorageAdapter};
pub use crate::backoff::{Jitter, RetryBackoff, Strategy};
pub use crate::config::{Config, PrunerConfig, QueueConfig, RescuerConfig};
pub use crate::isolation::{IsolationConfig, IsolationSpec, ResourceLimits};
pub use crate::job::{Job, JobBuilder, JobId, JobState, UniqueOptions};
pub use crate::registry::WorkerRegistry;
pub use crate::telemetry::{Event, EventPayload};
pub use crate::worker::{Worker, WorkerResult};
pub use crate::{InsertResult, Izi, IziError};
