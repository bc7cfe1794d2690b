//! The persisted job record and its state machine.

use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod builder;
pub mod unique;

pub use builder::JobBuilder;
pub use unique::{UniqueField, UniqueOptions, UniquePeriod};

/// Default queue for jobs whose worker does not declare one.
pub const DEFAULT_QUEUE: &str = "default";
/// Default attempt limit.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 20;
/// Default priority. Lower numbers run first.
pub const DEFAULT_PRIORITY: i32 = 0;

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, Serialize, Deserialize)]
pub struct JobId(pub i64);

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<JobId> for i64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The seven states a job moves through.
///
/// `completed`, `discarded`, and `cancelled` are terminal. Every other
/// transition is produced by a named actor: the inserter, the staging loop,
/// the dispatcher's claim, the runner's outcome write, or the rescuer.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Available,
    Scheduled,
    Executing,
    Retryable,
    Completed,
    Discarded,
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 7] = [
        JobState::Available,
        JobState::Scheduled,
        JobState::Executing,
        JobState::Retryable,
        JobState::Completed,
        JobState::Discarded,
        JobState::Cancelled,
    ];

    pub const TERMINAL: [JobState; 3] =
        [JobState::Completed, JobState::Discarded, JobState::Cancelled];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Available => "available",
            JobState::Scheduled => "scheduled",
            JobState::Executing => "executing",
            JobState::Retryable => "retryable",
            JobState::Completed => "completed",
            JobState::Discarded => "discarded",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Discarded | JobState::Cancelled
        )
    }

    /// Whether `self -> to` is a legal transition.
    ///
    /// Staging moves `scheduled`/`retryable` to `available`, the claim moves
    /// `available` to `executing`, the runner writes one of
    /// `completed`/`retryable`/`discarded`/`cancelled`/`scheduled` (snooze),
    /// the rescuer moves `executing` back to `available`, and any
    /// non-terminal state may be cancelled. Terminal states have no exits.
    pub fn can_transition(&self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Scheduled, Available)
                | (Retryable, Available)
                | (Available, Executing)
                | (Executing, Completed)
                | (Executing, Retryable)
                | (Executing, Discarded)
                | (Executing, Scheduled)
                | (Executing, Available)
                | (Scheduled, Cancelled)
                | (Available, Cancelled)
                | (Executing, Cancelled)
                | (Retryable, Cancelled)
        )
    }

    /// States from which `to` may legally be entered.
    pub fn legal_sources(to: JobState) -> Vec<JobState> {
        Self::ALL
            .iter()
            .copied()
            .filter(|from| from.can_transition(to))
            .collect()
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or_else(|| format!("{s} is not a job state"))
    }
}

/// One failed attempt, as appended to a job's `errors` list.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub at: DateTime<Utc>,
    pub attempt: i32,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<String>,
}

impl JobError {
    pub(crate) fn new(attempt: i32, error: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            attempt,
            error: error.into(),
            stacktrace: None,
        }
    }
}

/// A persisted job row.
///
/// Serializable so it can cross the isolation boundary; timestamps travel as
/// ISO-8601 strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub state: JobState,
    pub queue: String,
    pub worker: String,
    pub args: Value,
    pub meta: serde_json::Map<String, Value>,
    pub tags: Vec<String>,
    pub errors: Vec<JobError>,
    pub attempt: i32,
    pub max_attempts: i32,
    pub priority: i32,
    pub inserted_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub discarded_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// The timestamp of the terminal transition, when the job is terminal.
    pub fn terminal_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at.or(self.discarded_at).or(self.cancelled_at)
    }
}

/// The shape handed to an adapter for insertion.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue: String,
    pub worker: String,
    pub args: Value,
    pub meta: serde_json::Map<String, Value>,
    pub tags: Vec<String>,
    pub max_attempts: i32,
    pub priority: i32,
    pub scheduled_at: DateTime<Utc>,
    pub unique: Option<UniqueOptions>,
}

impl NewJob {
    /// The state a freshly inserted row takes: `scheduled` when the job is
    /// dated in the future, `available` otherwise.
    pub fn initial_state(&self, now: DateTime<Utc>) -> JobState {
        if self.scheduled_at > now {
            JobState::Scheduled
        } else {
            JobState::Available
        }
    }
}

/// A partial update. Only `Some` fields are applied.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub state: Option<JobState>,
    pub errors: Option<Vec<JobError>>,
    pub meta: Option<serde_json::Map<String, Value>>,
    pub tags: Option<Vec<String>>,
    pub max_attempts: Option<i32>,
    pub priority: Option<i32>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub discarded_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl JobUpdate {
    pub fn is_empty(&self) -> bool {
        self.state.is_none()
            && self.errors.is_none()
            && self.meta.is_none()
            && self.tags.is_none()
            && self.max_attempts.is_none()
            && self.priority.is_none()
            && self.scheduled_at.is_none()
            && self.attempted_at.is_none()
            && self.completed_at.is_none()
            && self.discarded_at.is_none()
            && self.cancelled_at.is_none()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeDelta;

    impl Job {
        pub(crate) fn mock(worker: &str) -> Self {
            let now = Utc::now();
            Self {
                id: JobId(1),
                state: JobState::Available,
                queue: DEFAULT_QUEUE.to_owned(),
                worker: worker.to_owned(),
                args: serde_json::json!({"n": 1}),
                meta: Default::default(),
                tags: vec![],
                errors: vec![],
                attempt: 0,
                max_attempts: DEFAULT_MAX_ATTEMPTS,
                priority: 0,
                inserted_at: now,
                scheduled_at: now,
                attempted_at: None,
                completed_at: None,
                discarded_at: None,
                cancelled_at: None,
            }
        }
    }

    #[test]
    fn terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Discarded.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Available.is_terminal());
        assert!(!JobState::Scheduled.is_terminal());
        assert!(!JobState::Executing.is_terminal());
        assert!(!JobState::Retryable.is_terminal());
    }

    #[test]
    fn legal_transitions() {
        use JobState::*;
        let legal = [
            (Scheduled, Available),
            (Retryable, Available),
            (Available, Executing),
            (Executing, Completed),
            (Executing, Retryable),
            (Executing, Discarded),
            (Executing, Scheduled),
            (Executing, Available),
            (Scheduled, Cancelled),
            (Available, Cancelled),
            (Executing, Cancelled),
            (Retryable, Cancelled),
        ];

        for from in JobState::ALL {
            for to in JobState::ALL {
                let expected = legal.contains(&(from, to));
                assert_eq!(
                    from.can_transition(to),
                    expected,
                    "{from} -> {to} should be {expected}"
                );
            }
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for from in JobState::TERMINAL {
            for to in JobState::ALL {
                assert!(!from.can_transition(to), "{from} -> {to} must be illegal");
            }
        }
    }

    #[test]
    fn state_string_round_trip() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("running".parse::<JobState>().is_err());
    }

    #[test]
    fn initial_state_depends_on_schedule() {
        let now = Utc::now();
        let mut new = NewJob {
            queue: DEFAULT_QUEUE.to_owned(),
            worker: "mailer".to_owned(),
            args: Value::Null,
            meta: Default::default(),
            tags: vec![],
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            priority: 0,
            scheduled_at: now + TimeDelta::minutes(5),
            unique: None,
        };
        assert_eq!(new.initial_state(now), JobState::Scheduled);

        new.scheduled_at = now;
        assert_eq!(new.initial_state(now), JobState::Available);

        new.scheduled_at = now - TimeDelta::minutes(5);
        assert_eq!(new.initial_state(now), JobState::Available);
    }

    #[test]
    fn job_survives_serialization() {
        let mut job = Job::mock("mailer");
        job.errors.push(JobError::new(1, "boom"));
        job.attempted_at = Some(Utc::now());
        job.meta
            .insert("snoozedAt".to_owned(), serde_json::json!("2024-01-01T00:00:00Z"));

        let encoded = serde_json::to_string(&job).unwrap();
        let decoded: Job = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded, job);
    }

    #[test]
    fn error_record_omits_missing_stacktrace() {
        let record = JobError::new(2, "boom");
        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("stacktrace").is_none());
        assert_eq!(value["attempt"], 2);
        assert_eq!(value["error"], "boom");
    }
}
