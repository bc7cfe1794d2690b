//! Row types and conversions between stored and domain representations.

use chrono::{DateTime, Utc};
use serde_json::Value;

use izi::adapter::AdapterError;
use izi::job::{Job, JobError, JobId, JobState};

/// A row as PostgreSQL and MySQL return it: JSON columns decode straight to
/// [`Value`].
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct JobRow {
    pub id: i64,
    pub state: String,
    pub queue: String,
    pub worker: String,
    pub args: Value,
    pub meta: Value,
    pub tags: Value,
    pub errors: Value,
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

/// A row as SQLite returns it: JSON lives in TEXT columns.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SqliteJobRow {
    pub id: i64,
    pub state: String,
    pub queue: String,
    pub worker: String,
    pub args: String,
    pub meta: String,
    pub tags: String,
    pub errors: String,
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

pub(crate) fn parse_state(state: &str) -> Result<JobState, AdapterError> {
    state.parse().map_err(|_| AdapterError::BadState)
}

impl TryFrom<JobRow> for Job {
    type Error = AdapterError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: JobId(row.id),
            state: parse_state(&row.state)?,
            queue: row.queue,
            worker: row.worker,
            args: row.args,
            meta: serde_json::from_value(row.meta)?,
            tags: serde_json::from_value(row.tags)?,
            errors: serde_json::from_value::<Vec<JobError>>(row.errors)?,
            attempt: row.attempt,
            max_attempts: row.max_attempts,
            priority: row.priority,
            inserted_at: row.inserted_at,
            scheduled_at: row.scheduled_at,
            attempted_at: row.attempted_at,
            completed_at: row.completed_at,
            discarded_at: row.discarded_at,
            cancelled_at: row.cancelled_at,
        })
    }
}

impl TryFrom<SqliteJobRow> for Job {
    type Error = AdapterError;

    fn try_from(row: SqliteJobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: JobId(row.id),
            state: parse_state(&row.state)?,
            queue: row.queue,
            worker: row.worker,
            args: serde_json::from_str(&row.args)?,
            meta: serde_json::from_str(&row.meta)?,
            tags: serde_json::from_str(&row.tags)?,
            errors: serde_json::from_str::<Vec<JobError>>(&row.errors)?,
            attempt: row.attempt,
            max_attempts: row.max_attempts,
            priority: row.priority,
            inserted_at: row.inserted_at,
            scheduled_at: row.scheduled_at,
            attempted_at: row.attempted_at,
            completed_at: row.completed_at,
            discarded_at: row.discarded_at,
            cancelled_at: row.cancelled_at,
        })
    }
}

/// The states `to` may legally be entered from, as bindable strings.
pub(crate) fn legal_source_states(to: JobState) -> Vec<String> {
    JobState::legal_sources(to)
        .into_iter()
        .map(|state| state.as_str().to_owned())
        .collect()
}

pub(crate) fn state_strings(states: &[JobState]) -> Vec<String> {
    states.iter().map(|state| state.as_str().to_owned()).collect()
}

/// Restores the claim order the fetch contract promises; `RETURNING` makes
/// no ordering guarantee of its own.
pub(crate) fn sort_claimed(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(a.scheduled_at.cmp(&b.scheduled_at))
            .then(a.id.0.cmp(&b.id.0))
    });
}
