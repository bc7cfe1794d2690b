//! Uniqueness constraints for job insertion.
//!
//! An insert carrying [`UniqueOptions`] is checked against existing rows
//! before a new row is written; a hit returns the existing job instead of
//! inserting a duplicate.

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;

use crate::job::JobState;

/// Which columns of the candidate must match an existing row.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum UniqueField {
    Worker,
    Queue,
    Args,
}

/// How far back to look for a matching row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniquePeriod {
    /// Only rows inserted within the window count as duplicates.
    Within(TimeDelta),
    /// Any matching row counts, regardless of age.
    Infinity,
}

impl UniquePeriod {
    /// The oldest `inserted_at` still considered a duplicate, or `None` for
    /// an unbounded window.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            UniquePeriod::Within(delta) => Some(now - *delta),
            UniquePeriod::Infinity => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UniqueOptions {
    /// Fields compared between the candidate and existing rows.
    pub fields: Vec<UniqueField>,
    /// When non-empty, only these keys of `args` are compared rather than the
    /// whole document. A key missing from both sides compares equal.
    pub keys: Vec<String>,
    pub period: UniquePeriod,
    /// Only rows in these states participate in the check.
    pub states: Vec<JobState>,
}

impl Default for UniqueOptions {
    fn default() -> Self {
        Self {
            fields: vec![UniqueField::Worker, UniqueField::Queue, UniqueField::Args],
            keys: Vec::new(),
            period: UniquePeriod::Within(TimeDelta::seconds(60)),
            states: vec![
                JobState::Available,
                JobState::Scheduled,
                JobState::Executing,
                JobState::Retryable,
            ],
        }
    }
}

impl UniqueOptions {
    pub fn within(period: TimeDelta) -> Self {
        Self {
            period: UniquePeriod::Within(period),
            ..Default::default()
        }
    }

    pub fn within_secs(seconds: i64) -> Self {
        Self::within(TimeDelta::seconds(seconds))
    }

    pub fn forever() -> Self {
        Self {
            period: UniquePeriod::Infinity,
            ..Default::default()
        }
    }

    pub fn by_fields(mut self, fields: Vec<UniqueField>) -> Self {
        self.fields = fields;
        self
    }

    pub fn by_keys(mut self, keys: Vec<impl Into<String>>) -> Self {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn for_states(mut self, states: Vec<JobState>) -> Self {
        self.states = states;
        self
    }

    pub fn compares(&self, field: UniqueField) -> bool {
        self.fields.contains(&field)
    }

    /// Whether an existing row's args collide with the candidate's under
    /// these options.
    ///
    /// With `keys` the named values are extracted and compared pairwise,
    /// otherwise the documents are compared structurally (key order does not
    /// matter).
    pub fn args_match(&self, candidate: &Value, existing: &Value) -> bool {
        if !self.compares(UniqueField::Args) {
            return true;
        }
        if self.keys.is_empty() {
            return candidate == existing;
        }
        self.keys
            .iter()
            .all(|key| candidate.get(key) == existing.get(key))
    }
}
