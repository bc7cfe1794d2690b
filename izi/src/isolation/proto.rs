//! The wire protocol between the pool and its contexts: one JSON document
//! per line, camelCase field names, dates as ISO-8601 strings.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::Job;
use crate::worker::WorkerResult;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum Request {
    #[serde(rename_all = "camelCase")]
    Execute {
        job_id: i64,
        job: Job,
        /// Registry name the context resolves its handler with.
        worker: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum Response {
    #[serde(rename_all = "camelCase")]
    Result { job_id: i64, result: Outcome },
    #[serde(rename_all = "camelCase")]
    Error {
        job_id: i64,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
}

/// A non-error handler outcome in serializable form.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub(crate) enum Outcome {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },
    Cancelled {
        reason: String,
    },
    Snooze {
        seconds: u64,
    },
}

impl From<Outcome> for WorkerResult {
    fn from(value: Outcome) -> Self {
        match value {
            Outcome::Ok { value } => WorkerResult::Done(value),
            Outcome::Cancelled { reason } => WorkerResult::Cancelled { reason },
            Outcome::Snooze { seconds } => {
                WorkerResult::Snooze {
                    delay: chrono::TimeDelta::seconds(seconds.min(i64::MAX as u64) as i64),
                }
            }
        }
    }
}
