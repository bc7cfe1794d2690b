//! An in-memory implementation of [`StorageAdapter`].
//!
//! Provided as a correct (but not optimized) implementation for tests and
//! single-process experiments. It is not designed for production use: rows
//! live in a `Vec` behind a lock and nothing survives a restart.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::{apply_update, AdapterError, CancelCriteria, StorageAdapter};
use crate::job::{Job, JobId, JobState, JobUpdate, NewJob, UniqueField, UniqueOptions};

#[derive(Clone, Default)]
pub struct InMemoryAdapter {
    jobs: Arc<RwLock<Vec<Job>>>,
    id_counter: Arc<AtomicI64>,
}

impl InMemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored row, for assertions in tests.
    pub fn all_jobs(&self) -> Vec<Job> {
        self.read().clone()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Job>> {
        self.jobs.read().unwrap_or_else(|poison| poison.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Job>> {
        self.jobs.write().unwrap_or_else(|poison| poison.into_inner())
    }
}

fn matches_criteria(job: &Job, criteria: &CancelCriteria) -> bool {
    criteria
        .queue
        .as_ref()
        .map_or(true, |queue| &job.queue == queue)
        && criteria
            .worker
            .as_ref()
            .map_or(true, |worker| &job.worker == worker)
        && criteria.state.map_or(true, |state| job.state == state)
}

#[async_trait]
impl StorageAdapter for InMemoryAdapter {
    async fn migrate(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn rollback(&self, _target_version: i64) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn insert_job(&self, new: NewJob) -> Result<Job, AdapterError> {
        let now = Utc::now();
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let job = Job {
            id: JobId(id),
            state: new.initial_state(now),
            queue: new.queue,
            worker: new.worker,
            args: new.args,
            meta: new.meta,
            tags: new.tags,
            errors: Vec::new(),
            attempt: 0,
            max_attempts: new.max_attempts,
            priority: new.priority,
            inserted_at: now,
            scheduled_at: new.scheduled_at,
            attempted_at: None,
            completed_at: None,
            discarded_at: None,
            cancelled_at: None,
        };
        self.write().push(job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, AdapterError> {
        Ok(self.read().iter().find(|job| job.id == id).cloned())
    }

    async fn update_job(&self, id: JobId, update: JobUpdate) -> Result<Option<Job>, AdapterError> {
        let mut jobs = self.write();
        match jobs.iter_mut().find(|job| job.id == id) {
            None => Ok(None),
            Some(job) => {
                apply_update(job, update)?;
                Ok(Some(job.clone()))
            }
        }
    }

    async fn fetch_jobs(&self, queue: &str, limit: usize) -> Result<Vec<Job>, AdapterError> {
        let now = Utc::now();
        let mut jobs = self.write();
        let mut claimable: Vec<&mut Job> = jobs
            .iter_mut()
            .filter(|job| {
                job.queue == queue && job.state == JobState::Available && job.scheduled_at <= now
            })
            .collect();
        claimable.sort_by_key(|job| (job.priority, job.scheduled_at, job.id.0));

        Ok(claimable
            .into_iter()
            .take(limit)
            .map(|job| {
                job.state = JobState::Executing;
                job.attempt += 1;
                job.attempted_at = Some(now);
                job.clone()
            })
            .collect())
    }

    async fn stage_jobs(&self) -> Result<u64, AdapterError> {
        let now = Utc::now();
        let mut count = 0;
        for job in self.write().iter_mut() {
            if matches!(job.state, JobState::Scheduled | JobState::Retryable)
                && job.scheduled_at <= now
            {
                job.state = JobState::Available;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn cancel_jobs(&self, criteria: CancelCriteria) -> Result<u64, AdapterError> {
        let now = Utc::now();
        let mut count = 0;
        for job in self.write().iter_mut() {
            if !job.state.is_terminal() && matches_criteria(job, &criteria) {
                job.state = JobState::Cancelled;
                job.cancelled_at = Some(now);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn rescue_stuck_jobs(&self, after: Duration) -> Result<u64, AdapterError> {
        let now = Utc::now();
        let cutoff = now - after;
        let mut count = 0;
        for job in self.write().iter_mut() {
            if job.state == JobState::Executing
                && job.attempted_at.is_some_and(|attempted| attempted < cutoff)
            {
                // a row whose crashed attempt was its last has no attempts
                // left to hand back out
                if job.attempt >= job.max_attempts {
                    job.state = JobState::Discarded;
                    job.discarded_at = Some(now);
                } else {
                    job.state = JobState::Available;
                    job.scheduled_at = now;
                }
                count += 1;
            }
        }
        Ok(count)
    }

    async fn prune_jobs(&self, max_age: Duration) -> Result<u64, AdapterError> {
        let cutoff = Utc::now() - max_age;
        let mut jobs = self.write();
        let before = jobs.len();
        jobs.retain(|job| {
            !(job.state.is_terminal()
                && job.terminal_at().is_some_and(|terminal| terminal < cutoff))
        });
        Ok((before - jobs.len()) as u64)
    }

    async fn check_unique(
        &self,
        options: &UniqueOptions,
        candidate: &NewJob,
    ) -> Result<Option<Job>, AdapterError> {
        let cutoff = options.period.cutoff(Utc::now());
        Ok(self
            .read()
            .iter()
            .find(|job| {
                options.states.contains(&job.state)
                    && cutoff.map_or(true, |cutoff| job.inserted_at > cutoff)
                    && (!options.compares(UniqueField::Worker) || job.worker == candidate.worker)
                    && (!options.compares(UniqueField::Queue) || job.queue == candidate.queue)
                    && options.args_match(&candidate.args, &job.args)
            })
            .cloned())
    }

    async fn count_jobs<'a>(
        &'a self,
        queue: Option<&'a str>,
        states: &'a [JobState],
    ) -> Result<u64, AdapterError> {
        Ok(self
            .read()
            .iter()
            .filter(|job| {
                queue.map_or(true, |queue| job.queue == queue) && states.contains(&job.state)
            })
            .count() as u64)
    }

    async fn close(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::job::{DEFAULT_MAX_ATTEMPTS, DEFAULT_QUEUE};
    use assert_matches::assert_matches;
    use chrono::{DateTime, TimeDelta, Utc};
    use serde_json::json;
    use std::collections::HashSet;

    pub(crate) fn new_job(worker: &str) -> NewJob {
        NewJob {
            queue: DEFAULT_QUEUE.to_owned(),
            worker: worker.to_owned(),
            args: json!({"n": 1}),
            meta: Default::default(),
            tags: vec![],
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            priority: 0,
            scheduled_at: Utc::now(),
            unique: None,
        }
    }

    fn scheduled_at(new: NewJob, scheduled_at: DateTime<Utc>) -> NewJob {
        NewJob {
            scheduled_at,
            ..new
        }
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let adapter = InMemoryAdapter::new();
        let mut new = new_job("mailer");
        new.tags = vec!["onboarding".to_owned()];
        new.args = json!({"user_id": 7});

        let inserted = adapter.insert_job(new).await.unwrap();
        let fetched = adapter.get_job(inserted.id).await.unwrap().unwrap();

        assert_eq!(fetched, inserted);
        assert_eq!(fetched.state, JobState::Available);
        assert_eq!(fetched.attempt, 0);
        assert_eq!(fetched.args, json!({"user_id": 7}));
        assert!(fetched.inserted_at <= fetched.scheduled_at || fetched.scheduled_at <= Utc::now());
    }

    #[tokio::test]
    async fn future_jobs_start_scheduled() {
        let adapter = InMemoryAdapter::new();
        let job = adapter
            .insert_job(scheduled_at(
                new_job("mailer"),
                Utc::now() + TimeDelta::hours(1),
            ))
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Scheduled);
    }

    #[tokio::test]
    async fn ids_are_monotonic() {
        let adapter = InMemoryAdapter::new();
        let first = adapter.insert_job(new_job("mailer")).await.unwrap();
        let second = adapter.insert_job(new_job("mailer")).await.unwrap();
        assert!(second.id.0 > first.id.0);
    }

    #[tokio::test]
    async fn fetch_claims_and_stamps() {
        let adapter = InMemoryAdapter::new();
        let inserted = adapter.insert_job(new_job("mailer")).await.unwrap();

        let claimed = adapter.fetch_jobs(DEFAULT_QUEUE, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        let job = &claimed[0];
        assert_eq!(job.id, inserted.id);
        assert_eq!(job.state, JobState::Executing);
        assert_eq!(job.attempt, 1);
        let attempted_at = job.attempted_at.expect("attempted_at must be stamped");
        assert!(Utc::now() - attempted_at < TimeDelta::seconds(1));

        // a second fetch must not see the same row
        assert!(adapter.fetch_jobs(DEFAULT_QUEUE, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fetch_respects_queue_and_due_time() {
        let adapter = InMemoryAdapter::new();
        let mut other_queue = new_job("mailer");
        other_queue.queue = "imports".to_owned();
        adapter.insert_job(other_queue).await.unwrap();
        adapter
            .insert_job(scheduled_at(
                new_job("mailer"),
                Utc::now() + TimeDelta::hours(1),
            ))
            .await
            .unwrap();

        assert!(adapter.fetch_jobs(DEFAULT_QUEUE, 10).await.unwrap().is_empty());
        assert_eq!(adapter.fetch_jobs("imports", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fetch_orders_by_priority_then_schedule_then_id() {
        let adapter = InMemoryAdapter::new();
        let early = Utc::now() - TimeDelta::minutes(10);
        let late = Utc::now() - TimeDelta::minutes(1);

        let mut normal = new_job("mailer");
        normal.priority = 0;
        let normal = adapter.insert_job(scheduled_at(normal, late)).await.unwrap();

        let mut urgent = new_job("mailer");
        urgent.priority = -10;
        let urgent = adapter.insert_job(scheduled_at(urgent, late)).await.unwrap();

        let mut relaxed = new_job("mailer");
        relaxed.priority = 10;
        let relaxed = adapter.insert_job(scheduled_at(relaxed, late)).await.unwrap();

        let mut older = new_job("mailer");
        older.priority = 0;
        let older = adapter.insert_job(scheduled_at(older, early)).await.unwrap();

        let claimed = adapter.fetch_jobs(DEFAULT_QUEUE, 10).await.unwrap();
        let ids: Vec<JobId> = claimed.iter().map(|job| job.id).collect();
        assert_eq!(ids, vec![urgent.id, older.id, normal.id, relaxed.id]);
    }

    #[tokio::test]
    async fn concurrent_fetches_never_overlap() {
        let adapter = InMemoryAdapter::new();
        for _ in 0..100 {
            adapter.insert_job(new_job("mailer")).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let adapter = adapter.clone();
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                for _ in 0..5 {
                    claimed.extend(adapter.fetch_jobs(DEFAULT_QUEUE, 5).await.unwrap());
                }
                claimed
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for job in handle.await.unwrap() {
                assert!(seen.insert(job.id), "job {} claimed twice", job.id);
                total += 1;
            }
        }
        assert_eq!(total, 100);
    }

    #[tokio::test]
    async fn update_patches_and_enforces_transitions() {
        let adapter = InMemoryAdapter::new();
        let job = adapter.insert_job(new_job("mailer")).await.unwrap();
        adapter.fetch_jobs(DEFAULT_QUEUE, 1).await.unwrap();

        let updated = adapter
            .update_job(
                job.id,
                JobUpdate {
                    state: Some(JobState::Completed),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.state, JobState::Completed);

        let err = adapter
            .update_job(
                job.id,
                JobUpdate {
                    state: Some(JobState::Executing),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_matches!(err, AdapterError::InvalidTransition { .. });

        let missing = adapter
            .update_job(JobId(9999), JobUpdate::default())
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn stage_promotes_due_scheduled_and_retryable() {
        let adapter = InMemoryAdapter::new();
        // a cancelled row with a past schedule must not be staged
        let cancelled = adapter
            .insert_job(scheduled_at(
                new_job("mailer"),
                Utc::now() - TimeDelta::seconds(1),
            ))
            .await
            .unwrap();
        adapter
            .update_job(
                cancelled.id,
                JobUpdate {
                    state: Some(JobState::Cancelled),
                    cancelled_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let scheduled = adapter
            .insert_job(scheduled_at(
                new_job("mailer"),
                Utc::now() + TimeDelta::hours(1),
            ))
            .await
            .unwrap();
        let retryable = adapter.insert_job(new_job("mailer")).await.unwrap();
        adapter.fetch_jobs(DEFAULT_QUEUE, 10).await.unwrap();
        adapter
            .update_job(
                retryable.id,
                JobUpdate {
                    state: Some(JobState::Retryable),
                    scheduled_at: Some(Utc::now() - TimeDelta::seconds(1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let staged = adapter.stage_jobs().await.unwrap();
        assert_eq!(staged, 1);

        let job = adapter.get_job(retryable.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Available);
        // the future-dated job stays scheduled
        let job = adapter.get_job(scheduled.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Scheduled);
    }

    #[tokio::test]
    async fn cancel_applies_criteria() {
        let adapter = InMemoryAdapter::new();
        let mailer = adapter.insert_job(new_job("mailer")).await.unwrap();
        let mut import = new_job("importer");
        import.queue = "imports".to_owned();
        let import = adapter.insert_job(import).await.unwrap();

        let count = adapter
            .cancel_jobs(CancelCriteria::queue("imports"))
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(
            adapter.get_job(import.id).await.unwrap().unwrap().state,
            JobState::Cancelled
        );
        assert_eq!(
            adapter.get_job(mailer.id).await.unwrap().unwrap().state,
            JobState::Available
        );

        // empty criteria cancel everything non-terminal, terminal rows stay
        let count = adapter.cancel_jobs(CancelCriteria::default()).await.unwrap();
        assert_eq!(count, 1);

        let job = adapter.get_job(import.id).await.unwrap().unwrap();
        assert!(job.cancelled_at.is_some());
    }

    #[tokio::test]
    async fn rescue_recovers_stuck_executing_rows() {
        let adapter = InMemoryAdapter::new();
        let job = adapter.insert_job(new_job("mailer")).await.unwrap();
        adapter.fetch_jobs(DEFAULT_QUEUE, 1).await.unwrap();

        // simulate a crash ten minutes ago
        {
            let mut jobs = adapter.write();
            let row = jobs.iter_mut().find(|row| row.id == job.id).unwrap();
            row.attempted_at = Some(Utc::now() - TimeDelta::minutes(10));
        }

        let rescued = adapter
            .rescue_stuck_jobs(Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(rescued, 1);

        let job = adapter.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Available);
        assert!(Utc::now() - job.scheduled_at < TimeDelta::seconds(1));

        // a fresh executing row is left alone
        adapter.insert_job(new_job("mailer")).await.unwrap();
        adapter.fetch_jobs(DEFAULT_QUEUE, 1).await.unwrap();
        let rescued = adapter
            .rescue_stuck_jobs(Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(rescued, 0);
    }

    #[tokio::test]
    async fn rescue_discards_rows_with_no_attempts_left() {
        let adapter = InMemoryAdapter::new();
        let mut new = new_job("mailer");
        new.max_attempts = 1;
        let job = adapter.insert_job(new).await.unwrap();
        adapter.fetch_jobs(DEFAULT_QUEUE, 1).await.unwrap();
        {
            let mut jobs = adapter.write();
            let row = jobs.iter_mut().find(|row| row.id == job.id).unwrap();
            row.attempted_at = Some(Utc::now() - TimeDelta::minutes(10));
        }

        let count = adapter
            .rescue_stuck_jobs(Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(count, 1);

        let job = adapter.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Discarded);
        assert!(job.discarded_at.is_some());
        assert_eq!(job.attempt, job.max_attempts);
    }

    #[tokio::test]
    async fn prune_deletes_only_old_terminal_rows() {
        let adapter = InMemoryAdapter::new();
        let keep = adapter.insert_job(new_job("mailer")).await.unwrap();
        let old = adapter.insert_job(new_job("mailer")).await.unwrap();
        adapter.fetch_jobs(DEFAULT_QUEUE, 10).await.unwrap();

        adapter
            .update_job(
                keep.id,
                JobUpdate {
                    state: Some(JobState::Completed),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        adapter
            .update_job(
                old.id,
                JobUpdate {
                    state: Some(JobState::Completed),
                    completed_at: Some(Utc::now() - TimeDelta::days(2)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let pruned = adapter.prune_jobs(Duration::from_secs(86_400)).await.unwrap();
        assert_eq!(pruned, 1);
        assert!(adapter.get_job(old.id).await.unwrap().is_none());
        assert!(adapter.get_job(keep.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn check_unique_matches_on_default_fields() {
        let adapter = InMemoryAdapter::new();
        let existing = adapter.insert_job(new_job("mailer")).await.unwrap();

        let hit = adapter
            .check_unique(&UniqueOptions::default(), &new_job("mailer"))
            .await
            .unwrap();
        assert_eq!(hit.map(|job| job.id), Some(existing.id));

        // different args, no hit
        let mut different = new_job("mailer");
        different.args = json!({"n": 2});
        let miss = adapter
            .check_unique(&UniqueOptions::default(), &different)
            .await
            .unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn check_unique_respects_period_and_states() {
        let adapter = InMemoryAdapter::new();
        let job = adapter.insert_job(new_job("mailer")).await.unwrap();

        // age the row past a one second period
        {
            let mut jobs = adapter.write();
            let row = jobs.iter_mut().find(|row| row.id == job.id).unwrap();
            row.inserted_at = Utc::now() - TimeDelta::seconds(5);
        }

        let miss = adapter
            .check_unique(&UniqueOptions::within_secs(1), &new_job("mailer"))
            .await
            .unwrap();
        assert!(miss.is_none());

        let hit = adapter
            .check_unique(&UniqueOptions::forever(), &new_job("mailer"))
            .await
            .unwrap();
        assert!(hit.is_some());

        // terminal rows never count with the default states
        adapter.cancel_jobs(CancelCriteria::default()).await.unwrap();
        let miss = adapter
            .check_unique(&UniqueOptions::forever(), &new_job("mailer"))
            .await
            .unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn check_unique_with_keys_compares_subset() {
        let adapter = InMemoryAdapter::new();
        let mut existing = new_job("mailer");
        existing.args = json!({"user_id": 1, "body": "hello"});
        adapter.insert_job(existing).await.unwrap();

        let options = UniqueOptions::default().by_keys(vec!["user_id"]);
        let mut candidate = new_job("mailer");
        candidate.args = json!({"user_id": 1, "body": "different"});
        assert!(adapter
            .check_unique(&options, &candidate)
            .await
            .unwrap()
            .is_some());

        candidate.args = json!({"user_id": 2, "body": "hello"});
        assert!(adapter
            .check_unique(&options, &candidate)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn count_jobs_filters_by_queue_and_state() {
        let adapter = InMemoryAdapter::new();
        adapter.insert_job(new_job("mailer")).await.unwrap();
        let mut import = new_job("importer");
        import.queue = "imports".to_owned();
        adapter.insert_job(import).await.unwrap();

        assert_eq!(
            adapter
                .count_jobs(None, &[JobState::Available])
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            adapter
                .count_jobs(Some("imports"), &[JobState::Available])
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            adapter
                .count_jobs(None, &[JobState::Executing])
                .await
                .unwrap(),
            0
        );
    }
}
