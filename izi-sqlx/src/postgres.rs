//! The PostgreSQL adapter.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use tokio::task::JoinHandle;

use izi::adapter::{AdapterError, CancelCriteria, NotifyCallback, StorageAdapter};
use izi::job::{Job, JobId, JobState, JobUpdate, NewJob, UniqueField, UniqueOptions};

use crate::migrations::{PG_MIGRATIONS, PG_MIGRATIONS_TABLE};
use crate::types::{legal_source_states, sort_claimed, state_strings, JobRow};
use crate::{map_err, JOB_COLUMNS, NOTIFY_CHANNEL};

#[derive(Debug, Serialize, Deserialize)]
struct InsertNotification {
    queue: String,
}

pub struct PgAdapter {
    pool: PgPool,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl PgAdapter {
    pub async fn connect(url: &str) -> Result<Self, AdapterError> {
        let pool = PgPoolOptions::new().connect(url).await.map_err(map_err)?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            listener: Mutex::new(None),
        }
    }
}

#[async_trait]
impl StorageAdapter for PgAdapter {
    async fn migrate(&self) -> Result<(), AdapterError> {
        sqlx::query(PG_MIGRATIONS_TABLE)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        let applied: Vec<i64> =
            sqlx::query_scalar("SELECT version FROM izi_migrations ORDER BY version")
                .fetch_all(&self.pool)
                .await
                .map_err(map_err)?;

        for migration in PG_MIGRATIONS {
            if applied.contains(&migration.version) {
                continue;
            }
            let mut tx = self.pool.begin().await.map_err(map_err)?;
            for statement in migration.up {
                sqlx::query(statement).execute(&mut *tx).await.map_err(map_err)?;
            }
            sqlx::query("INSERT INTO izi_migrations (version, name) VALUES ($1, $2)")
                .bind(migration.version)
                .bind(migration.name)
                .execute(&mut *tx)
                .await
                .map_err(map_err)?;
            tx.commit().await.map_err(map_err)?;
            tracing::info!(version = migration.version, name = migration.name, "applied migration");
        }
        Ok(())
    }

    async fn rollback(&self, target_version: i64) -> Result<(), AdapterError> {
        sqlx::query(PG_MIGRATIONS_TABLE)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        let applied: Vec<i64> =
            sqlx::query_scalar("SELECT version FROM izi_migrations WHERE version > $1 ORDER BY version DESC")
                .bind(target_version)
                .fetch_all(&self.pool)
                .await
                .map_err(map_err)?;

        for version in applied {
            let Some(migration) = PG_MIGRATIONS.iter().find(|m| m.version == version) else {
                return Err(AdapterError::BadState);
            };
            let mut tx = self.pool.begin().await.map_err(map_err)?;
            for statement in migration.down {
                sqlx::query(statement).execute(&mut *tx).await.map_err(map_err)?;
            }
            sqlx::query("DELETE FROM izi_migrations WHERE version = $1")
                .bind(version)
                .execute(&mut *tx)
                .await
                .map_err(map_err)?;
            tx.commit().await.map_err(map_err)?;
            tracing::info!(version, "rolled back migration");
        }
        Ok(())
    }

    async fn insert_job(&self, new: NewJob) -> Result<Job, AdapterError> {
        let now = Utc::now();
        let state = new.initial_state(now);
        let sql = format!(
            "INSERT INTO izi_jobs \
             (state, queue, worker, args, meta, tags, errors, attempt, max_attempts, priority, inserted_at, scheduled_at) \
             VALUES ($1, $2, $3, $4, $5, $6, '[]'::jsonb, 0, $7, $8, $9, $10) \
             RETURNING {JOB_COLUMNS}"
        );
        let row: JobRow = sqlx::query_as(&sql)
            .bind(state.as_str())
            .bind(&new.queue)
            .bind(&new.worker)
            .bind(&new.args)
            .bind(Value::Object(new.meta.clone()))
            .bind(serde_json::to_value(&new.tags)?)
            .bind(new.max_attempts)
            .bind(new.priority)
            .bind(now)
            .bind(new.scheduled_at)
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)?;
        row.try_into()
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, AdapterError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM izi_jobs WHERE id = $1");
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn update_job(&self, id: JobId, update: JobUpdate) -> Result<Option<Job>, AdapterError> {
        if update.is_empty() {
            return self.get_job(id).await;
        }
        let requested_state = update.state;

        let mut builder = QueryBuilder::<Postgres>::new("UPDATE izi_jobs SET ");
        push_assignments(&mut builder, &update)?;
        builder.push(" WHERE id = ").push_bind(id.0);
        if let Some(to) = requested_state {
            builder
                .push(" AND state = ANY(")
                .push_bind(legal_source_states(to))
                .push(")");
        }
        builder.push(" RETURNING ").push(JOB_COLUMNS);

        let row: Option<JobRow> = builder
            .build_query_as()
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;
        match row {
            Some(row) => Ok(Some(row.try_into()?)),
            // either the id does not exist or the transition guard rejected it
            None => match (self.get_job(id).await?, requested_state) {
                (None, _) => Ok(None),
                (Some(job), Some(to)) => Err(AdapterError::InvalidTransition {
                    from: job.state,
                    to,
                }),
                (Some(job), None) => Ok(Some(job)),
            },
        }
    }

    async fn fetch_jobs(&self, queue: &str, limit: usize) -> Result<Vec<Job>, AdapterError> {
        // claim with SKIP LOCKED so concurrent fetchers partition the rows
        let sql = "WITH claimable AS (
    SELECT id FROM izi_jobs
    WHERE queue = $1 AND state = 'available' AND scheduled_at <= $2
    ORDER BY priority ASC, scheduled_at ASC, id ASC
    LIMIT $3
    FOR UPDATE SKIP LOCKED
)
UPDATE izi_jobs
SET state = 'executing', attempted_at = $2, attempt = izi_jobs.attempt + 1
FROM claimable
WHERE izi_jobs.id = claimable.id
RETURNING izi_jobs.*";
        let rows: Vec<JobRow> = sqlx::query_as(sql)
            .bind(queue)
            .bind(Utc::now())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;

        let mut jobs = rows
            .into_iter()
            .map(TryInto::try_into)
            .collect::<Result<Vec<Job>, _>>()?;
        sort_claimed(&mut jobs);
        Ok(jobs)
    }

    async fn stage_jobs(&self) -> Result<u64, AdapterError> {
        let result = sqlx::query(
            "UPDATE izi_jobs SET state = 'available' \
             WHERE state IN ('scheduled', 'retryable') AND scheduled_at <= $1",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected())
    }

    async fn cancel_jobs(&self, criteria: CancelCriteria) -> Result<u64, AdapterError> {
        let now = Utc::now();
        let mut builder = QueryBuilder::<Postgres>::new(
            "UPDATE izi_jobs SET state = 'cancelled', cancelled_at = ",
        );
        builder
            .push_bind(now)
            .push(" WHERE state NOT IN ('completed', 'discarded', 'cancelled')");
        if let Some(queue) = &criteria.queue {
            builder.push(" AND queue = ").push_bind(queue);
        }
        if let Some(worker) = &criteria.worker {
            builder.push(" AND worker = ").push_bind(worker);
        }
        if let Some(state) = criteria.state {
            builder.push(" AND state = ").push_bind(state.as_str());
        }
        let result = builder.build().execute(&self.pool).await.map_err(map_err)?;
        Ok(result.rows_affected())
    }

    async fn rescue_stuck_jobs(&self, after: Duration) -> Result<u64, AdapterError> {
        let now = Utc::now();
        let cutoff = now - after;
        // rows whose crashed attempt was their last have nothing left to
        // hand back out
        let discarded = sqlx::query(
            "UPDATE izi_jobs SET state = 'discarded', discarded_at = $1 \
             WHERE state = 'executing' AND attempted_at < $2 AND attempt >= max_attempts",
        )
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        let rescued = sqlx::query(
            "UPDATE izi_jobs SET state = 'available', scheduled_at = $1 \
             WHERE state = 'executing' AND attempted_at < $2 AND attempt < max_attempts",
        )
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(discarded.rows_affected() + rescued.rows_affected())
    }

    async fn prune_jobs(&self, max_age: Duration) -> Result<u64, AdapterError> {
        let result = sqlx::query(
            "DELETE FROM izi_jobs \
             WHERE state IN ('completed', 'discarded', 'cancelled') \
             AND COALESCE(completed_at, discarded_at, cancelled_at) < $1",
        )
        .bind(Utc::now() - max_age)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected())
    }

    async fn check_unique(
        &self,
        options: &UniqueOptions,
        candidate: &NewJob,
    ) -> Result<Option<Job>, AdapterError> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT ");
        builder
            .push(JOB_COLUMNS)
            .push(" FROM izi_jobs WHERE state = ANY(")
            .push_bind(state_strings(&options.states))
            .push(")");
        if let Some(cutoff) = options.period.cutoff(Utc::now()) {
            builder.push(" AND inserted_at > ").push_bind(cutoff);
        }
        if options.compares(UniqueField::Worker) {
            builder.push(" AND worker = ").push_bind(&candidate.worker);
        }
        if options.compares(UniqueField::Queue) {
            builder.push(" AND queue = ").push_bind(&candidate.queue);
        }
        if options.compares(UniqueField::Args) {
            if options.keys.is_empty() {
                // jsonb equality is canonical: key order and whitespace
                // do not matter
                builder.push(" AND args = ").push_bind(candidate.args.clone());
            } else {
                for key in &options.keys {
                    match candidate.args.get(key) {
                        Some(value) => {
                            builder
                                .push(" AND args -> ")
                                .push_bind(key.as_str())
                                .push(" = ")
                                .push_bind(value.clone());
                        }
                        None => {
                            builder
                                .push(" AND args -> ")
                                .push_bind(key.as_str())
                                .push(" IS NULL");
                        }
                    }
                }
            }
        }
        builder.push(" ORDER BY id ASC LIMIT 1");

        let row: Option<JobRow> = builder
            .build_query_as()
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn count_jobs<'a>(
        &'a self,
        queue: Option<&'a str>,
        states: &'a [JobState],
    ) -> Result<u64, AdapterError> {
        let mut builder =
            QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM izi_jobs WHERE state = ANY(");
        builder.push_bind(state_strings(states)).push(")");
        if let Some(queue) = queue {
            builder.push(" AND queue = ").push_bind(queue);
        }
        let count: i64 = builder
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(count as u64)
    }

    fn supports_notify(&self) -> bool {
        true
    }

    /// Listens on the insert channel, reconnecting with exponential backoff
    /// (capped at 30 s) for up to ten attempts.
    async fn listen(&self, callback: NotifyCallback) -> Result<(), AdapterError> {
        let pool = self.pool.clone();
        let handle = tokio::spawn(async move {
            let mut attempts: u32 = 0;
            loop {
                match PgListener::connect_with(&pool).await {
                    Ok(mut listener) => match listener.listen(NOTIFY_CHANNEL).await {
                        Ok(()) => {
                            attempts = 0;
                            loop {
                                match listener.recv().await {
                                    Ok(notification) => {
                                        match serde_json::from_str::<InsertNotification>(
                                            notification.payload(),
                                        ) {
                                            Ok(message) => callback(&message.queue),
                                            Err(error) => tracing::warn!(
                                                ?error,
                                                "ignoring malformed notify payload"
                                            ),
                                        }
                                    }
                                    Err(error) => {
                                        tracing::warn!(?error, "notify connection lost");
                                        break;
                                    }
                                }
                            }
                        }
                        Err(error) => tracing::warn!(?error, "failed to LISTEN"),
                    },
                    Err(error) => tracing::warn!(?error, "failed to connect the notify listener"),
                }

                attempts += 1;
                if attempts >= 10 {
                    tracing::error!("giving up on the notify listener after 10 attempts");
                    return;
                }
                let delay = Duration::from_secs((1u64 << attempts.min(5)).min(30));
                tokio::time::sleep(delay).await;
            }
        });
        *self.listener.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        Ok(())
    }

    async fn notify(&self, queue: &str) -> Result<(), AdapterError> {
        let payload = serde_json::to_string(&InsertNotification {
            queue: queue.to_owned(),
        })?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NOTIFY_CHANNEL)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), AdapterError> {
        if let Some(handle) = self.listener.lock().unwrap_or_else(|p| p.into_inner()).take() {
            handle.abort();
        }
        self.pool.close().await;
        Ok(())
    }
}

/// Appends `SET` assignments for the non-`None` fields of `update`.
fn push_assignments(
    builder: &mut QueryBuilder<'_, Postgres>,
    update: &JobUpdate,
) -> Result<(), AdapterError> {
    let mut assignments = builder.separated(", ");
    if let Some(state) = update.state {
        assignments.push("state = ").push_bind_unseparated(state.as_str());
    }
    if let Some(errors) = &update.errors {
        assignments
            .push("errors = ")
            .push_bind_unseparated(serde_json::to_value(errors)?);
    }
    if let Some(meta) = &update.meta {
        assignments
            .push("meta = ")
            .push_bind_unseparated(Value::Object(meta.clone()));
    }
    if let Some(tags) = &update.tags {
        assignments
            .push("tags = ")
            .push_bind_unseparated(serde_json::to_value(tags)?);
    }
    if let Some(max_attempts) = update.max_attempts {
        assignments
            .push("max_attempts = ")
            .push_bind_unseparated(max_attempts);
    }
    if let Some(priority) = update.priority {
        assignments.push("priority = ").push_bind_unseparated(priority);
    }
    if let Some(scheduled_at) = update.scheduled_at {
        assignments
            .push("scheduled_at = ")
            .push_bind_unseparated(scheduled_at);
    }
    if let Some(attempted_at) = update.attempted_at {
        assignments
            .push("attempted_at = ")
            .push_bind_unseparated(attempted_at);
    }
    if let Some(completed_at) = update.completed_at {
        assignments
            .push("completed_at = ")
            .push_bind_unseparated(completed_at);
    }
    if let Some(discarded_at) = update.discarded_at {
        assignments
            .push("discarded_at = ")
            .push_bind_unseparated(discarded_at);
    }
    if let Some(cancelled_at) = update.cancelled_at {
        assignments
            .push("cancelled_at = ")
            .push_bind_unseparated(cancelled_at);
    }
    Ok(())
}
