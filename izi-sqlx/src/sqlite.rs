//! The SQLite adapter.
//!
//! SQLite allows one writer at a time, so the claim runs under
//! `BEGIN IMMEDIATE` on a dedicated connection: acquiring the write lock up
//! front makes the select-and-update atomic with respect to every other
//! connection, which is all the fetch contract needs.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite};

use izi::adapter::{AdapterError, CancelCriteria, StorageAdapter};
use izi::job::{Job, JobId, JobState, JobUpdate, NewJob, UniqueField, UniqueOptions};

use crate::migrations::{SQLITE_MIGRATIONS, SQLITE_MIGRATIONS_TABLE};
use crate::types::{legal_source_states, sort_claimed, SqliteJobRow};
use crate::{map_err, JOB_COLUMNS};

pub struct SqliteAdapter {
    pool: SqlitePool,
}

impl SqliteAdapter {
    pub async fn connect(url: &str) -> Result<Self, AdapterError> {
        let pool = SqlitePoolOptions::new().connect(url).await.map_err(map_err)?;
        Ok(Self::from_pool(pool))
    }

    /// A private in-memory database, for tests and experiments. The pool is
    /// pinned to one connection because each `:memory:` connection is its
    /// own database.
    pub async fn in_memory() -> Result<Self, AdapterError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(map_err)?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn immediate(&self) -> Result<PoolConnection<Sqlite>, AdapterError> {
        let mut conn = self.pool.acquire().await.map_err(map_err)?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(map_err)?;
        Ok(conn)
    }
}

fn push_state_list(builder: &mut QueryBuilder<'_, Sqlite>, states: &[String]) {
    builder.push("(");
    let mut list = builder.separated(", ");
    for state in states {
        list.push_bind(state.clone());
    }
    builder.push(")");
}

#[async_trait]
impl StorageAdapter for SqliteAdapter {
    async fn migrate(&self) -> Result<(), AdapterError> {
        sqlx::query(SQLITE_MIGRATIONS_TABLE)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        let applied: Vec<i64> =
            sqlx::query_scalar("SELECT version FROM izi_migrations ORDER BY version")
                .fetch_all(&self.pool)
                .await
                .map_err(map_err)?;

        for migration in SQLITE_MIGRATIONS {
            if applied.contains(&migration.version) {
                continue;
            }
            let mut tx = self.pool.begin().await.map_err(map_err)?;
            for statement in migration.up {
                sqlx::query(statement).execute(&mut *tx).await.map_err(map_err)?;
            }
            sqlx::query("INSERT INTO izi_migrations (version, name, applied_at) VALUES (?, ?, ?)")
                .bind(migration.version)
                .bind(migration.name)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await
                .map_err(map_err)?;
            tx.commit().await.map_err(map_err)?;
            tracing::info!(version = migration.version, name = migration.name, "applied migration");
        }
        Ok(())
    }

    async fn rollback(&self, target_version: i64) -> Result<(), AdapterError> {
        sqlx::query(SQLITE_MIGRATIONS_TABLE)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        let applied: Vec<i64> = sqlx::query_scalar(
            "SELECT version FROM izi_migrations WHERE version > ? ORDER BY version DESC",
        )
        .bind(target_version)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;

        for version in applied {
            let Some(migration) = SQLITE_MIGRATIONS.iter().find(|m| m.version == version) else {
                return Err(AdapterError::BadState);
            };
            let mut tx = self.pool.begin().await.map_err(map_err)?;
            for statement in migration.down {
                sqlx::query(statement).execute(&mut *tx).await.map_err(map_err)?;
            }
            sqlx::query("DELETE FROM izi_migrations WHERE version = ?")
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
             VALUES (?, ?, ?, ?, ?, ?, '[]', 0, ?, ?, ?, ?) \
             RETURNING {JOB_COLUMNS}"
        );
        let row: SqliteJobRow = sqlx::query_as(&sql)
            .bind(state.as_str())
            .bind(&new.queue)
            .bind(&new.worker)
            .bind(serde_json::to_string(&new.args)?)
            .bind(serde_json::to_string(&new.meta)?)
            .bind(serde_json::to_string(&new.tags)?)
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
        let sql = format!("SELECT {JOB_COLUMNS} FROM izi_jobs WHERE id = ?");
        let row: Option<SqliteJobRow> = sqlx::query_as(&sql)
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

        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE izi_jobs SET ");
        push_assignments(&mut builder, &update)?;
        builder.push(" WHERE id = ").push_bind(id.0);
        if let Some(to) = requested_state {
            builder.push(" AND state IN ");
            push_state_list(&mut builder, &legal_source_states(to));
        }
        builder.push(" RETURNING ").push(JOB_COLUMNS);

        let row: Option<SqliteJobRow> = builder
            .build_query_as()
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;
        match row {
            Some(row) => Ok(Some(row.try_into()?)),
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
        let now = Utc::now();
        let mut conn = self.immediate().await?;

        let sql = format!(
            "UPDATE izi_jobs SET state = 'executing', attempted_at = ?1, attempt = attempt + 1 \
             WHERE id IN ( \
                 SELECT id FROM izi_jobs \
                 WHERE queue = ?2 AND state = 'available' AND scheduled_at <= ?1 \
                 ORDER BY priority ASC, scheduled_at ASC, id ASC \
                 LIMIT ?3 \
             ) \
             RETURNING {JOB_COLUMNS}"
        );
        let claimed: Result<Vec<SqliteJobRow>, sqlx::Error> = sqlx::query_as(&sql)
            .bind(now)
            .bind(queue)
            .bind(limit as i64)
            .fetch_all(&mut *conn)
            .await;

        match claimed {
            Ok(rows) => {
                sqlx::query("COMMIT").execute(&mut *conn).await.map_err(map_err)?;
                let mut jobs = rows
                    .into_iter()
                    .map(TryInto::try_into)
                    .collect::<Result<Vec<Job>, _>>()?;
                sort_claimed(&mut jobs);
                Ok(jobs)
            }
            Err(error) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(map_err(error))
            }
        }
    }

    async fn stage_jobs(&self) -> Result<u64, AdapterError> {
        let result = sqlx::query(
            "UPDATE izi_jobs SET state = 'available' \
             WHERE state IN ('scheduled', 'retryable') AND scheduled_at <= ?",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected())
    }

    async fn cancel_jobs(&self, criteria: CancelCriteria) -> Result<u64, AdapterError> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "UPDATE izi_jobs SET state = 'cancelled', cancelled_at = ",
        );
        builder
            .push_bind(Utc::now())
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
        let discarded = sqlx::query(
            "UPDATE izi_jobs SET state = 'discarded', discarded_at = ? \
             WHERE state = 'executing' AND attempted_at < ? AND attempt >= max_attempts",
        )
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        let rescued = sqlx::query(
            "UPDATE izi_jobs SET state = 'available', scheduled_at = ? \
             WHERE state = 'executing' AND attempted_at < ? AND attempt < max_attempts",
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
             AND COALESCE(completed_at, discarded_at, cancelled_at) < ?",
        )
        .bind(Utc::now() - max_age)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected())
    }

    /// Narrows candidates in SQL, but compares args in Rust: SQLite has no
    /// canonical JSON comparison, and TEXT equality would be sensitive to
    /// key order.
    async fn check_unique(
        &self,
        options: &UniqueOptions,
        candidate: &NewJob,
    ) -> Result<Option<Job>, AdapterError> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT ");
        builder.push(JOB_COLUMNS).push(" FROM izi_jobs WHERE state IN ");
        push_state_list(&mut builder, &crate::types::state_strings(&options.states));
        if let Some(cutoff) = options.period.cutoff(Utc::now()) {
            builder.push(" AND inserted_at > ").push_bind(cutoff);
        }
        if options.compares(UniqueField::Worker) {
            builder.push(" AND worker = ").push_bind(&candidate.worker);
        }
        if options.compares(UniqueField::Queue) {
            builder.push(" AND queue = ").push_bind(&candidate.queue);
        }
        builder.push(" ORDER BY id ASC");

        let rows: Vec<SqliteJobRow> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
        for row in rows {
            let job: Job = row.try_into()?;
            if options.args_match(&candidate.args, &job.args) {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    async fn count_jobs<'a>(
        &'a self,
        queue: Option<&'a str>,
        states: &'a [JobState],
    ) -> Result<u64, AdapterError> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM izi_jobs WHERE state IN ");
        push_state_list(&mut builder, &crate::types::state_strings(states));
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

    async fn close(&self) -> Result<(), AdapterError> {
        self.pool.close().await;
        Ok(())
    }
}

/// Appends `SET` assignments for the non-`None` fields of `update`.
fn push_assignments(
    builder: &mut QueryBuilder<'_, Sqlite>,
    update: &JobUpdate,
) -> Result<(), AdapterError> {
    let mut assignments = builder.separated(", ");
    if let Some(state) = update.state {
        assignments.push("state = ").push_bind_unseparated(state.as_str());
    }
    if let Some(errors) = &update.errors {
        assignments
            .push("errors = ")
            .push_bind_unseparated(serde_json::to_string(errors)?);
    }
    if let Some(meta) = &update.meta {
        assignments
            .push("meta = ")
            .push_bind_unseparated(serde_json::to_string(meta)?);
    }
    if let Some(tags) = &update.tags {
        assignments
            .push("tags = ")
            .push_bind_unseparated(serde_json::to_string(tags)?);
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
