//! The MySQL adapter. Requires MySQL 8+ for `SKIP LOCKED`.
//!
//! MySQL has no `RETURNING`, so multi-step operations (claim, update) run
//! inside explicit transactions and re-select the affected rows before
//! committing.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::{MySql, QueryBuilder};

use izi::adapter::{AdapterError, CancelCriteria, StorageAdapter};
use izi::job::{Job, JobId, JobState, JobUpdate, NewJob, UniqueField, UniqueOptions};

use crate::migrations::{MYSQL_MIGRATIONS, MYSQL_MIGRATIONS_TABLE};
use crate::types::{sort_claimed, JobRow};
use crate::{map_err, JOB_COLUMNS};

pub struct MySqlAdapter {
    pool: MySqlPool,
}

impl MySqlAdapter {
    pub async fn connect(url: &str) -> Result<Self, AdapterError> {
        let pool = MySqlPoolOptions::new().connect(url).await.map_err(map_err)?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

fn json_path(key: &str) -> String {
    format!("$.\"{}\"", key.replace('"', "\\\""))
}

fn push_state_list(builder: &mut QueryBuilder<'_, MySql>, states: &[JobState]) {
    builder.push("(");
    let mut list = builder.separated(", ");
    for state in states {
        list.push_bind(state.as_str());
    }
    builder.push(")");
}

#[async_trait]
impl StorageAdapter for MySqlAdapter {
    async fn migrate(&self) -> Result<(), AdapterError> {
        sqlx::query(MYSQL_MIGRATIONS_TABLE)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        let applied: Vec<i64> =
            sqlx::query_scalar("SELECT version FROM izi_migrations ORDER BY version")
                .fetch_all(&self.pool)
                .await
                .map_err(map_err)?;

        for migration in MYSQL_MIGRATIONS {
            if applied.contains(&migration.version) {
                continue;
            }
            // MySQL DDL commits implicitly, so the transaction only protects
            // the bookkeeping row
            let mut tx = self.pool.begin().await.map_err(map_err)?;
            for statement in migration.up {
                sqlx::query(statement).execute(&mut *tx).await.map_err(map_err)?;
            }
            sqlx::query("INSERT INTO izi_migrations (version, name) VALUES (?, ?)")
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
        sqlx::query(MYSQL_MIGRATIONS_TABLE)
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
            let Some(migration) = MYSQL_MIGRATIONS.iter().find(|m| m.version == version) else {
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
        let result = sqlx::query(
            "INSERT INTO izi_jobs \
             (state, queue, worker, args, meta, tags, errors, attempt, max_attempts, priority, inserted_at, scheduled_at) \
             VALUES (?, ?, ?, ?, ?, ?, '[]', 0, ?, ?, ?, ?)",
        )
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
        .execute(&self.pool)
        .await
        .map_err(map_err)?;

        let id = JobId(result.last_insert_id() as i64);
        self.get_job(id).await?.ok_or(AdapterError::JobNotFound(id))
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, AdapterError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM izi_jobs WHERE id = ?");
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

        let mut tx = self.pool.begin().await.map_err(map_err)?;

        let sql = format!("SELECT {JOB_COLUMNS} FROM izi_jobs WHERE id = ? FOR UPDATE");
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_err)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let current: Job = row.try_into()?;

        if let Some(to) = update.state {
            if !current.state.can_transition(to) {
                return Err(AdapterError::InvalidTransition {
                    from: current.state,
                    to,
                });
            }
        }

        let mut builder = QueryBuilder::<MySql>::new("UPDATE izi_jobs SET ");
        push_assignments(&mut builder, &update)?;
        builder.push(" WHERE id = ").push_bind(id.0);
        builder.build().execute(&mut *tx).await.map_err(map_err)?;

        let sql = format!("SELECT {JOB_COLUMNS} FROM izi_jobs WHERE id = ?");
        let row: JobRow = sqlx::query_as(&sql)
            .bind(id.0)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_err)?;
        tx.commit().await.map_err(map_err)?;

        Ok(Some(row.try_into()?))
    }

    async fn fetch_jobs(&self, queue: &str, limit: usize) -> Result<Vec<Job>, AdapterError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(map_err)?;

        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM izi_jobs \
             WHERE queue = ? AND state = 'available' AND scheduled_at <= ? \
             ORDER BY priority ASC, scheduled_at ASC, id ASC \
             LIMIT ? \
             FOR UPDATE SKIP LOCKED",
        )
        .bind(queue)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_err)?;

        if ids.is_empty() {
            tx.commit().await.map_err(map_err)?;
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::<MySql>::new(
            "UPDATE izi_jobs SET state = 'executing', attempted_at = ",
        );
        builder.push_bind(now).push(", attempt = attempt + 1 WHERE id IN (");
        let mut list = builder.separated(", ");
        for id in &ids {
            list.push_bind(id);
        }
        builder.push(")");
        builder.build().execute(&mut *tx).await.map_err(map_err)?;

        let mut builder = QueryBuilder::<MySql>::new(format!("SELECT {JOB_COLUMNS} FROM izi_jobs WHERE id IN ("));
        let mut list = builder.separated(", ");
        for id in &ids {
            list.push_bind(id);
        }
        builder.push(")");
        let rows: Vec<JobRow> = builder
            .build_query_as()
            .fetch_all(&mut *tx)
            .await
            .map_err(map_err)?;
        tx.commit().await.map_err(map_err)?;

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
             WHERE state IN ('scheduled', 'retryable') AND scheduled_at <= ?",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected())
    }

    async fn cancel_jobs(&self, criteria: CancelCriteria) -> Result<u64, AdapterError> {
        let mut builder = QueryBuilder::<MySql>::new(
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

    async fn check_unique(
        &self,
        options: &UniqueOptions,
        candidate: &NewJob,
    ) -> Result<Option<Job>, AdapterError> {
        let mut builder = QueryBuilder::<MySql>::new("SELECT ");
        builder.push(JOB_COLUMNS).push(" FROM izi_jobs WHERE state IN ");
        push_state_list(&mut builder, &options.states);
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
                // JSON = JSON comparison is value-based in MySQL
                builder
                    .push(" AND args = CAST(")
                    .push_bind(serde_json::to_string(&candidate.args)?)
                    .push(" AS JSON)");
            } else {
                for key in &options.keys {
                    match candidate.args.get(key) {
                        Some(value) => {
                            builder
                                .push(" AND JSON_EXTRACT(args, ")
                                .push_bind(json_path(key))
                                .push(") <=> CAST(")
                                .push_bind(serde_json::to_string(value)?)
                                .push(" AS JSON)");
                        }
                        None => {
                            builder
                                .push(" AND JSON_EXTRACT(args, ")
                                .push_bind(json_path(key))
                                .push(") IS NULL");
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
        let mut builder = QueryBuilder::<MySql>::new("SELECT COUNT(*) FROM izi_jobs WHERE state IN ");
        push_state_list(&mut builder, states);
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
    builder: &mut QueryBuilder<'_, MySql>,
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

// These run against a live server; point IZI_TEST_MYSQL_URL at one and drop
// the ignore flags to exercise them.
#[cfg(test)]
mod test {
    use super::*;
    use izi::job::{DEFAULT_MAX_ATTEMPTS, DEFAULT_QUEUE};
    use serde_json::json;

    async fn adapter() -> MySqlAdapter {
        let url = std::env::var("IZI_TEST_MYSQL_URL")
            .expect("set IZI_TEST_MYSQL_URL to run mysql tests");
        let adapter = MySqlAdapter::connect(&url).await.unwrap();
        adapter.rollback(0).await.unwrap();
        adapter.migrate().await.unwrap();
        adapter
    }

    fn new_job() -> NewJob {
        NewJob {
            queue: DEFAULT_QUEUE.to_owned(),
            worker: "mailer".to_owned(),
            args: json!({"user_id": 1}),
            meta: Default::default(),
            tags: vec![],
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            priority: 0,
            scheduled_at: Utc::now(),
            unique: None,
        }
    }

    #[tokio::test]
    #[ignore = "requires a mysql server"]
    async fn insert_fetch_round_trip() {
        let adapter = adapter().await;

        let inserted = adapter.insert_job(new_job()).await.unwrap();
        assert_eq!(inserted.state, JobState::Available);

        let fetched = adapter.fetch_jobs(DEFAULT_QUEUE, 10).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].id, inserted.id);
        assert_eq!(fetched[0].state, JobState::Executing);
        assert_eq!(fetched[0].attempt, 1);

        assert!(adapter.fetch_jobs(DEFAULT_QUEUE, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore = "requires a mysql server"]
    async fn unique_check_compares_args_by_value() {
        let adapter = adapter().await;
        adapter.insert_job(new_job()).await.unwrap();

        let hit = adapter
            .check_unique(&UniqueOptions::within_secs(60), &new_job())
            .await
            .unwrap();
        assert!(hit.is_some());
    }
}
