//! Relational storage adapters for the izi job queue.
//!
//! Three engines, one observable behavior:
//!
//! - [`PgAdapter`]: PostgreSQL. Claims with `FOR UPDATE SKIP LOCKED` and
//!   wakes other processes over `LISTEN`/`NOTIFY`.
//! - [`MySqlAdapter`]: MySQL 8+. Claims with `FOR UPDATE SKIP LOCKED`
//!   inside an explicit transaction.
//! - [`SqliteAdapter`]: SQLite. Claims under `BEGIN IMMEDIATE`; the
//!   single-writer model makes the claim exclusive.
//!
//! Queries are checked at runtime (the schema comes from our own
//! migrations), so no database needs to be reachable at build time.

use izi::adapter::AdapterError;

mod migrations;
mod types;

pub mod mysql;
pub mod postgres;
pub mod sqlite;

pub use mysql::MySqlAdapter;
pub use postgres::PgAdapter;
pub use sqlite::SqliteAdapter;

/// The pub/sub channel insert announcements travel on.
pub const NOTIFY_CHANNEL: &str = "izi_jobs_insert";

pub(crate) fn map_err(error: sqlx::Error) -> AdapterError {
    AdapterError::database(error)
}

/// Column list shared by every SELECT/RETURNING in this crate.
pub(crate) const JOB_COLUMNS: &str = "id, state, queue, worker, args, meta, tags, errors, \
     attempt, max_attempts, priority, inserted_at, scheduled_at, \
     attempted_at, completed_at, discarded_at, cancelled_at";
