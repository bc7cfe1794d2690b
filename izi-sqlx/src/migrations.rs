//! Versioned schema definitions per engine.
//!
//! `migrate` applies each pending version inside its own transaction and
//! records it in `izi_migrations`; `rollback` walks the `down` statements of
//! every version strictly above the target, newest first.

pub(crate) struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub up: &'static [&'static str],
    pub down: &'static [&'static str],
}

pub(crate) const PG_MIGRATIONS_TABLE: &str = "CREATE TABLE IF NOT EXISTS izi_migrations (
    version BIGINT PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
)";

pub(crate) const PG_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_izi_jobs",
        up: &["CREATE TABLE izi_jobs (
    id BIGSERIAL PRIMARY KEY,
    state TEXT NOT NULL CHECK (state IN ('available','scheduled','executing','retryable','completed','discarded','cancelled')),
    queue TEXT NOT NULL,
    worker TEXT NOT NULL,
    args JSONB NOT NULL DEFAULT 'null'::jsonb,
    meta JSONB NOT NULL DEFAULT '{}'::jsonb,
    tags JSONB NOT NULL DEFAULT '[]'::jsonb,
    errors JSONB NOT NULL DEFAULT '[]'::jsonb,
    attempt INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 20,
    priority INTEGER NOT NULL DEFAULT 0,
    inserted_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    scheduled_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    attempted_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    discarded_at TIMESTAMPTZ,
    cancelled_at TIMESTAMPTZ
)"],
        down: &["DROP TABLE izi_jobs"],
    },
    Migration {
        version: 2,
        name: "index_izi_jobs",
        up: &[
            "CREATE INDEX izi_jobs_queue_state_idx ON izi_jobs (queue, state)",
            "CREATE INDEX izi_jobs_scheduled_at_idx ON izi_jobs (scheduled_at)",
            "CREATE INDEX izi_jobs_state_idx ON izi_jobs (state)",
        ],
        down: &[
            "DROP INDEX izi_jobs_state_idx",
            "DROP INDEX izi_jobs_scheduled_at_idx",
            "DROP INDEX izi_jobs_queue_state_idx",
        ],
    },
];

pub(crate) const MYSQL_MIGRATIONS_TABLE: &str = "CREATE TABLE IF NOT EXISTS izi_migrations (
    version BIGINT PRIMARY KEY,
    name VARCHAR(255) NOT NULL,
    applied_at TIMESTAMP(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6)
)";

pub(crate) const MYSQL_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_izi_jobs",
        up: &["CREATE TABLE izi_jobs (
    id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
    state VARCHAR(16) NOT NULL,
    queue VARCHAR(255) NOT NULL,
    worker VARCHAR(255) NOT NULL,
    args JSON NOT NULL,
    meta JSON NOT NULL,
    tags JSON NOT NULL,
    errors JSON NOT NULL,
    attempt INT NOT NULL DEFAULT 0,
    max_attempts INT NOT NULL DEFAULT 20,
    priority INT NOT NULL DEFAULT 0,
    inserted_at TIMESTAMP(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
    scheduled_at TIMESTAMP(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
    attempted_at TIMESTAMP(6) NULL,
    completed_at TIMESTAMP(6) NULL,
    discarded_at TIMESTAMP(6) NULL,
    cancelled_at TIMESTAMP(6) NULL,
    CONSTRAINT izi_jobs_state_chk CHECK (state IN ('available','scheduled','executing','retryable','completed','discarded','cancelled'))
)"],
        down: &["DROP TABLE izi_jobs"],
    },
    Migration {
        version: 2,
        name: "index_izi_jobs",
        up: &[
            "CREATE INDEX izi_jobs_queue_state_idx ON izi_jobs (queue, state)",
            "CREATE INDEX izi_jobs_scheduled_at_idx ON izi_jobs (scheduled_at)",
            "CREATE INDEX izi_jobs_state_idx ON izi_jobs (state)",
        ],
        down: &[
            "DROP INDEX izi_jobs_state_idx ON izi_jobs",
            "DROP INDEX izi_jobs_scheduled_at_idx ON izi_jobs",
            "DROP INDEX izi_jobs_queue_state_idx ON izi_jobs",
        ],
    },
];

pub(crate) const SQLITE_MIGRATIONS_TABLE: &str = "CREATE TABLE IF NOT EXISTS izi_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL
)";

pub(crate) const SQLITE_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_izi_jobs",
        up: &["CREATE TABLE izi_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    state TEXT NOT NULL CHECK (state IN ('available','scheduled','executing','retryable','completed','discarded','cancelled')),
    queue TEXT NOT NULL,
    worker TEXT NOT NULL,
    args TEXT NOT NULL DEFAULT 'null',
    meta TEXT NOT NULL DEFAULT '{}',
    tags TEXT NOT NULL DEFAULT '[]',
    errors TEXT NOT NULL DEFAULT '[]',
    attempt INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 20,
    priority INTEGER NOT NULL DEFAULT 0,
    inserted_at TEXT NOT NULL,
    scheduled_at TEXT NOT NULL,
    attempted_at TEXT,
    completed_at TEXT,
    discarded_at TEXT,
    cancelled_at TEXT
)"],
        down: &["DROP TABLE izi_jobs"],
    },
    Migration {
        version: 2,
        name: "index_izi_jobs",
        up: &[
            "CREATE INDEX izi_jobs_queue_state_idx ON izi_jobs (queue, state)",
            "CREATE INDEX izi_jobs_scheduled_at_idx ON izi_jobs (scheduled_at)",
            "CREATE INDEX izi_jobs_state_idx ON izi_jobs (state)",
        ],
        down: &[
            "DROP INDEX izi_jobs_state_idx",
            "DROP INDEX izi_jobs_scheduled_at_idx",
            "DROP INDEX izi_jobs_queue_state_idx",
        ],
    },
];
