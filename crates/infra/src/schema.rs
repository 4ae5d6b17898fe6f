//! Postgres schema for the message, lease and job tables.
//!
//! Statements are idempotent (`IF NOT EXISTS`), so `initialize` is safe to run
//! on every start.

use sqlx::PgPool;
use tracing::info;

pub const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS published_messages (
        id          TEXT        PRIMARY KEY,
        name        TEXT        NOT NULL,
        group_name  TEXT        NULL,
        content     JSONB       NOT NULL,
        body        BYTEA       NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL,
        expires_at  TIMESTAMPTZ NULL,
        retry_count INTEGER     NOT NULL DEFAULT 0,
        status      TEXT        NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS received_messages (
        id          TEXT        PRIMARY KEY,
        name        TEXT        NOT NULL,
        group_name  TEXT        NULL,
        content     JSONB       NOT NULL,
        body        BYTEA       NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL,
        expires_at  TIMESTAMPTZ NULL,
        retry_count INTEGER     NOT NULL DEFAULT 0,
        status      TEXT        NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS ix_published_status_expires ON published_messages (status, expires_at)",
    "CREATE INDEX IF NOT EXISTS ix_published_status_created ON published_messages (status, created_at)",
    "CREATE INDEX IF NOT EXISTS ix_received_status_expires ON received_messages (status, expires_at)",
    "CREATE INDEX IF NOT EXISTS ix_received_status_created ON received_messages (status, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS leases (
        key        TEXT        PRIMARY KEY,
        owner      TEXT        NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scheduled_jobs (
        id                 UUID        PRIMARY KEY,
        name               TEXT        NOT NULL UNIQUE,
        job_type           TEXT        NOT NULL,
        consumer_type_name TEXT        NOT NULL,
        cron_expression    TEXT        NOT NULL,
        time_zone          TEXT        NOT NULL,
        payload            JSONB       NOT NULL,
        next_run_time      TIMESTAMPTZ NOT NULL,
        retry_intervals    BIGINT[]    NOT NULL DEFAULT '{}',
        skip_if_running    BOOLEAN     NOT NULL DEFAULT TRUE,
        is_enabled         BOOLEAN     NOT NULL DEFAULT TRUE,
        timeout_ms         BIGINT      NULL,
        misfire_strategy   TEXT        NOT NULL,
        date_created       TIMESTAMPTZ NOT NULL,
        date_updated       TIMESTAMPTZ NOT NULL,
        status             TEXT        NOT NULL DEFAULT 'pending',
        lock_holder        TEXT        NULL,
        locked_at          TIMESTAMPTZ NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS ix_scheduled_jobs_due ON scheduled_jobs (status, is_enabled, next_run_time)",
    r#"
    CREATE TABLE IF NOT EXISTS job_executions (
        id             UUID        PRIMARY KEY,
        job_id         UUID        NOT NULL REFERENCES scheduled_jobs (id) ON DELETE CASCADE,
        attempt        INTEGER     NOT NULL,
        scheduled_time TIMESTAMPTZ NOT NULL,
        started_at     TIMESTAMPTZ NOT NULL,
        completed_at   TIMESTAMPTZ NULL,
        status         TEXT        NOT NULL,
        error          TEXT        NULL,
        duration_ms    BIGINT      NULL,
        lock_holder    TEXT        NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS ix_job_executions_job ON job_executions (job_id, started_at DESC)",
];

/// Create every table and index that does not exist yet.
pub async fn initialize(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    info!(statements = STATEMENTS.len(), "courier schema initialized");
    Ok(())
}
