//! Postgres-backed job store.
//!
//! Due jobs are claimed with a single `UPDATE … WHERE id IN (SELECT … FOR
//! UPDATE SKIP LOCKED)`, so schedulers on different instances never share a
//! claim and never wait on each other's locked rows.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use sqlx::postgres::PgRow;
use sqlx::Row;
use tokio_util::sync::CancellationToken;
use tracing::{Span, instrument};
use uuid::Uuid;

use courier_core::{ExecutionId, JobId, time};

use super::store::{JobStore, JobStoreError, ensure_active};
use super::types::{JobExecution, RetryIntervals, ScheduledJob};

const JOB_COLUMNS: &str = "id, name, job_type, consumer_type_name, cron_expression, time_zone, \
     payload, next_run_time, retry_intervals, skip_if_running, is_enabled, timeout_ms, \
     misfire_strategy, date_created, date_updated, status, lock_holder, locked_at";

const EXECUTION_COLUMNS: &str = "id, job_id, attempt, scheduled_time, started_at, completed_at, \
     status, error, duration_ms, lock_holder";

/// Postgres-backed job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the schema if it does not exist yet.
    pub async fn initialize(&self) -> Result<(), JobStoreError> {
        crate::schema::initialize(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("initialize", e))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job, cancel), fields(name = %job.name), err)]
    async fn upsert_job(
        &self,
        job: ScheduledJob,
        cancel: &CancellationToken,
    ) -> Result<ScheduledJob, JobStoreError> {
        ensure_active(cancel)?;
        let now = Utc::now();
        let sql = format!(
            "INSERT INTO scheduled_jobs ({JOB_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14, 'pending', NULL, NULL) \
             ON CONFLICT (name) DO UPDATE SET \
                 job_type = EXCLUDED.job_type, \
                 consumer_type_name = EXCLUDED.consumer_type_name, \
                 cron_expression = EXCLUDED.cron_expression, \
                 time_zone = EXCLUDED.time_zone, \
                 payload = EXCLUDED.payload, \
                 next_run_time = EXCLUDED.next_run_time, \
                 retry_intervals = EXCLUDED.retry_intervals, \
                 skip_if_running = EXCLUDED.skip_if_running, \
                 is_enabled = EXCLUDED.is_enabled, \
                 timeout_ms = EXCLUDED.timeout_ms, \
                 misfire_strategy = EXCLUDED.misfire_strategy, \
                 date_updated = EXCLUDED.date_updated \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(job.id.as_uuid())
            .bind(&job.name)
            .bind(&job.job_type)
            .bind(&job.consumer_type_name)
            .bind(&job.cron_expression)
            .bind(&job.time_zone)
            .bind(&job.payload)
            .bind(job.next_run_time)
            .bind(job.retry_intervals.to_millis())
            .bind(job.skip_if_running)
            .bind(job.is_enabled)
            .bind(job.timeout.map(duration_ms))
            .bind(job.misfire_strategy.as_str())
            .bind(now)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("upsert_job", e))?;

        decode_job(&row)
    }

    #[instrument(skip(self, cancel), err)]
    async fn get_job(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<ScheduledJob>, JobStoreError> {
        ensure_active(cancel)?;
        let sql = format!("SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE name = $1");
        let row = sqlx::query(&sql)
            .bind(name)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.as_ref().map(decode_job).transpose()
    }

    #[instrument(skip(self, cancel), err)]
    async fn list_jobs(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<ScheduledJob>, JobStoreError> {
        ensure_active(cancel)?;
        let sql = format!("SELECT {JOB_COLUMNS} FROM scheduled_jobs ORDER BY name");
        let rows = sqlx::query(&sql)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_jobs", e))?;

        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self, cancel), err)]
    async fn delete_job(&self, name: &str, cancel: &CancellationToken) -> Result<bool, JobStoreError> {
        ensure_active(cancel)?;
        let result = sqlx::query("DELETE FROM scheduled_jobs WHERE name = $1")
            .bind(name)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_job", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, cancel), fields(count = tracing::field::Empty), err)]
    async fn acquire_due_jobs(
        &self,
        batch_size: usize,
        lock_holder: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ScheduledJob>, JobStoreError> {
        ensure_active(cancel)?;
        let sql = format!(
            "UPDATE scheduled_jobs SET status = 'running', lock_holder = $2, locked_at = $3 \
             WHERE id IN ( \
                 SELECT id FROM scheduled_jobs \
                 WHERE is_enabled AND status = 'pending' AND next_run_time <= $3 \
                 ORDER BY next_run_time ASC \
                 LIMIT $1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {JOB_COLUMNS}"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
            .bind(lock_holder)
            .bind(Utc::now())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("acquire_due_jobs", e))?;

        let mut jobs = rows.iter().map(decode_job).collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by(|a, b| a.next_run_time.cmp(&b.next_run_time));
        Span::current().record("count", jobs.len());
        Ok(jobs)
    }

    #[instrument(skip(self, job_id, cancel), fields(job_id = %job_id), err)]
    async fn complete_run(
        &self,
        job_id: JobId,
        lock_holder: &str,
        next_run_time: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<bool, JobStoreError> {
        ensure_active(cancel)?;
        let result = sqlx::query(
            "UPDATE scheduled_jobs \
             SET status = 'pending', lock_holder = NULL, locked_at = NULL, next_run_time = $3 \
             WHERE id = $1 AND status = 'running' AND lock_holder = $2",
        )
        .bind(job_id.as_uuid())
        .bind(lock_holder)
        .bind(next_run_time)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete_run", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, cancel), fields(count = tracing::field::Empty), err)]
    async fn release_stale_jobs(
        &self,
        staleness: Duration,
        cancel: &CancellationToken,
    ) -> Result<usize, JobStoreError> {
        ensure_active(cancel)?;
        let result = sqlx::query(
            "UPDATE scheduled_jobs \
             SET status = 'pending', lock_holder = NULL, locked_at = NULL \
             WHERE status = 'running' AND locked_at < $1",
        )
        .bind(time::before(Utc::now(), staleness))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_stale_jobs", e))?;

        let released = usize::try_from(result.rows_affected()).unwrap_or(usize::MAX);
        Span::current().record("count", released);
        Ok(released)
    }

    #[instrument(skip(self, execution, cancel), fields(execution_id = %execution.id), err)]
    async fn create_execution(
        &self,
        execution: &JobExecution,
        cancel: &CancellationToken,
    ) -> Result<(), JobStoreError> {
        ensure_active(cancel)?;
        let sql = format!(
            "INSERT INTO job_executions ({EXECUTION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        );
        sqlx::query(&sql)
            .bind(execution.id.as_uuid())
            .bind(execution.job_id.as_uuid())
            .bind(i32::try_from(execution.attempt).unwrap_or(i32::MAX))
            .bind(execution.scheduled_time)
            .bind(execution.started_at)
            .bind(execution.completed_at)
            .bind(execution.status.as_str())
            .bind(&execution.error)
            .bind(execution.duration_ms.map(|ms| i64::try_from(ms).unwrap_or(i64::MAX)))
            .bind(&execution.lock_holder)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_execution", e))?;

        Ok(())
    }

    #[instrument(skip(self, execution, cancel), fields(execution_id = %execution.id), err)]
    async fn update_execution(
        &self,
        execution: &JobExecution,
        cancel: &CancellationToken,
    ) -> Result<(), JobStoreError> {
        ensure_active(cancel)?;
        let result = sqlx::query(
            "UPDATE job_executions \
             SET completed_at = $2, status = $3, error = $4, duration_ms = $5 \
             WHERE id = $1",
        )
        .bind(execution.id.as_uuid())
        .bind(execution.completed_at)
        .bind(execution.status.as_str())
        .bind(&execution.error)
        .bind(execution.duration_ms.map(|ms| i64::try_from(ms).unwrap_or(i64::MAX)))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_execution", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::ExecutionNotFound(execution.id));
        }
        Ok(())
    }

    #[instrument(skip(self, job_id, cancel), fields(job_id = %job_id), err)]
    async fn get_executions(
        &self,
        job_id: JobId,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<JobExecution>, JobStoreError> {
        ensure_active(cancel)?;
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM job_executions \
             WHERE job_id = $1 ORDER BY started_at DESC, id DESC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_executions", e))?;

        rows.iter().map(decode_execution).collect()
    }

    #[instrument(skip(self, cancel), fields(count = tracing::field::Empty), err)]
    async fn purge_executions(
        &self,
        retention: Duration,
        cancel: &CancellationToken,
    ) -> Result<usize, JobStoreError> {
        ensure_active(cancel)?;
        let result = sqlx::query("DELETE FROM job_executions WHERE completed_at < $1")
            .bind(time::before(Utc::now(), retention))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_executions", e))?;

        let purged = usize::try_from(result.rows_affected()).unwrap_or(usize::MAX);
        Span::current().record("count", purged);
        Ok(purged)
    }
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn decode_job(row: &PgRow) -> Result<ScheduledJob, JobStoreError> {
    let get = |e: sqlx::Error| map_sqlx_error("decode_job", e);

    let status: String = row.try_get("status").map_err(get)?;
    let misfire: String = row.try_get("misfire_strategy").map_err(get)?;
    let retry_intervals: Vec<i64> = row.try_get("retry_intervals").map_err(get)?;
    let timeout_ms: Option<i64> = row.try_get("timeout_ms").map_err(get)?;

    Ok(ScheduledJob {
        id: JobId::from_uuid(row.try_get::<Uuid, _>("id").map_err(get)?),
        name: row.try_get("name").map_err(get)?,
        job_type: row.try_get("job_type").map_err(get)?,
        consumer_type_name: row.try_get("consumer_type_name").map_err(get)?,
        cron_expression: row.try_get("cron_expression").map_err(get)?,
        time_zone: row.try_get("time_zone").map_err(get)?,
        payload: row.try_get::<JsonValue, _>("payload").map_err(get)?,
        next_run_time: row.try_get("next_run_time").map_err(get)?,
        retry_intervals: RetryIntervals::from_millis(&retry_intervals),
        skip_if_running: row.try_get("skip_if_running").map_err(get)?,
        is_enabled: row.try_get("is_enabled").map_err(get)?,
        timeout: timeout_ms.map(|ms| Duration::from_millis(u64::try_from(ms).unwrap_or(0))),
        misfire_strategy: misfire.parse().map_err(|e| JobStoreError::storage(format!("{e}")))?,
        date_created: row.try_get("date_created").map_err(get)?,
        date_updated: row.try_get("date_updated").map_err(get)?,
        status: status.parse().map_err(|e| JobStoreError::storage(format!("{e}")))?,
        lock_holder: row.try_get("lock_holder").map_err(get)?,
        locked_at: row.try_get("locked_at").map_err(get)?,
    })
}

fn decode_execution(row: &PgRow) -> Result<JobExecution, JobStoreError> {
    let get = |e: sqlx::Error| map_sqlx_error("decode_execution", e);

    let status: String = row.try_get("status").map_err(get)?;
    let attempt: i32 = row.try_get("attempt").map_err(get)?;
    let duration_ms: Option<i64> = row.try_get("duration_ms").map_err(get)?;

    Ok(JobExecution {
        id: ExecutionId::from_uuid(row.try_get::<Uuid, _>("id").map_err(get)?),
        job_id: JobId::from_uuid(row.try_get::<Uuid, _>("job_id").map_err(get)?),
        attempt: u32::try_from(attempt).unwrap_or(0),
        scheduled_time: row.try_get("scheduled_time").map_err(get)?,
        started_at: row.try_get("started_at").map_err(get)?,
        completed_at: row.try_get("completed_at").map_err(get)?,
        status: status.parse().map_err(|e| JobStoreError::storage(format!("{e}")))?,
        error: row.try_get("error").map_err(get)?,
        duration_ms: duration_ms.map(|ms| u64::try_from(ms).unwrap_or(0)),
        lock_holder: row.try_get("lock_holder").map_err(get)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            JobStoreError::Storage(format!(
                "database error in {operation} ({code}): {}",
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::RowNotFound => JobStoreError::NotFound(format!("row not found in {operation}")),
        other => JobStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_lists_match_schema_order() {
        assert!(JOB_COLUMNS.starts_with("id, name"));
        assert_eq!(JOB_COLUMNS.split(", ").count(), 18);
        assert_eq!(EXECUTION_COLUMNS.split(", ").count(), 10);
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = map_sqlx_error("get_job", sqlx::Error::RowNotFound);
        assert!(matches!(err, JobStoreError::NotFound(_)));
    }

    #[test]
    fn durations_are_stored_in_millis() {
        assert_eq!(duration_ms(Duration::from_secs(2)), 2000);
    }
}
