//! Job storage boundary and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use courier_core::{ExecutionId, JobId, time};

use super::types::{JobExecution, JobStatus, ScheduledJob};

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("execution not found: {0}")]
    ExecutionNotFound(ExecutionId),
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

pub(crate) fn ensure_active(cancel: &CancellationToken) -> Result<(), JobStoreError> {
    if cancel.is_cancelled() {
        return Err(JobStoreError::Cancelled);
    }
    Ok(())
}

/// Persistence for cron jobs and their execution history.
///
/// Definition fields are written by [`JobStore::upsert_job`]; runtime fields
/// (`status`, `lock_holder`, `locked_at`) only by the claim/release operations.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert by name, or overwrite the definition of the existing job.
    async fn upsert_job(
        &self,
        job: ScheduledJob,
        cancel: &CancellationToken,
    ) -> Result<ScheduledJob, JobStoreError>;

    async fn get_job(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<ScheduledJob>, JobStoreError>;

    /// All jobs ordered by name.
    async fn list_jobs(&self, cancel: &CancellationToken)
    -> Result<Vec<ScheduledJob>, JobStoreError>;

    /// Delete a job and its executions. Returns whether it existed.
    async fn delete_job(&self, name: &str, cancel: &CancellationToken)
    -> Result<bool, JobStoreError>;

    /// Claim up to `batch_size` due jobs for `lock_holder`.
    ///
    /// A job is handed to at most one caller until it is released.
    async fn acquire_due_jobs(
        &self,
        batch_size: usize,
        lock_holder: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ScheduledJob>, JobStoreError>;

    /// Release a claim held by `lock_holder` and set the next run time.
    /// Returns `false` if the claim is no longer ours.
    async fn complete_run(
        &self,
        job_id: JobId,
        lock_holder: &str,
        next_run_time: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<bool, JobStoreError>;

    /// Put jobs claimed longer than `staleness` ago back to `Pending`.
    async fn release_stale_jobs(
        &self,
        staleness: Duration,
        cancel: &CancellationToken,
    ) -> Result<usize, JobStoreError>;

    async fn create_execution(
        &self,
        execution: &JobExecution,
        cancel: &CancellationToken,
    ) -> Result<(), JobStoreError>;

    async fn update_execution(
        &self,
        execution: &JobExecution,
        cancel: &CancellationToken,
    ) -> Result<(), JobStoreError>;

    /// Most recent first.
    async fn get_executions(
        &self,
        job_id: JobId,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<JobExecution>, JobStoreError>;

    /// Delete executions completed more than `retention` ago.
    async fn purge_executions(
        &self,
        retention: Duration,
        cancel: &CancellationToken,
    ) -> Result<usize, JobStoreError>;
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn upsert_job(
        &self,
        job: ScheduledJob,
        cancel: &CancellationToken,
    ) -> Result<ScheduledJob, JobStoreError> {
        (**self).upsert_job(job, cancel).await
    }

    async fn get_job(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<ScheduledJob>, JobStoreError> {
        (**self).get_job(name, cancel).await
    }

    async fn list_jobs(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<ScheduledJob>, JobStoreError> {
        (**self).list_jobs(cancel).await
    }

    async fn delete_job(&self, name: &str, cancel: &CancellationToken) -> Result<bool, JobStoreError> {
        (**self).delete_job(name, cancel).await
    }

    async fn acquire_due_jobs(
        &self,
        batch_size: usize,
        lock_holder: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ScheduledJob>, JobStoreError> {
        (**self).acquire_due_jobs(batch_size, lock_holder, cancel).await
    }

    async fn complete_run(
        &self,
        job_id: JobId,
        lock_holder: &str,
        next_run_time: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<bool, JobStoreError> {
        (**self)
            .complete_run(job_id, lock_holder, next_run_time, cancel)
            .await
    }

    async fn release_stale_jobs(
        &self,
        staleness: Duration,
        cancel: &CancellationToken,
    ) -> Result<usize, JobStoreError> {
        (**self).release_stale_jobs(staleness, cancel).await
    }

    async fn create_execution(
        &self,
        execution: &JobExecution,
        cancel: &CancellationToken,
    ) -> Result<(), JobStoreError> {
        (**self).create_execution(execution, cancel).await
    }

    async fn update_execution(
        &self,
        execution: &JobExecution,
        cancel: &CancellationToken,
    ) -> Result<(), JobStoreError> {
        (**self).update_execution(execution, cancel).await
    }

    async fn get_executions(
        &self,
        job_id: JobId,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<JobExecution>, JobStoreError> {
        (**self).get_executions(job_id, limit, cancel).await
    }

    async fn purge_executions(
        &self,
        retention: Duration,
        cancel: &CancellationToken,
    ) -> Result<usize, JobStoreError> {
        (**self).purge_executions(retention, cancel).await
    }
}

/// In-memory job store for tests/dev.
///
/// Claims go through a single mutex so that concurrent schedulers sharing
/// the store never receive the same job.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, ScheduledJob>>,
    executions: RwLock<HashMap<ExecutionId, JobExecution>>,
    claim: Mutex<()>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn jobs_mut(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, ScheduledJob>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::storage("job table lock poisoned"))
    }

    fn executions_mut(
        &self,
    ) -> Result<RwLockWriteGuard<'_, HashMap<ExecutionId, JobExecution>>, JobStoreError> {
        self.executions
            .write()
            .map_err(|_| JobStoreError::storage("execution table lock poisoned"))
    }

    #[cfg(test)]
    pub(crate) fn lock_at(&self, job_id: JobId, locked_at: DateTime<Utc>) {
        if let Some(job) = self.jobs.write().unwrap().get_mut(&job_id) {
            job.locked_at = Some(locked_at);
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn upsert_job(
        &self,
        job: ScheduledJob,
        cancel: &CancellationToken,
    ) -> Result<ScheduledJob, JobStoreError> {
        ensure_active(cancel)?;
        let now = Utc::now();
        let mut jobs = self.jobs_mut()?;

        if let Some(existing) = jobs.values_mut().find(|j| j.name == job.name) {
            existing.apply_definition(&job, now);
            return Ok(existing.clone());
        }

        let mut job = job;
        job.status = JobStatus::Pending;
        job.lock_holder = None;
        job.locked_at = None;
        job.date_created = now;
        job.date_updated = now;
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<ScheduledJob>, JobStoreError> {
        ensure_active(cancel)?;
        let jobs = self
            .jobs
            .read()
            .map_err(|_| JobStoreError::storage("job table lock poisoned"))?;
        Ok(jobs.values().find(|j| j.name == name).cloned())
    }

    async fn list_jobs(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<ScheduledJob>, JobStoreError> {
        ensure_active(cancel)?;
        let mut jobs: Vec<ScheduledJob> = self
            .jobs
            .read()
            .map_err(|_| JobStoreError::storage("job table lock poisoned"))?
            .values()
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(jobs)
    }

    async fn delete_job(&self, name: &str, cancel: &CancellationToken) -> Result<bool, JobStoreError> {
        ensure_active(cancel)?;
        let removed = {
            let mut jobs = self.jobs_mut()?;
            let id = jobs.values().find(|j| j.name == name).map(|j| j.id);
            id.and_then(|id| jobs.remove(&id))
        };

        match removed {
            Some(job) => {
                self.executions_mut()?.retain(|_, e| e.job_id != job.id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn acquire_due_jobs(
        &self,
        batch_size: usize,
        lock_holder: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ScheduledJob>, JobStoreError> {
        ensure_active(cancel)?;
        let _claim = self
            .claim
            .lock()
            .map_err(|_| JobStoreError::storage("claim lock poisoned"))?;
        let now = Utc::now();
        let mut jobs = self.jobs_mut()?;

        let mut due: Vec<&mut ScheduledJob> = jobs.values_mut().filter(|j| j.is_due(now)).collect();
        due.sort_by(|a, b| a.next_run_time.cmp(&b.next_run_time));

        Ok(due
            .into_iter()
            .take(batch_size)
            .map(|job| {
                job.status = JobStatus::Running;
                job.lock_holder = Some(lock_holder.to_string());
                job.locked_at = Some(now);
                job.clone()
            })
            .collect())
    }

    async fn complete_run(
        &self,
        job_id: JobId,
        lock_holder: &str,
        next_run_time: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<bool, JobStoreError> {
        ensure_active(cancel)?;
        let mut jobs = self.jobs_mut()?;

        match jobs.get_mut(&job_id) {
            Some(job)
                if job.status == JobStatus::Running
                    && job.lock_holder.as_deref() == Some(lock_holder) =>
            {
                job.status = JobStatus::Pending;
                job.lock_holder = None;
                job.locked_at = None;
                job.next_run_time = next_run_time;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(JobStoreError::NotFound(job_id.to_string())),
        }
    }

    async fn release_stale_jobs(
        &self,
        staleness: Duration,
        cancel: &CancellationToken,
    ) -> Result<usize, JobStoreError> {
        ensure_active(cancel)?;
        let cutoff = time::before(Utc::now(), staleness);
        let mut jobs = self.jobs_mut()?;

        let mut released = 0;
        for job in jobs.values_mut() {
            let stale = job.status == JobStatus::Running
                && job.locked_at.is_some_and(|at| at < cutoff);
            if stale {
                job.status = JobStatus::Pending;
                job.lock_holder = None;
                job.locked_at = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn create_execution(
        &self,
        execution: &JobExecution,
        cancel: &CancellationToken,
    ) -> Result<(), JobStoreError> {
        ensure_active(cancel)?;
        self.executions_mut()?.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn update_execution(
        &self,
        execution: &JobExecution,
        cancel: &CancellationToken,
    ) -> Result<(), JobStoreError> {
        ensure_active(cancel)?;
        let mut executions = self.executions_mut()?;
        match executions.get_mut(&execution.id) {
            Some(row) => {
                *row = execution.clone();
                Ok(())
            }
            None => Err(JobStoreError::ExecutionNotFound(execution.id)),
        }
    }

    async fn get_executions(
        &self,
        job_id: JobId,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<JobExecution>, JobStoreError> {
        ensure_active(cancel)?;
        let mut rows: Vec<JobExecution> = self
            .executions
            .read()
            .map_err(|_| JobStoreError::storage("execution table lock poisoned"))?
            .values()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| b.id.cmp(&a.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn purge_executions(
        &self,
        retention: Duration,
        cancel: &CancellationToken,
    ) -> Result<usize, JobStoreError> {
        ensure_active(cancel)?;
        let cutoff = time::before(Utc::now(), retention);
        let mut executions = self.executions_mut()?;

        let before = executions.len();
        executions.retain(|_, e| e.completed_at.is_none_or(|at| at >= cutoff));
        Ok(before - executions.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{ExecutionStatus, MisfireStrategy};
    use std::collections::HashSet;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    fn due_job(name: &str) -> ScheduledJob {
        ScheduledJob::new(name, "report", "@every 60s", time::before(Utc::now(), Duration::from_secs(1)))
    }

    #[tokio::test]
    async fn concurrent_claims_never_share_a_job() {
        let store = InMemoryJobStore::arc();
        for i in 0..50 {
            store.upsert_job(due_job(&format!("job-{i}")), &cancel()).await.unwrap();
        }

        let mut tasks = Vec::new();
        for worker in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let holder = format!("worker-{worker}");
                let mut claimed = Vec::new();
                loop {
                    let batch = store.acquire_due_jobs(3, &holder, &cancel()).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    claimed.extend(batch.into_iter().map(|j| j.id));
                }
                claimed
            }));
        }

        let mut seen = HashSet::new();
        for task in tasks {
            for id in task.await.unwrap() {
                assert!(seen.insert(id), "job {id} claimed twice");
            }
        }
        assert_eq!(seen.len(), 50);
    }

    #[tokio::test]
    async fn claim_sets_runtime_fields() {
        let store = InMemoryJobStore::new();
        store.upsert_job(due_job("a"), &cancel()).await.unwrap();

        let claimed = store.acquire_due_jobs(10, "node-a", &cancel()).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, JobStatus::Running);
        assert_eq!(claimed[0].lock_holder.as_deref(), Some("node-a"));
        assert!(claimed[0].locked_at.is_some());

        assert!(store.acquire_due_jobs(10, "node-b", &cancel()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upsert_never_touches_runtime_state() {
        let store = InMemoryJobStore::new();
        let original = store.upsert_job(due_job("a"), &cancel()).await.unwrap();
        store.acquire_due_jobs(1, "node-a", &cancel()).await.unwrap();

        let mut redefined = due_job("a")
            .with_misfire_strategy(MisfireStrategy::Skip)
            .with_payload(serde_json::json!({"v": 2}));
        redefined.status = JobStatus::Pending;
        redefined.lock_holder = Some("intruder".into());
        let updated = store.upsert_job(redefined, &cancel()).await.unwrap();

        assert_eq!(updated.id, original.id);
        assert_eq!(updated.date_created, original.date_created);
        assert_eq!(updated.misfire_strategy, MisfireStrategy::Skip);
        assert_eq!(updated.payload, serde_json::json!({"v": 2}));
        assert_eq!(updated.status, JobStatus::Running);
        assert_eq!(updated.lock_holder.as_deref(), Some("node-a"));
        assert!(updated.locked_at.is_some());
    }

    #[tokio::test]
    async fn stale_claims_are_released_and_fresh_ones_kept() {
        let store = InMemoryJobStore::new();
        let staleness = Duration::from_secs(300);
        let stale = store.upsert_job(due_job("stale"), &cancel()).await.unwrap();
        let fresh = store.upsert_job(due_job("fresh"), &cancel()).await.unwrap();
        store.acquire_due_jobs(10, "node-a", &cancel()).await.unwrap();

        let now = Utc::now();
        store.lock_at(stale.id, time::before(now, staleness * 2));
        store.lock_at(fresh.id, time::before(now, staleness / 2));

        assert_eq!(store.release_stale_jobs(staleness, &cancel()).await.unwrap(), 1);

        let stale = store.get_job("stale", &cancel()).await.unwrap().unwrap();
        assert_eq!(stale.status, JobStatus::Pending);
        assert_eq!(stale.lock_holder, None);
        assert_eq!(stale.locked_at, None);

        let fresh = store.get_job("fresh", &cancel()).await.unwrap().unwrap();
        assert_eq!(fresh.status, JobStatus::Running);
        assert_eq!(fresh.lock_holder.as_deref(), Some("node-a"));
    }

    #[tokio::test]
    async fn complete_run_requires_the_holder() {
        let store = InMemoryJobStore::new();
        let job = store.upsert_job(due_job("a"), &cancel()).await.unwrap();
        store.acquire_due_jobs(1, "node-a", &cancel()).await.unwrap();
        let next = time::after(Utc::now(), Duration::from_secs(60));

        assert!(!store.complete_run(job.id, "node-b", next, &cancel()).await.unwrap());
        assert!(store.complete_run(job.id, "node-a", next, &cancel()).await.unwrap());

        let job = store.get_job("a", &cancel()).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.next_run_time, next);
    }

    #[tokio::test]
    async fn executions_are_listed_newest_first_and_purged_by_age() {
        let store = InMemoryJobStore::new();
        let job = store.upsert_job(due_job("a"), &cancel()).await.unwrap();

        let mut old = JobExecution::start(&job, 1, "node-a");
        old.started_at = time::before(Utc::now(), Duration::from_secs(3600));
        old.finish(ExecutionStatus::Failed, Some("boom".into()));
        old.completed_at = Some(time::before(Utc::now(), Duration::from_secs(3000)));
        store.create_execution(&old, &cancel()).await.unwrap();

        let mut recent = JobExecution::start(&job, 2, "node-a");
        store.create_execution(&recent, &cancel()).await.unwrap();
        recent.finish(ExecutionStatus::Succeeded, None);
        store.update_execution(&recent, &cancel()).await.unwrap();

        let in_flight = JobExecution::start(&job, 3, "node-a");
        store.create_execution(&in_flight, &cancel()).await.unwrap();

        let rows = store.get_executions(job.id, 2, &cancel()).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].started_at >= rows[1].started_at);

        let purged = store
            .purge_executions(Duration::from_secs(600), &cancel())
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.get_executions(job.id, 10, &cancel()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn deleting_a_job_drops_its_history() {
        let store = InMemoryJobStore::new();
        let job = store.upsert_job(due_job("a"), &cancel()).await.unwrap();
        store
            .create_execution(&JobExecution::start(&job, 1, "node-a"), &cancel())
            .await
            .unwrap();

        assert!(store.delete_job("a", &cancel()).await.unwrap());
        assert!(!store.delete_job("a", &cancel()).await.unwrap());
        assert!(store.get_executions(job.id, 10, &cancel()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_token_is_checked_first() {
        let store = InMemoryJobStore::new();
        let token = cancel();
        token.cancel();

        let err = store.acquire_due_jobs(1, "node-a", &token).await.unwrap_err();
        assert!(matches!(err, JobStoreError::Cancelled));
    }
}
