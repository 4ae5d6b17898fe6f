//! Poll loop around [`JobScheduler`], with the stale-claim sweep folded in.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::jobs::{JobScheduler, JobStore, TickReport};

use super::{PeriodicTask, WorkerError};

pub struct SchedulerWorker<S: JobStore> {
    scheduler: JobScheduler<S>,
    last_stale_sweep: Mutex<Option<Instant>>,
}

impl<S: JobStore + 'static> SchedulerWorker<S> {
    pub fn new(scheduler: JobScheduler<S>) -> Self {
        Self {
            scheduler,
            last_stale_sweep: Mutex::new(None),
        }
    }

    pub fn scheduler(&self) -> &JobScheduler<S> {
        &self.scheduler
    }

    /// Release stale claims at most once per stale threshold, then tick.
    pub async fn poll(&self, cancel: &CancellationToken) -> Result<TickReport, WorkerError> {
        if self.stale_sweep_due() {
            self.scheduler.release_stale(cancel).await?;
        }
        Ok(self.scheduler.tick(cancel).await?)
    }

    fn stale_sweep_due(&self) -> bool {
        let threshold = self.scheduler.config().stale_job_threshold;
        let now = Instant::now();
        let Ok(mut last) = self.last_stale_sweep.lock() else {
            return true;
        };
        match *last {
            Some(at) if now.duration_since(at) < threshold => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

#[async_trait]
impl<S: JobStore + 'static> PeriodicTask for SchedulerWorker<S> {
    fn name(&self) -> &'static str {
        "job-scheduler"
    }

    async fn run_once(&self, cancel: &CancellationToken) -> Result<(), WorkerError> {
        let report = self.poll(cancel).await?;
        if report.claimed > 0 {
            debug!(
                claimed = report.claimed,
                succeeded = report.succeeded,
                failed = report.failed,
                skipped = report.skipped,
                rescheduled = report.rescheduled,
                errors = report.errors,
                "scheduler tick finished"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{FixedIntervalCron, InMemoryJobStore, JobRunner, JobStatus, ScheduledJob, SchedulerConfig};
    use chrono::Utc;
    use courier_core::time;
    use std::sync::Arc;
    use std::time::Duration;

    struct Noop;

    #[async_trait]
    impl JobRunner for Noop {
        async fn run(&self, _job: &ScheduledJob, _cancel: &CancellationToken) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn poll_reclaims_stale_jobs_before_ticking() {
        let store = InMemoryJobStore::arc();
        let cancel = CancellationToken::new();
        let job = store
            .upsert_job(
                ScheduledJob::new("a", "report", "@every 60s", time::before(Utc::now(), Duration::from_secs(1))),
                &cancel,
            )
            .await
            .unwrap();
        // Claimed by an instance that died ten minutes ago.
        store.acquire_due_jobs(1, "dead-node", &cancel).await.unwrap();
        store.lock_at(job.id, time::before(Utc::now(), Duration::from_secs(600)));

        let config = SchedulerConfig {
            batch_size: 10,
            misfire_threshold: Duration::from_secs(60),
            stale_job_threshold: Duration::from_secs(300),
            lock_holder: "node-a".to_string(),
        };
        let worker = SchedulerWorker::new(JobScheduler::new(
            store.clone(),
            Arc::new(FixedIntervalCron),
            Arc::new(Noop),
            config,
        ));

        let report = worker.poll(&cancel).await.unwrap();
        assert_eq!(report.succeeded, 1);

        let job = store.get_job("a", &cancel).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.next_run_time > Utc::now());
    }
}
