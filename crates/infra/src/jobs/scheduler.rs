//! Cron job scheduler: claim due jobs, apply the misfire policy, run attempts
//! with backoff and timeout, then hand the job back with its next run time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use courier_core::time;

use super::store::{JobStore, JobStoreError};
use super::types::{ExecutionStatus, JobExecution, MisfireStrategy, ScheduledJob};
use crate::config::CourierOptions;

/// Next run time used when a cron expression cannot be evaluated.
const CRON_ERROR_BACKOFF: Duration = Duration::from_secs(60);

/// Computes cron occurrences. Expression parsing lives outside this crate.
pub trait CronEvaluator: Send + Sync {
    /// First occurrence strictly after `after`.
    fn next_occurrence(
        &self,
        expression: &str,
        time_zone: &str,
        after: DateTime<Utc>,
    ) -> anyhow::Result<DateTime<Utc>>;
}

impl<C> CronEvaluator for Arc<C>
where
    C: CronEvaluator + ?Sized,
{
    fn next_occurrence(
        &self,
        expression: &str,
        time_zone: &str,
        after: DateTime<Utc>,
    ) -> anyhow::Result<DateTime<Utc>> {
        (**self).next_occurrence(expression, time_zone, after)
    }
}

/// Evaluator for `@every <n><s|m|h|d>` expressions. Time zones do not affect
/// fixed intervals.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedIntervalCron;

impl FixedIntervalCron {
    pub fn parse(expression: &str) -> anyhow::Result<Duration> {
        let spec = expression
            .trim()
            .strip_prefix("@every ")
            .ok_or_else(|| anyhow::anyhow!("unsupported expression '{expression}'"))?
            .trim();
        let split = spec
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| anyhow::anyhow!("missing unit in '{expression}'"))?;
        let (amount, unit) = spec.split_at(split);
        let amount: u64 = amount.parse()?;
        let secs = match unit {
            "s" => amount,
            "m" => amount.saturating_mul(60),
            "h" => amount.saturating_mul(3600),
            "d" => amount.saturating_mul(86_400),
            other => anyhow::bail!("unknown unit '{other}' in '{expression}'"),
        };
        if secs == 0 {
            anyhow::bail!("interval must be positive in '{expression}'");
        }
        Ok(Duration::from_secs(secs))
    }
}

impl CronEvaluator for FixedIntervalCron {
    fn next_occurrence(
        &self,
        expression: &str,
        _time_zone: &str,
        after: DateTime<Utc>,
    ) -> anyhow::Result<DateTime<Utc>> {
        Ok(time::after(after, Self::parse(expression)?))
    }
}

/// Executes a job's payload.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: &ScheduledJob, cancel: &CancellationToken) -> anyhow::Result<()>;
}

#[async_trait]
impl<R> JobRunner for Arc<R>
where
    R: JobRunner + ?Sized,
{
    async fn run(&self, job: &ScheduledJob, cancel: &CancellationToken) -> anyhow::Result<()> {
        (**self).run(job, cancel).await
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error("scheduler cancelled")]
    Cancelled,
}

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub batch_size: usize,
    pub misfire_threshold: Duration,
    pub stale_job_threshold: Duration,
    /// Name written to `lock_holder` on claimed jobs.
    pub lock_holder: String,
}

impl SchedulerConfig {
    pub fn from_options(options: &CourierOptions) -> Self {
        Self {
            batch_size: options.scheduler_batch_size,
            misfire_threshold: options.misfire_threshold,
            stale_job_threshold: options.stale_job_threshold,
            lock_holder: options.instance_id.clone(),
        }
    }
}

/// What happened to one claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded { attempts: u32 },
    Failed { attempts: u32 },
    /// Misfired with [`MisfireStrategy::Skip`].
    Skipped,
    /// Misfired with [`MisfireStrategy::Reschedule`].
    Rescheduled,
}

/// Counters for one scheduler tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub rescheduled: usize,
    pub errors: usize,
}

impl TickReport {
    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Succeeded { .. } => self.succeeded += 1,
            JobOutcome::Failed { .. } => self.failed += 1,
            JobOutcome::Skipped => self.skipped += 1,
            JobOutcome::Rescheduled => self.rescheduled += 1,
        }
    }
}

/// Polls a [`JobStore`] for due jobs and runs them through a [`JobRunner`].
pub struct JobScheduler<S: JobStore> {
    store: S,
    cron: Arc<dyn CronEvaluator>,
    runner: Arc<dyn JobRunner>,
    config: SchedulerConfig,
}

impl<S: JobStore> JobScheduler<S> {
    pub fn new(
        store: S,
        cron: Arc<dyn CronEvaluator>,
        runner: Arc<dyn JobRunner>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            cron,
            runner,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Claim one batch of due jobs and process them concurrently.
    ///
    /// Runner failures are recorded on execution rows; per-job storage errors
    /// are logged and counted. Only a failed claim is returned as an error.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<TickReport, SchedulerError> {
        let jobs = self
            .store
            .acquire_due_jobs(self.config.batch_size, &self.config.lock_holder, cancel)
            .await?;

        let mut report = TickReport {
            claimed: jobs.len(),
            ..TickReport::default()
        };
        if jobs.is_empty() {
            return Ok(report);
        }
        debug!(claimed = jobs.len(), holder = %self.config.lock_holder, "claimed due jobs");

        let results = join_all(jobs.iter().map(|job| self.process(job, cancel))).await;
        for (job, result) in jobs.iter().zip(results) {
            match result {
                Ok(outcome) => report.record(outcome),
                Err(err) => {
                    report.errors += 1;
                    error!(job = %job.name, error = %err, "job processing failed");
                }
            }
        }
        Ok(report)
    }

    /// Return claims held past the stale threshold to `Pending`.
    pub async fn release_stale(&self, cancel: &CancellationToken) -> Result<usize, SchedulerError> {
        let released = self
            .store
            .release_stale_jobs(self.config.stale_job_threshold, cancel)
            .await?;
        if released > 0 {
            warn!(released, "released stale job claims");
        }
        Ok(released)
    }

    async fn process(
        &self,
        job: &ScheduledJob,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, SchedulerError> {
        let now = Utc::now();
        let next = self.next_run_time(job, now);
        let misfired = job.next_run_time < time::before(now, self.config.misfire_threshold);

        if misfired {
            match job.misfire_strategy {
                MisfireStrategy::Skip => {
                    info!(job = %job.name, due = %job.next_run_time, "misfired, skipping run");
                    let mut execution = JobExecution::start(job, 1, &self.config.lock_holder);
                    execution.finish(ExecutionStatus::Skipped, Some("misfired".to_string()));
                    self.store.create_execution(&execution, cancel).await?;
                    self.release(job, next, cancel).await?;
                    return Ok(JobOutcome::Skipped);
                }
                MisfireStrategy::Reschedule => {
                    info!(job = %job.name, due = %job.next_run_time, next = %next, "misfired, rescheduling");
                    self.release(job, next, cancel).await?;
                    return Ok(JobOutcome::Rescheduled);
                }
                MisfireStrategy::FireNow => {
                    debug!(job = %job.name, due = %job.next_run_time, "misfired, firing now");
                }
            }
        }

        // Overlapping runs are allowed, so free the claim up front.
        if !job.skip_if_running {
            self.release(job, next, cancel).await?;
        }

        let outcome = self.run_attempts(job, cancel).await?;

        if job.skip_if_running {
            self.release(job, next, cancel).await?;
        }
        Ok(outcome)
    }

    async fn run_attempts(
        &self,
        job: &ScheduledJob,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, SchedulerError> {
        let mut attempt = 1;
        loop {
            let mut execution = JobExecution::start(job, attempt, &self.config.lock_holder);
            self.store.create_execution(&execution, cancel).await?;

            let result = match job.timeout {
                Some(limit) => match tokio::time::timeout(limit, self.runner.run(job, cancel)).await {
                    Ok(result) => result.map_err(|e| (ExecutionStatus::Failed, format!("{e:#}"))),
                    Err(_) => Err((
                        ExecutionStatus::TimedOut,
                        format!("timed out after {}ms", limit.as_millis()),
                    )),
                },
                None => self
                    .runner
                    .run(job, cancel)
                    .await
                    .map_err(|e| (ExecutionStatus::Failed, format!("{e:#}"))),
            };

            match result {
                Ok(()) => {
                    execution.finish(ExecutionStatus::Succeeded, None);
                    self.store.update_execution(&execution, cancel).await?;
                    info!(job = %job.name, attempt, "job run succeeded");
                    return Ok(JobOutcome::Succeeded { attempts: attempt });
                }
                Err((status, message)) => {
                    warn!(job = %job.name, attempt, status = status.as_str(), error = %message, "job run failed");
                    execution.finish(status, Some(message));
                    self.store.update_execution(&execution, cancel).await?;

                    let Some(delay) = job.retry_intervals.delay_after(attempt) else {
                        return Ok(JobOutcome::Failed { attempts: attempt });
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(SchedulerError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn release(
        &self,
        job: &ScheduledJob,
        next: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<(), SchedulerError> {
        let released = self
            .store
            .complete_run(job.id, &self.config.lock_holder, next, cancel)
            .await?;
        if !released {
            warn!(job = %job.name, holder = %self.config.lock_holder, "job claim was lost before release");
        }
        Ok(())
    }

    fn next_run_time(&self, job: &ScheduledJob, now: DateTime<Utc>) -> DateTime<Utc> {
        match self
            .cron
            .next_occurrence(&job.cron_expression, &job.time_zone, now)
        {
            Ok(next) => next,
            Err(err) => {
                error!(job = %job.name, expression = %job.cron_expression, error = %err, "cron evaluation failed");
                time::after(now, CRON_ERROR_BACKOFF)
            }
        }
    }
}
