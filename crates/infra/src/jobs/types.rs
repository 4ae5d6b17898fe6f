//! Scheduled job definitions, runtime state and execution history.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use courier_core::{CoreError, ExecutionId, JobId, time};

/// Claim state of a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its next run time.
    Pending,
    /// Claimed by a scheduler instance.
    Running,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
        }
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            other => Err(CoreError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// What to do with a job claimed well after its run time.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfireStrategy {
    /// Run once now, then continue with the next occurrence.
    #[default]
    FireNow,
    /// Record a skipped execution and move on to the next occurrence.
    Skip,
    /// Move on to the next occurrence without recording anything.
    Reschedule,
}

impl MisfireStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MisfireStrategy::FireNow => "fire_now",
            MisfireStrategy::Skip => "skip",
            MisfireStrategy::Reschedule => "reschedule",
        }
    }
}

impl FromStr for MisfireStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fire_now" => Ok(MisfireStrategy::FireNow),
            "skip" => Ok(MisfireStrategy::Skip),
            "reschedule" => Ok(MisfireStrategy::Reschedule),
            other => Err(CoreError::validation(format!("unknown misfire strategy: {other}"))),
        }
    }
}

/// Delays between run attempts. `n` intervals allow `n + 1` attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RetryIntervals(Vec<Duration>);

impl RetryIntervals {
    pub fn new(intervals: Vec<Duration>) -> Self {
        Self(intervals)
    }

    /// A single attempt.
    pub fn none() -> Self {
        Self(Vec::new())
    }

    /// `retries` intervals doubling from `base`, capped at `max`.
    pub fn exponential(retries: u32, base: Duration, max: Duration) -> Self {
        let intervals = (0..retries)
            .map(|i| base.saturating_mul(2u32.saturating_pow(i)).min(max))
            .collect();
        Self(intervals)
    }

    pub fn max_attempts(&self) -> u32 {
        u32::try_from(self.0.len()).unwrap_or(u32::MAX).saturating_add(1)
    }

    /// Delay before the attempt following `attempt` (1-based), if one is allowed.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        let index = usize::try_from(attempt.checked_sub(1)?).ok()?;
        self.0.get(index).copied()
    }

    pub fn as_slice(&self) -> &[Duration] {
        &self.0
    }

    pub(crate) fn to_millis(&self) -> Vec<i64> {
        self.0
            .iter()
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .collect()
    }

    pub(crate) fn from_millis(millis: &[i64]) -> Self {
        Self(
            millis
                .iter()
                .map(|ms| Duration::from_millis(u64::try_from(*ms).unwrap_or(0)))
                .collect(),
        )
    }
}

/// A cron job: definition fields owned by whoever registers it, runtime
/// fields owned by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: JobId,
    /// Unique; the upsert key.
    pub name: String,
    pub job_type: String,
    pub consumer_type_name: String,
    pub cron_expression: String,
    pub time_zone: String,
    pub payload: JsonValue,
    pub next_run_time: DateTime<Utc>,
    pub retry_intervals: RetryIntervals,
    pub skip_if_running: bool,
    pub is_enabled: bool,
    pub timeout: Option<Duration>,
    pub misfire_strategy: MisfireStrategy,
    pub date_created: DateTime<Utc>,
    pub date_updated: DateTime<Utc>,

    pub status: JobStatus,
    pub lock_holder: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
}

impl ScheduledJob {
    pub fn new(
        name: impl Into<String>,
        job_type: impl Into<String>,
        cron_expression: impl Into<String>,
        next_run_time: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        let job_type = job_type.into();
        Self {
            id: JobId::new(),
            name: name.into(),
            consumer_type_name: job_type.clone(),
            job_type,
            cron_expression: cron_expression.into(),
            time_zone: "UTC".to_string(),
            payload: JsonValue::Null,
            next_run_time,
            retry_intervals: RetryIntervals::none(),
            skip_if_running: true,
            is_enabled: true,
            timeout: None,
            misfire_strategy: MisfireStrategy::default(),
            date_created: now,
            date_updated: now,
            status: JobStatus::Pending,
            lock_holder: None,
            locked_at: None,
        }
    }

    pub fn with_consumer_type(mut self, consumer_type_name: impl Into<String>) -> Self {
        self.consumer_type_name = consumer_type_name.into();
        self
    }

    pub fn with_time_zone(mut self, time_zone: impl Into<String>) -> Self {
        self.time_zone = time_zone.into();
        self
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_retry_intervals(mut self, retry_intervals: RetryIntervals) -> Self {
        self.retry_intervals = retry_intervals;
        self
    }

    pub fn with_skip_if_running(mut self, skip_if_running: bool) -> Self {
        self.skip_if_running = skip_if_running;
        self
    }

    pub fn with_enabled(mut self, is_enabled: bool) -> Self {
        self.is_enabled = is_enabled;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_misfire_strategy(mut self, misfire_strategy: MisfireStrategy) -> Self {
        self.misfire_strategy = misfire_strategy;
        self
    }

    /// Whether a claim at `now` would pick this job up.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_enabled && self.status == JobStatus::Pending && self.next_run_time <= now
    }

    /// Copy the definition fields of `other` onto `self`, leaving id, creation
    /// time and runtime state alone.
    pub(crate) fn apply_definition(&mut self, other: &ScheduledJob, now: DateTime<Utc>) {
        self.job_type = other.job_type.clone();
        self.consumer_type_name = other.consumer_type_name.clone();
        self.cron_expression = other.cron_expression.clone();
        self.time_zone = other.time_zone.clone();
        self.payload = other.payload.clone();
        self.next_run_time = other.next_run_time;
        self.retry_intervals = other.retry_intervals.clone();
        self.skip_if_running = other.skip_if_running;
        self.is_enabled = other.is_enabled;
        self.timeout = other.timeout;
        self.misfire_strategy = other.misfire_strategy;
        self.date_updated = now;
    }
}

/// Outcome of one run attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Skipped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::TimedOut => "timed_out",
            ExecutionStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl FromStr for ExecutionStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "succeeded" => Ok(ExecutionStatus::Succeeded),
            "failed" => Ok(ExecutionStatus::Failed),
            "timed_out" => Ok(ExecutionStatus::TimedOut),
            "skipped" => Ok(ExecutionStatus::Skipped),
            other => Err(CoreError::validation(format!("unknown execution status: {other}"))),
        }
    }
}

/// History row for a single attempt of a job run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: ExecutionId,
    pub job_id: JobId,
    /// 1-based.
    pub attempt: u32,
    pub scheduled_time: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
    pub lock_holder: String,
}

impl JobExecution {
    /// A `Running` row for `attempt` of the claimed `job`.
    pub fn start(job: &ScheduledJob, attempt: u32, lock_holder: impl Into<String>) -> Self {
        Self {
            id: ExecutionId::new(),
            job_id: job.id,
            attempt,
            scheduled_time: job.next_run_time,
            started_at: Utc::now(),
            completed_at: None,
            status: ExecutionStatus::Running,
            error: None,
            duration_ms: None,
            lock_holder: lock_holder.into(),
        }
    }

    /// Stamp completion time, duration and outcome.
    pub fn finish(&mut self, status: ExecutionStatus, error: Option<String>) {
        let now = Utc::now();
        self.completed_at = Some(now);
        self.duration_ms = Some(time::elapsed_ms(self.started_at, now));
        self.status = status;
        self.error = error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_intervals_double_and_cap() {
        let intervals =
            RetryIntervals::exponential(4, Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(
            intervals.as_slice(),
            &[
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(5),
            ]
        );
        assert_eq!(intervals.max_attempts(), 5);
    }

    #[test]
    fn delay_after_last_attempt_is_none() {
        let intervals = RetryIntervals::new(vec![Duration::from_millis(10)]);
        assert_eq!(intervals.delay_after(1), Some(Duration::from_millis(10)));
        assert_eq!(intervals.delay_after(2), None);
        assert_eq!(intervals.delay_after(0), None);
    }

    #[test]
    fn millis_conversion_keeps_intervals() {
        let intervals = RetryIntervals::new(vec![Duration::from_millis(1500), Duration::ZERO]);
        assert_eq!(RetryIntervals::from_millis(&intervals.to_millis()), intervals);
    }

    #[test]
    fn disabled_or_claimed_jobs_are_not_due() {
        let now = Utc::now();
        let job = ScheduledJob::new("nightly", "report", "@every 60s", now);
        assert!(job.is_due(now));

        let disabled = job.clone().with_enabled(false);
        assert!(!disabled.is_due(now));

        let mut claimed = job.clone();
        claimed.status = JobStatus::Running;
        assert!(!claimed.is_due(now));
    }

    #[test]
    fn finish_records_duration() {
        let job = ScheduledJob::new("nightly", "report", "@every 60s", Utc::now());
        let mut execution = JobExecution::start(&job, 1, "node-a");
        execution.finish(ExecutionStatus::Failed, Some("boom".into()));

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.completed_at.is_some());
        assert!(execution.duration_ms.is_some());
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            ExecutionStatus::Running,
            ExecutionStatus::Succeeded,
            ExecutionStatus::Failed,
            ExecutionStatus::TimedOut,
            ExecutionStatus::Skipped,
        ] {
            assert_eq!(status.as_str().parse::<ExecutionStatus>().unwrap(), status);
        }
        assert_eq!("skip".parse::<MisfireStrategy>().unwrap(), MisfireStrategy::Skip);
    }
}
