//! Cron-style job scheduling.
//!
//! Job definitions live in a [`JobStore`]. A scheduler tick claims due jobs
//! with a linearizable `acquire_due_jobs`, runs them through a [`JobRunner`],
//! records one [`JobExecution`] per attempt and hands each job back with its
//! next run time. Claims orphaned by a crashed instance are recovered by
//! `release_stale_jobs`.

pub mod postgres;
pub mod scheduler;
pub mod store;
pub mod types;

pub use postgres::PostgresJobStore;
pub use scheduler::{
    CronEvaluator, FixedIntervalCron, JobOutcome, JobRunner, JobScheduler, SchedulerConfig,
    SchedulerError, TickReport,
};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{
    ExecutionStatus, JobExecution, JobStatus, MisfireStrategy, RetryIntervals, ScheduledJob,
};
