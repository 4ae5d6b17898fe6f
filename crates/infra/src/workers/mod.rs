//! Background sweeps.
//!
//! Each worker is a [`PeriodicTask`] driven by [`spawn_periodic`]: one tokio
//! task polling at a fixed interval until the shared [`CancellationToken`]
//! fires. Iteration errors are logged and the loop carries on.

pub mod collector;
pub mod promoter;
pub mod reaper;
pub mod scheduler_worker;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CourierOptions;
use crate::jobs::{JobStoreError, SchedulerError};
use crate::lease::LeaseLock;
use crate::message_store::StoreError;

pub use collector::{CollectorReport, ExpiryCollector};
pub use promoter::DelayedPromoter;
pub use reaper::{ReaperReport, RetryReaper};
pub use scheduler_worker::SchedulerWorker;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Jobs(#[from] JobStoreError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Renewal failed mid-sweep; the remaining work was abandoned.
    #[error("lease '{0}' lost during sweep")]
    LeaseLost(String),
}

/// One iteration of a background sweep.
#[async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn run_once(&self, cancel: &CancellationToken) -> Result<(), WorkerError>;

    /// Wait for work the task spawned on its own. Called once the loop stops.
    async fn drain(&self) {}
}

/// Handle to the spawned worker loops.
#[derive(Debug)]
pub struct WorkerHandle {
    cancel: CancellationToken,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            joins: Vec::new(),
        }
    }

    pub fn push(&mut self, join: JoinHandle<()>) {
        self.joins.push(join);
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel every loop and wait for them to stop.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for join in self.joins {
            if let Err(err) = join.await {
                warn!(error = %err, "worker task ended abnormally");
            }
        }
    }
}

/// Spawn `task` on tokio, running it every `interval` until `cancel` fires.
pub fn spawn_periodic<T: PeriodicTask>(
    task: Arc<T>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = task.name();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(worker = name, interval_ms = interval.as_millis() as u64, "worker started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(err) = task.run_once(&cancel).await {
                if cancel.is_cancelled() {
                    break;
                }
                error!(worker = name, error = %err, "worker iteration failed");
            }
        }

        task.drain().await;
        info!(worker = name, "worker stopped");
    })
}

/// Run `f` under the lease `key` when storage locking is enabled.
///
/// The lease is renewed every half TTL while `f` runs. If a renewal is
/// refused or fails, `f` is dropped and the sweep ends with an error.
/// Returns `Ok(None)` when another instance holds the lease.
pub(crate) async fn with_lease<L, F, Fut, T>(
    lock: &L,
    options: &CourierOptions,
    key: &str,
    cancel: &CancellationToken,
    f: F,
) -> Result<Option<T>, WorkerError>
where
    L: LeaseLock + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, WorkerError>>,
{
    if !options.use_storage_lock {
        return f().await.map(Some);
    }

    let owner = options.instance_id.as_str();
    let ttl = options.lease_ttl;
    if !lock.acquire_lock(key, ttl, owner, cancel).await? {
        debug!(key, "lease held by another instance, skipping sweep");
        return Ok(None);
    }

    let period = (ttl / 2).max(Duration::from_millis(1));
    let mut renewals = tokio::time::interval_at(Instant::now() + period, period);
    renewals.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let work = f();
    tokio::pin!(work);
    let result = loop {
        tokio::select! {
            result = &mut work => break result,
            _ = renewals.tick() => match lock.renew_lock(key, ttl, owner, cancel).await {
                Ok(true) => debug!(key, "lease renewed"),
                Ok(false) => {
                    warn!(key, "lease lost, abandoning sweep");
                    break Err(WorkerError::LeaseLost(key.to_string()));
                }
                Err(err) => {
                    warn!(key, error = %err, "lease renewal failed, abandoning sweep");
                    break Err(err.into());
                }
            },
        }
    };

    if let Err(err) = lock.release_lock(key, owner, cancel).await {
        // The lease runs out on its own.
        warn!(key, error = %err, "failed to release lease");
    }
    result.map(Some)
}
