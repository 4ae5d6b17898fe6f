//! Expiry collector: purge terminal messages and old job executions.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use courier_messaging::MessageTable;

use crate::config::CourierOptions;
use crate::jobs::JobStore;
use crate::lease::keys;
use crate::message_store::{MessageStore, ensure_active};

use super::{PeriodicTask, WorkerError, with_lease};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectorReport {
    pub published: usize,
    pub received: usize,
    pub executions: usize,
}

impl CollectorReport {
    pub fn total(&self) -> usize {
        self.published + self.received + self.executions
    }
}

/// Deletes expired rows in bounded batches until a batch comes back short.
pub struct ExpiryCollector<S: MessageStore> {
    store: Arc<S>,
    jobs: Option<Arc<dyn JobStore>>,
    options: CourierOptions,
}

impl<S: MessageStore + 'static> ExpiryCollector<S> {
    pub fn new(store: Arc<S>, options: CourierOptions) -> Self {
        Self {
            store,
            jobs: None,
            options,
        }
    }

    /// Also purge job executions past the retention window.
    pub fn with_job_store(mut self, jobs: Arc<dyn JobStore>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub async fn collect(&self, cancel: &CancellationToken) -> Result<CollectorReport, WorkerError> {
        let report = with_lease(
            self.store.as_ref(),
            &self.options,
            keys::EXPIRY_COLLECTOR,
            cancel,
            || self.collect_unguarded(cancel),
        )
        .await?;
        Ok(report.unwrap_or_default())
    }

    async fn collect_unguarded(&self, cancel: &CancellationToken) -> Result<CollectorReport, WorkerError> {
        let mut report = CollectorReport {
            published: self.purge_table(MessageTable::Published, cancel).await?,
            received: self.purge_table(MessageTable::Received, cancel).await?,
            executions: 0,
        };

        if let Some(jobs) = &self.jobs {
            report.executions = jobs
                .purge_executions(self.options.execution_retention, cancel)
                .await?;
        }
        Ok(report)
    }

    async fn purge_table(&self, table: MessageTable, cancel: &CancellationToken) -> Result<usize, WorkerError> {
        let batch_size = self.options.expired_delete_batch_size;
        let cutoff = Utc::now();
        let mut total = 0;

        loop {
            ensure_active(cancel)?;
            let deleted = self
                .store
                .delete_expires(table, cutoff, batch_size, cancel)
                .await?;
            total += deleted;
            if deleted < batch_size {
                return Ok(total);
            }
        }
    }
}

#[async_trait]
impl<S: MessageStore + 'static> PeriodicTask for ExpiryCollector<S> {
    fn name(&self) -> &'static str {
        "expiry-collector"
    }

    async fn run_once(&self, cancel: &CancellationToken) -> Result<(), WorkerError> {
        let report = self.collect(cancel).await?;
        if report.total() > 0 {
            info!(
                published = report.published,
                received = report.received,
                executions = report.executions,
                "expired rows collected"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{ExecutionStatus, InMemoryJobStore, JobExecution, ScheduledJob};
    use crate::message_store::InMemoryMessageStore;
    use courier_core::time;
    use courier_messaging::{Content, MessageStatus};
    use std::time::Duration;

    #[tokio::test]
    async fn drains_expired_rows_across_batches() {
        let options = CourierOptions::default().with_expired_delete_batch_size(2);
        let store = Arc::new(InMemoryMessageStore::new(options.clone()));
        let cancel = CancellationToken::new();
        let past = time::before(Utc::now(), Duration::from_secs(60));

        for _ in 0..5 {
            let mut m = store
                .store_message("t", &Content::new(serde_json::json!(1)), None, &cancel)
                .await
                .unwrap();
            m.expires_at = Some(past);
            store
                .change_publish_state(&m, MessageStatus::Succeeded, None, &cancel)
                .await
                .unwrap();
        }
        let live = store
            .store_message("t", &Content::new(serde_json::json!(1)), None, &cancel)
            .await
            .unwrap();

        let collector = ExpiryCollector::new(store.clone(), options);
        let report = collector.collect(&cancel).await.unwrap();

        assert_eq!(report.published, 5);
        assert!(store.get_message(MessageTable::Published, &live.id, &cancel).await.unwrap().is_some());
        assert_eq!(collector.collect(&cancel).await.unwrap(), CollectorReport::default());
    }

    #[tokio::test]
    async fn purges_old_job_executions() {
        let options = CourierOptions::default().with_execution_retention(Duration::from_secs(60));
        let store = Arc::new(InMemoryMessageStore::new(options.clone()));
        let jobs = InMemoryJobStore::arc();
        let cancel = CancellationToken::new();

        let job = jobs
            .upsert_job(ScheduledJob::new("a", "report", "@every 60s", Utc::now()), &cancel)
            .await
            .unwrap();
        let mut execution = JobExecution::start(&job, 1, "node-a");
        execution.finish(ExecutionStatus::Succeeded, None);
        execution.completed_at = Some(time::before(Utc::now(), Duration::from_secs(3600)));
        jobs.create_execution(&execution, &cancel).await.unwrap();

        let collector = ExpiryCollector::new(store, options).with_job_store(jobs.clone());
        let report = collector.collect(&cancel).await.unwrap();
        assert_eq!(report.executions, 1);
    }
}
