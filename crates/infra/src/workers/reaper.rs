//! Retry sweep for failed and never-sent messages.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use courier_messaging::MessageStatus;

use crate::config::CourierOptions;
use crate::lease::keys;
use crate::message_store::{MessageStore, ensure_active};
use crate::receiver::ReceiveExecutor;
use crate::sender::MessageSender;

use super::{PeriodicTask, WorkerError, with_lease};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReaperReport {
    pub published_retried: usize,
    pub published_succeeded: usize,
    pub received_retried: usize,
    pub received_succeeded: usize,
}

/// Re-sends published rows and re-dispatches received rows that still have
/// retry budget and are older than the fallback window.
pub struct RetryReaper<S: MessageStore> {
    store: Arc<S>,
    sender: Arc<MessageSender<S>>,
    receiver: Arc<ReceiveExecutor<S>>,
    options: CourierOptions,
}

impl<S: MessageStore + 'static> RetryReaper<S> {
    pub fn new(
        store: Arc<S>,
        sender: Arc<MessageSender<S>>,
        receiver: Arc<ReceiveExecutor<S>>,
        options: CourierOptions,
    ) -> Self {
        Self {
            store,
            sender,
            receiver,
            options,
        }
    }

    pub async fn sweep(&self, cancel: &CancellationToken) -> Result<ReaperReport, WorkerError> {
        let mut report = ReaperReport::default();

        if let Some((retried, succeeded)) = with_lease(
            self.store.as_ref(),
            &self.options,
            keys::PUBLISHED_RETRY,
            cancel,
            || self.retry_published(cancel),
        )
        .await?
        {
            report.published_retried = retried;
            report.published_succeeded = succeeded;
        }

        if let Some((retried, succeeded)) = with_lease(
            self.store.as_ref(),
            &self.options,
            keys::RECEIVED_RETRY,
            cancel,
            || self.retry_received(cancel),
        )
        .await?
        {
            report.received_retried = retried;
            report.received_succeeded = succeeded;
        }

        Ok(report)
    }

    async fn retry_published(&self, cancel: &CancellationToken) -> Result<(usize, usize), WorkerError> {
        let candidates = self
            .store
            .get_published_messages_of_need_retry(self.options.fallback_window, cancel)
            .await?;

        let mut succeeded = 0;
        for message in &candidates {
            ensure_active(cancel)?;
            debug!(id = %message.id, retries = message.retry_count, "retrying published message");
            if self.sender.send(message, cancel).await?.is_success() {
                succeeded += 1;
            }
        }
        Ok((candidates.len(), succeeded))
    }

    async fn retry_received(&self, cancel: &CancellationToken) -> Result<(usize, usize), WorkerError> {
        let candidates = self
            .store
            .get_received_messages_of_need_retry(self.options.fallback_window, cancel)
            .await?;

        let mut succeeded = 0;
        for message in &candidates {
            ensure_active(cancel)?;
            debug!(id = %message.id, group = ?message.group, retries = message.retry_count, "retrying received message");
            if self.receiver.execute(message, cancel).await? == MessageStatus::Succeeded {
                succeeded += 1;
            }
        }
        Ok((candidates.len(), succeeded))
    }
}

#[async_trait]
impl<S: MessageStore + 'static> PeriodicTask for RetryReaper<S> {
    fn name(&self) -> &'static str {
        "retry-reaper"
    }

    async fn run_once(&self, cancel: &CancellationToken) -> Result<(), WorkerError> {
        let report = self.sweep(cancel).await?;
        if report.published_retried + report.received_retried > 0 {
            info!(
                published = report.published_retried,
                published_ok = report.published_succeeded,
                received = report.received_retried,
                received_ok = report.received_succeeded,
                "retry sweep finished"
            );
        }
        Ok(())
    }
}
