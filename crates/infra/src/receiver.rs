//! Inbound path: decode, persist per consumer group, dispatch, record outcome.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use courier_core::time;
use courier_messaging::{
    ConsumerContext, Dispatcher, Message, MessageStatus, Serializer, TransportMessage, headers,
};

use crate::config::CourierOptions;
use crate::message_store::{MessageStore, StoreError};

/// Per-group results of one inbound delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Groups for which only an exception row was recorded.
    pub undecodable: usize,
}

/// Receives transport messages and drives them through the dispatcher.
///
/// Consumer errors end up on the stored row (`Failed`, retried by the
/// reaper); only storage errors are returned.
pub struct ReceiveExecutor<S: MessageStore> {
    store: Arc<S>,
    serializer: Arc<dyn Serializer>,
    dispatcher: Arc<Dispatcher>,
    options: CourierOptions,
}

impl<S: MessageStore> ReceiveExecutor<S> {
    pub fn new(
        store: Arc<S>,
        serializer: Arc<dyn Serializer>,
        dispatcher: Arc<Dispatcher>,
        options: CourierOptions,
    ) -> Self {
        Self {
            store,
            serializer,
            dispatcher,
            options,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Handle one delivery from the transport.
    ///
    /// A message addressed to a group is stored once for that group;
    /// otherwise it is stored once per group subscribed to the topic.
    pub async fn on_message(
        &self,
        raw: TransportMessage,
        cancel: &CancellationToken,
    ) -> Result<ReceiveReport, StoreError> {
        let groups = self.target_groups(&raw);
        let mut report = ReceiveReport::default();

        let content = match self.serializer.deserialize(&raw.body) {
            Ok(content) => content,
            Err(err) => {
                warn!(topic = %raw.topic, error = %err, "inbound message could not be decoded");
                for group in &groups {
                    self.store
                        .store_received_exception_message(&raw.topic, group, &raw, cancel)
                        .await?;
                    report.undecodable += 1;
                }
                return Ok(report);
            }
        };

        for group in &groups {
            let message = self
                .store
                .store_received_message(&raw.topic, group, &content, cancel)
                .await?;
            match self.execute(&message, cancel).await? {
                MessageStatus::Succeeded => report.succeeded += 1,
                _ => report.failed += 1,
            }
        }
        Ok(report)
    }

    /// Dispatch a stored inbound row to its group and record the outcome.
    ///
    /// Used for first delivery and for reaper retries alike.
    pub async fn execute(
        &self,
        message: &Message,
        cancel: &CancellationToken,
    ) -> Result<MessageStatus, StoreError> {
        let mut ctx = ConsumerContext::new(message.name.clone(), message.content.clone())
            .with_message_id(message.id.clone());
        if let Some(group) = &message.group {
            ctx = ctx.for_group(group.clone());
        }

        let now = Utc::now();
        let mut updated = message.clone();
        let status = match self.dispatcher.dispatch(&ctx, cancel).await {
            Ok(consumers) => {
                debug!(id = %message.id, topic = %message.name, consumers, "message consumed");
                updated.expires_at = Some(time::after(now, self.options.succeeded_message_expired_after));
                MessageStatus::Succeeded
            }
            Err(err) => {
                updated.retry_count = updated.retry_count.saturating_add(1);
                updated.content.set_header(headers::EXCEPTION, err.to_string());
                let exhausted = updated.is_retry_exhausted(self.options.failed_retry_count);
                updated.expires_at =
                    exhausted.then(|| time::after(now, self.options.failed_message_expired_after));

                if exhausted {
                    error!(id = %message.id, topic = %message.name, group = ?message.group, error = %err, "consumer failed, retries exhausted");
                } else {
                    warn!(id = %message.id, topic = %message.name, group = ?message.group, error = %err, "consumer failed");
                }
                MessageStatus::Failed
            }
        };

        self.store
            .change_receive_state(&updated, status, None, cancel)
            .await?;
        Ok(status)
    }

    fn target_groups(&self, raw: &TransportMessage) -> Vec<String> {
        if let Some(group) = &raw.group {
            return vec![group.clone()];
        }
        let groups = self.dispatcher.groups_for(&raw.topic);
        if groups.is_empty() {
            // Still recorded, so the miss is visible and retried.
            vec![self.options.selector_options().default_group_name()]
        } else {
            groups
        }
    }
}
