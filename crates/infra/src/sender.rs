//! Outbound delivery: hand a stored message to the transport and record the
//! resulting state.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use courier_core::time;
use courier_messaging::{Message, MessageStatus, Transport, headers};

use crate::config::CourierOptions;
use crate::message_store::{MessageStore, StoreError};

/// Result of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Succeeded,
    /// The transport refused the message; the reaper will try again.
    Failed,
    /// The transport refused the message and the retry budget is used up.
    Exhausted,
}

impl SendOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SendOutcome::Succeeded)
    }
}

/// Sends published messages and applies the status transition.
///
/// Transport failures are not errors here: they are recorded on the row as
/// `Failed` and picked up by the reaper. Only storage failures are returned.
pub struct MessageSender<S: MessageStore> {
    store: Arc<S>,
    transport: Arc<dyn Transport>,
    options: CourierOptions,
}

impl<S: MessageStore> MessageSender<S> {
    pub fn new(store: Arc<S>, transport: Arc<dyn Transport>, options: CourierOptions) -> Self {
        Self {
            store,
            transport,
            options,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub async fn send(
        &self,
        message: &Message,
        cancel: &CancellationToken,
    ) -> Result<SendOutcome, StoreError> {
        let result = self.transport.send(message.to_transport()).await;
        let now = Utc::now();
        let mut updated = message.clone();

        match result {
            Ok(()) => {
                updated.expires_at = Some(time::after(now, self.options.succeeded_message_expired_after));
                self.store
                    .change_publish_state(&updated, MessageStatus::Succeeded, None, cancel)
                    .await?;
                debug!(id = %message.id, topic = %message.name, "message delivered");
                Ok(SendOutcome::Succeeded)
            }
            Err(err) => {
                updated.retry_count = updated.retry_count.saturating_add(1);
                updated.content.set_header(headers::EXCEPTION, err.to_string());

                let exhausted = updated.is_retry_exhausted(self.options.failed_retry_count);
                updated.expires_at = exhausted
                    .then(|| time::after(now, self.options.failed_message_expired_after));

                self.store
                    .change_publish_state(&updated, MessageStatus::Failed, None, cancel)
                    .await?;

                if exhausted {
                    error!(
                        id = %message.id,
                        topic = %message.name,
                        retries = updated.retry_count,
                        error = %err,
                        "message delivery failed, retries exhausted"
                    );
                    Ok(SendOutcome::Exhausted)
                } else {
                    warn!(
                        id = %message.id,
                        topic = %message.name,
                        retries = updated.retry_count,
                        error = %err,
                        "message delivery failed"
                    );
                    Ok(SendOutcome::Failed)
                }
            }
        }
    }
}
