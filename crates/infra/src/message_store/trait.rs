use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use courier_core::MessageId;
use courier_messaging::{Content, Message, MessageStatus, MessageTable, SerializerError, TransportMessage};

use crate::lease::LeaseLock;

/// Most rows a single retry query returns.
pub const RETRY_BATCH_LIMIT: usize = 200;

/// Delayed messages due within this window are picked up early.
pub const DELAYED_LOOKAHEAD: Duration = Duration::from_secs(2 * 60);

/// A `Queued` message not finished after this long is treated as lost.
pub const QUEUED_STALE_AFTER: Duration = Duration::from_secs(60);

/// Message store operation error.
///
/// These are infrastructure errors. Lease contention is not an error: lock
/// operations report it as `Ok(false)`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("message not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Serialization(#[from] SerializerError),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

/// Fail fast when the caller has already given up.
pub fn ensure_active(cancel: &CancellationToken) -> Result<(), StoreError> {
    if cancel.is_cancelled() {
        Err(StoreError::Cancelled)
    } else {
        Ok(())
    }
}

/// Receives a claimed batch of delayed/stuck messages.
///
/// By the time the handler runs, every message in the batch has been flipped to
/// `Queued` with `expires_at` set to its due time (or now, if already due), so
/// a concurrent poll will not claim it again until it goes stale.
#[async_trait]
pub trait DelayedBatchHandler: Send + Sync {
    async fn handle(&self, batch: Vec<Message>, cancel: &CancellationToken) -> Result<(), StoreError>;
}

/// Per-status row counts for one table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub scheduled: u64,
    pub delayed: u64,
    pub queued: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: MessageStatus, n: u64) {
        match status {
            MessageStatus::Scheduled => self.scheduled += n,
            MessageStatus::Delayed => self.delayed += n,
            MessageStatus::Queued => self.queued += n,
            MessageStatus::Succeeded => self.succeeded += n,
            MessageStatus::Failed => self.failed += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.scheduled + self.delayed + self.queued + self.succeeded + self.failed
    }
}

/// Snapshot of both tables for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MessageStatistics {
    pub published: StatusCounts,
    pub received: StatusCounts,
}

/// Durable store for outbound ("published") and inbound ("received") messages.
///
/// ## Status machine
///
/// Rows are created `Scheduled` and move through `Delayed` / `Queued` to
/// `Succeeded` or `Failed`. Only `Scheduled` and `Failed` rows with retry
/// budget left are handed back by the retry queries; only `Succeeded` and
/// terminal `Failed` rows are purged.
///
/// ## Transactions
///
/// `Tx` is the store's physical transaction. Operations that take
/// `Option<&mut Self::Tx>` write inside it when given one, and auto-commit
/// otherwise. This is how outbox rows share a transaction with business rows.
///
/// ## Cancellation
///
/// Every operation checks `cancel` before touching storage.
#[async_trait]
pub trait MessageStore: LeaseLock + Send + Sync {
    type Tx: Send;

    async fn begin(&self, cancel: &CancellationToken) -> Result<Self::Tx, StoreError>;
    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError>;
    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError>;

    /// Persist an outbound message as `Scheduled`.
    async fn store_message(
        &self,
        name: &str,
        content: &Content,
        tx: Option<&mut Self::Tx>,
        cancel: &CancellationToken,
    ) -> Result<Message, StoreError>;

    /// Persist an inbound message for one consumer group as `Scheduled`.
    async fn store_received_message(
        &self,
        name: &str,
        group: &str,
        content: &Content,
        cancel: &CancellationToken,
    ) -> Result<Message, StoreError>;

    /// Record an inbound message that could not be decoded.
    ///
    /// The row is created `Failed` with the retry budget exhausted and an
    /// expiry, so it is visible for inspection but never retried.
    async fn store_received_exception_message(
        &self,
        name: &str,
        group: &str,
        raw: &TransportMessage,
        cancel: &CancellationToken,
    ) -> Result<Message, StoreError>;

    /// Write `status`, `expires_at`, `retry_count` and the re-serialized content.
    async fn change_publish_state(
        &self,
        message: &Message,
        status: MessageStatus,
        tx: Option<&mut Self::Tx>,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError>;

    async fn change_receive_state(
        &self,
        message: &Message,
        status: MessageStatus,
        tx: Option<&mut Self::Tx>,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError>;

    /// Flip outbound rows back to `Delayed`, keeping their due time.
    async fn change_publish_state_to_delayed(
        &self,
        ids: &[MessageId],
        cancel: &CancellationToken,
    ) -> Result<usize, StoreError>;

    /// Remove at most `batch_size` purgeable rows whose `expires_at < cutoff`.
    async fn delete_expires(
        &self,
        table: MessageTable,
        cutoff: DateTime<Utc>,
        batch_size: usize,
        cancel: &CancellationToken,
    ) -> Result<usize, StoreError>;

    async fn get_published_messages_of_need_retry(
        &self,
        lookback: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>, StoreError>;

    async fn get_received_messages_of_need_retry(
        &self,
        lookback: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>, StoreError>;

    /// Claim due `Delayed` and stale `Queued` outbound rows and hand them to
    /// `handler`. Returns the batch size.
    async fn schedule_messages_of_delayed(
        &self,
        handler: &dyn DelayedBatchHandler,
        cancel: &CancellationToken,
    ) -> Result<usize, StoreError>;

    async fn get_message(
        &self,
        table: MessageTable,
        id: &MessageId,
        cancel: &CancellationToken,
    ) -> Result<Option<Message>, StoreError>;

    async fn statistics(&self, cancel: &CancellationToken) -> Result<MessageStatistics, StoreError>;
}

#[async_trait]
impl<S> MessageStore for Arc<S>
where
    S: MessageStore + ?Sized,
{
    type Tx = S::Tx;

    async fn begin(&self, cancel: &CancellationToken) -> Result<Self::Tx, StoreError> {
        (**self).begin(cancel).await
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError> {
        (**self).commit(tx).await
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError> {
        (**self).rollback(tx).await
    }

    async fn store_message(
        &self,
        name: &str,
        content: &Content,
        tx: Option<&mut Self::Tx>,
        cancel: &CancellationToken,
    ) -> Result<Message, StoreError> {
        (**self).store_message(name, content, tx, cancel).await
    }

    async fn store_received_message(
        &self,
        name: &str,
        group: &str,
        content: &Content,
        cancel: &CancellationToken,
    ) -> Result<Message, StoreError> {
        (**self).store_received_message(name, group, content, cancel).await
    }

    async fn store_received_exception_message(
        &self,
        name: &str,
        group: &str,
        raw: &TransportMessage,
        cancel: &CancellationToken,
    ) -> Result<Message, StoreError> {
        (**self).store_received_exception_message(name, group, raw, cancel).await
    }

    async fn change_publish_state(
        &self,
        message: &Message,
        status: MessageStatus,
        tx: Option<&mut Self::Tx>,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        (**self).change_publish_state(message, status, tx, cancel).await
    }

    async fn change_receive_state(
        &self,
        message: &Message,
        status: MessageStatus,
        tx: Option<&mut Self::Tx>,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        (**self).change_receive_state(message, status, tx, cancel).await
    }

    async fn change_publish_state_to_delayed(
        &self,
        ids: &[MessageId],
        cancel: &CancellationToken,
    ) -> Result<usize, StoreError> {
        (**self).change_publish_state_to_delayed(ids, cancel).await
    }

    async fn delete_expires(
        &self,
        table: MessageTable,
        cutoff: DateTime<Utc>,
        batch_size: usize,
        cancel: &CancellationToken,
    ) -> Result<usize, StoreError> {
        (**self).delete_expires(table, cutoff, batch_size, cancel).await
    }

    async fn get_published_messages_of_need_retry(
        &self,
        lookback: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>, StoreError> {
        (**self).get_published_messages_of_need_retry(lookback, cancel).await
    }

    async fn get_received_messages_of_need_retry(
        &self,
        lookback: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>, StoreError> {
        (**self).get_received_messages_of_need_retry(lookback, cancel).await
    }

    async fn schedule_messages_of_delayed(
        &self,
        handler: &dyn DelayedBatchHandler,
        cancel: &CancellationToken,
    ) -> Result<usize, StoreError> {
        (**self).schedule_messages_of_delayed(handler, cancel).await
    }

    async fn get_message(
        &self,
        table: MessageTable,
        id: &MessageId,
        cancel: &CancellationToken,
    ) -> Result<Option<Message>, StoreError> {
        (**self).get_message(table, id, cancel).await
    }

    async fn statistics(&self, cancel: &CancellationToken) -> Result<MessageStatistics, StoreError> {
        (**self).statistics(cancel).await
    }
}
