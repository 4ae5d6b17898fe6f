//! Publishing API and the transactional outbox.
//!
//! `MessagePublisher::publish` stores and sends right away. Inside an
//! [`OutboxTransaction`] publishes are buffered; `commit` writes them in the
//! same physical transaction as the caller's business rows, commits, and only
//! then hands them to the transport. If the transaction is rolled back or
//! dropped, nothing is persisted and nothing is sent.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use courier_core::{CoreError, time};
use courier_messaging::{Content, Message, MessageStatus, headers};

use crate::message_store::{MessageStore, StoreError};
use crate::sender::MessageSender;

/// Failure of an outbox operation. `E` is the caller's business error.
#[derive(Debug, Error)]
pub enum OutboxError<E> {
    #[error(transparent)]
    Invalid(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The business operation failed; the transaction was rolled back.
    #[error("operation failed: {0}")]
    Operation(E),
}

fn validate_name(name: &str) -> Result<(), CoreError> {
    if name.trim().is_empty() {
        return Err(CoreError::validation("message name cannot be empty"));
    }
    Ok(())
}

fn typed_content<T: Serialize>(value: &T) -> Result<Content, CoreError> {
    Content::from_typed(value).map_err(|e| CoreError::validation(format!("payload not serializable: {e}")))
}

/// Entry point for publishing messages.
pub struct MessagePublisher<S: MessageStore> {
    store: Arc<S>,
    sender: Arc<MessageSender<S>>,
}

impl<S: MessageStore> MessagePublisher<S> {
    pub fn new(store: Arc<S>, sender: Arc<MessageSender<S>>) -> Self {
        Self { store, sender }
    }

    /// Store `content` under `name` and send it.
    ///
    /// A transport failure does not fail the publish: the row is kept as
    /// `Failed` and retried in the background.
    pub async fn publish(
        &self,
        name: &str,
        content: Content,
        cancel: &CancellationToken,
    ) -> Result<Message, OutboxError<std::convert::Infallible>> {
        validate_name(name)?;
        let content = stamp_sent_time(content);
        let message = self.store.store_message(name, &content, None, cancel).await?;
        self.sender.send(&message, cancel).await?;
        Ok(message)
    }

    pub async fn publish_typed<T: Serialize + Sync>(
        &self,
        name: &str,
        value: &T,
        cancel: &CancellationToken,
    ) -> Result<Message, OutboxError<std::convert::Infallible>> {
        self.publish(name, typed_content(value)?, cancel).await
    }

    /// Store `content` for delivery after `delay`.
    ///
    /// The row is written `Scheduled` and flipped to `Delayed` with its due
    /// time in one transaction; the delayed sweep sends it.
    pub async fn publish_delay(
        &self,
        name: &str,
        content: Content,
        delay: Duration,
        cancel: &CancellationToken,
    ) -> Result<Message, OutboxError<std::convert::Infallible>> {
        validate_name(name)?;
        let due = time::after(Utc::now(), delay);
        let content = stamp_sent_time(content).with_header(headers::DELAY_TIME, due.to_rfc3339());

        let mut tx = self.store.begin(cancel).await?;
        let result = self.store_delayed(name, &content, due, &mut tx, cancel).await;
        match result {
            Ok(message) => {
                self.store.commit(tx).await?;
                debug!(id = %message.id, topic = name, due = %due, "message delayed");
                Ok(message)
            }
            Err(err) => {
                self.store.rollback(tx).await?;
                Err(err.into())
            }
        }
    }

    async fn store_delayed(
        &self,
        name: &str,
        content: &Content,
        due: chrono::DateTime<Utc>,
        tx: &mut S::Tx,
        cancel: &CancellationToken,
    ) -> Result<Message, StoreError> {
        let mut message = self.store.store_message(name, content, Some(&mut *tx), cancel).await?;
        message.expires_at = Some(due);
        self.store
            .change_publish_state(&message, MessageStatus::Delayed, Some(tx), cancel)
            .await?;
        message.status = MessageStatus::Delayed;
        Ok(message)
    }

    /// Open an outbox transaction on the store.
    pub async fn begin_transaction(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OutboxTransaction<'_, S>, StoreError> {
        let tx = self.store.begin(cancel).await?;
        Ok(OutboxTransaction {
            publisher: self,
            tx,
            buffered: Vec::new(),
            cancel: cancel.clone(),
        })
    }

    /// Run `operation` inside an outbox transaction.
    ///
    /// Commits when it returns `Ok`; rolls back before returning its error
    /// otherwise.
    pub async fn execute<T, E, F>(
        &self,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, OutboxError<E>>
    where
        F: for<'t> FnOnce(&'t mut OutboxTransaction<'_, S>) -> BoxFuture<'t, Result<T, E>>,
    {
        let mut tx = self.begin_transaction(cancel).await?;
        match operation(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                tx.rollback().await?;
                Err(OutboxError::Operation(err))
            }
        }
    }
}

fn stamp_sent_time(content: Content) -> Content {
    if content.header(headers::SENT_TIME).is_some() {
        return content;
    }
    content.with_header(headers::SENT_TIME, Utc::now().to_rfc3339())
}

/// A business transaction with buffered message intents.
///
/// Dropping it without `commit` discards both the buffered messages and the
/// underlying store transaction.
pub struct OutboxTransaction<'p, S: MessageStore> {
    publisher: &'p MessagePublisher<S>,
    tx: S::Tx,
    buffered: Vec<(String, Content)>,
    cancel: CancellationToken,
}

impl<'p, S: MessageStore> OutboxTransaction<'p, S> {
    /// Buffer a message; it is written on commit.
    pub fn publish(&mut self, name: &str, content: Content) -> Result<(), CoreError> {
        validate_name(name)?;
        self.buffered.push((name.to_string(), stamp_sent_time(content)));
        Ok(())
    }

    pub fn publish_typed<T: Serialize>(&mut self, name: &str, value: &T) -> Result<(), CoreError> {
        self.publish(name, typed_content(value)?)
    }

    /// The store transaction, for the caller's own business writes.
    pub fn tx_mut(&mut self) -> &mut S::Tx {
        &mut self.tx
    }

    pub fn pending(&self) -> usize {
        self.buffered.len()
    }

    /// Write buffered messages, commit, then send them.
    ///
    /// Send failures after the commit are left to the retry sweep.
    pub async fn commit(self) -> Result<Vec<Message>, StoreError> {
        let Self {
            publisher,
            mut tx,
            buffered,
            cancel,
        } = self;
        let store = &publisher.store;

        let mut messages = Vec::with_capacity(buffered.len());
        for (name, content) in &buffered {
            match store.store_message(name, content, Some(&mut tx), &cancel).await {
                Ok(message) => messages.push(message),
                Err(err) => {
                    store.rollback(tx).await?;
                    return Err(err);
                }
            }
        }
        store.commit(tx).await?;

        for message in &messages {
            if let Err(err) = publisher.sender.send(message, &cancel).await {
                warn!(id = %message.id, error = %err, "post-commit send failed, left for retry");
            }
        }
        Ok(messages)
    }

    /// Discard buffered messages and roll back the store transaction.
    pub async fn rollback(self) -> Result<(), StoreError> {
        debug!(discarded = self.buffered.len(), "outbox transaction rolled back");
        self.publisher.store.rollback(self.tx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CourierOptions;
    use crate::message_store::{InMemoryMessageStore, InMemoryTransaction};
    use courier_messaging::{InMemoryTransport, MessageTable};
    use std::sync::Mutex;

    struct Fixture {
        store: Arc<InMemoryMessageStore>,
        transport: Arc<InMemoryTransport>,
        publisher: MessagePublisher<InMemoryMessageStore>,
    }

    fn fixture() -> Fixture {
        let options = CourierOptions::default();
        let store = Arc::new(InMemoryMessageStore::new(options.clone()));
        let transport = Arc::new(InMemoryTransport::new());
        let sender = Arc::new(MessageSender::new(store.clone(), transport.clone(), options));
        let publisher = MessagePublisher::new(store.clone(), sender);
        Fixture {
            store,
            transport,
            publisher,
        }
    }

    fn content() -> Content {
        Content::new(serde_json::json!({"order": 1}))
    }

    #[tokio::test]
    async fn publish_stores_and_sends() {
        let f = fixture();
        let cancel = CancellationToken::new();

        let message = f.publisher.publish("orders.placed", content(), &cancel).await.unwrap();

        let row = f.store.get_message(MessageTable::Published, &message.id, &cancel).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Succeeded);
        assert!(row.content.header(headers::SENT_TIME).is_some());
        assert_eq!(f.transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn publish_survives_transport_failure() {
        let f = fixture();
        let cancel = CancellationToken::new();
        f.transport.fail_next(1);

        let message = f.publisher.publish("orders.placed", content(), &cancel).await.unwrap();

        let row = f.store.get_message(MessageTable::Published, &message.id, &cancel).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Failed);
        assert_eq!(row.retry_count, 1);
    }

    #[tokio::test]
    async fn empty_name_is_rejected() {
        let f = fixture();
        let err = f
            .publisher
            .publish("  ", content(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OutboxError::Invalid(CoreError::Validation(_))));
    }

    #[tokio::test]
    async fn publish_delay_stores_delayed_with_due_time() {
        let f = fixture();
        let cancel = CancellationToken::new();

        let message = f
            .publisher
            .publish_delay("orders.remind", content(), Duration::from_secs(600), &cancel)
            .await
            .unwrap();

        let row = f.store.get_message(MessageTable::Published, &message.id, &cancel).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Delayed);
        assert!(row.expires_at.unwrap() > time::after(Utc::now(), Duration::from_secs(500)));
        assert!(row.content.header(headers::DELAY_TIME).is_some());
        assert_eq!(f.transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn commit_persists_messages_and_business_rows_together() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let orders = Arc::new(Mutex::new(Vec::new()));

        let mut tx = f.publisher.begin_transaction(&cancel).await.unwrap();
        let sink = orders.clone();
        tx.tx_mut().on_commit(move || sink.lock().unwrap().push("order-1"));
        tx.publish("orders.placed", content()).unwrap();
        assert_eq!(f.store.statistics(&cancel).await.unwrap().published.total(), 0);

        let messages = tx.commit().await.unwrap();

        assert_eq!(messages.len(), 1);
        assert_eq!(*orders.lock().unwrap(), vec!["order-1"]);
        assert_eq!(f.transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn rollback_and_drop_persist_nothing() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let orders: Arc<Mutex<Vec<&str>>> = Arc::new(Mutex::new(Vec::new()));

        let mut tx = f.publisher.begin_transaction(&cancel).await.unwrap();
        let sink = orders.clone();
        tx.tx_mut().on_commit(move || sink.lock().unwrap().push("order-1"));
        tx.publish("orders.placed", content()).unwrap();
        tx.rollback().await.unwrap();

        {
            let mut tx = f.publisher.begin_transaction(&cancel).await.unwrap();
            tx.publish("orders.placed", content()).unwrap();
        }

        assert!(orders.lock().unwrap().is_empty());
        assert_eq!(f.store.statistics(&cancel).await.unwrap().published.total(), 0);
        assert_eq!(f.transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn failing_operation_rolls_back_before_error_propagates() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let orders: Arc<Mutex<Vec<&str>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = orders.clone();

        let result: Result<(), OutboxError<&str>> = f
            .publisher
            .execute(&cancel, move |tx| {
                Box::pin(async move {
                    let tx_inner: &mut InMemoryTransaction = tx.tx_mut();
                    tx_inner.on_commit(move || sink.lock().unwrap().push("order-1"));
                    tx.publish("orders.placed", content()).map_err(|_| "invalid")?;
                    Err("insufficient stock")
                })
            })
            .await;

        assert!(matches!(result, Err(OutboxError::Operation("insufficient stock"))));
        assert!(orders.lock().unwrap().is_empty());
        assert_eq!(f.store.statistics(&cancel).await.unwrap().published.total(), 0);
    }

    #[tokio::test]
    async fn successful_operation_commits() {
        let f = fixture();
        let cancel = CancellationToken::new();

        let count = f
            .publisher
            .execute(&cancel, |tx| {
                Box::pin(async move {
                    tx.publish("orders.placed", content())?;
                    tx.publish("orders.billed", content())?;
                    Ok::<_, CoreError>(tx.pending())
                })
            })
            .await
            .unwrap();

        assert_eq!(count, 2);
        let stats = f.store.statistics(&cancel).await.unwrap();
        assert_eq!(stats.published.succeeded, 2);
    }
}
