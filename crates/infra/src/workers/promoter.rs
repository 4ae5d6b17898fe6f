//! Delayed-message promoter.
//!
//! Each poll claims delayed rows due within the lookahead window plus stale
//! `Queued` rows. Rows already due are sent inline; rows due later get a
//! timer task that sends them on time. If the timer is cancelled first the row
//! is flipped back to `Delayed` so the next poll picks it up again. Timers are
//! kept in a [`JoinSet`] and awaited by [`PeriodicTask::drain`] on shutdown.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use courier_messaging::Message;

use crate::config::CourierOptions;
use crate::lease::keys;
use crate::message_store::{DelayedBatchHandler, MessageStore, StoreError, ensure_active};
use crate::sender::MessageSender;

use super::{PeriodicTask, WorkerError, with_lease};

pub struct DelayedPromoter<S: MessageStore> {
    store: Arc<S>,
    sender: Arc<MessageSender<S>>,
    options: CourierOptions,
    timers: Mutex<JoinSet<()>>,
}

impl<S: MessageStore + 'static> DelayedPromoter<S> {
    pub fn new(store: Arc<S>, sender: Arc<MessageSender<S>>, options: CourierOptions) -> Self {
        Self {
            store,
            sender,
            options,
            timers: Mutex::new(JoinSet::new()),
        }
    }

    /// Timers still waiting to fire or finishing their send.
    pub fn pending_timers(&self) -> usize {
        self.timers.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// Claim and dispatch one batch. Returns the number of rows claimed.
    pub async fn promote(&self, cancel: &CancellationToken) -> Result<usize, WorkerError> {
        let claimed = with_lease(
            self.store.as_ref(),
            &self.options,
            keys::DELAYED_PROMOTION,
            cancel,
            || async {
                self.store
                    .schedule_messages_of_delayed(self, cancel)
                    .await
                    .map_err(WorkerError::from)
            },
        )
        .await?;
        Ok(claimed.unwrap_or(0))
    }

    fn schedule_later(&self, message: Message, cancel: CancellationToken) -> Result<(), StoreError> {
        let store = self.store.clone();
        let sender = self.sender.clone();
        let mut timers = self
            .timers
            .lock()
            .map_err(|_| StoreError::storage("promoter timer set poisoned"))?;
        while timers.try_join_next().is_some() {}

        timers.spawn(async move {
            let Some(due) = message.expires_at else {
                return;
            };
            let wait = (due - Utc::now()).to_std().unwrap_or_default();

            tokio::select! {
                _ = cancel.cancelled() => {
                    // The caller's token is already cancelled; the flip back
                    // must still reach storage.
                    let ids = [message.id.clone()];
                    match store.change_publish_state_to_delayed(&ids, &CancellationToken::new()).await {
                        Ok(_) => debug!(id = %message.id, "delayed send cancelled, row returned to delayed"),
                        Err(err) => warn!(id = %message.id, error = %err, "failed to return row to delayed"),
                    }
                }
                _ = tokio::time::sleep(wait) => {
                    if let Err(err) = sender.send(&message, &cancel).await {
                        warn!(id = %message.id, error = %err, "delayed send failed");
                    }
                }
            }
        });
        Ok(())
    }

    async fn join_timers(&self) {
        let mut timers = match self.timers.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => return,
        };
        while let Some(joined) = timers.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "delayed send timer ended abnormally");
            }
        }
    }
}

#[async_trait]
impl<S: MessageStore + 'static> DelayedBatchHandler for DelayedPromoter<S> {
    async fn handle(&self, batch: Vec<Message>, cancel: &CancellationToken) -> Result<(), StoreError> {
        let now = Utc::now();
        for message in batch {
            ensure_active(cancel)?;
            let due_now = message.expires_at.is_none_or(|due| due <= now);
            if due_now {
                self.sender.send(&message, cancel).await?;
            } else {
                debug!(id = %message.id, due = ?message.expires_at, "delayed send scheduled");
                self.schedule_later(message, cancel.clone())?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<S: MessageStore + 'static> PeriodicTask for DelayedPromoter<S> {
    fn name(&self) -> &'static str {
        "delayed-promoter"
    }

    async fn run_once(&self, cancel: &CancellationToken) -> Result<(), WorkerError> {
        let claimed = self.promote(cancel).await?;
        if claimed > 0 {
            debug!(claimed, "delayed messages promoted");
        }
        Ok(())
    }

    async fn drain(&self) {
        self.join_timers().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_store::InMemoryMessageStore;
    use crate::workers::{WorkerHandle, spawn_periodic};
    use courier_core::time;
    use courier_messaging::{Content, InMemoryTransport, MessageStatus, MessageTable};
    use std::time::Duration;

    struct Fixture {
        store: Arc<InMemoryMessageStore>,
        transport: Arc<InMemoryTransport>,
        promoter: DelayedPromoter<InMemoryMessageStore>,
    }

    fn fixture() -> Fixture {
        let options = CourierOptions::default();
        let store = Arc::new(InMemoryMessageStore::new(options.clone()));
        let transport = Arc::new(InMemoryTransport::new());
        let sender = Arc::new(MessageSender::new(store.clone(), transport.clone(), options.clone()));
        let promoter = DelayedPromoter::new(store.clone(), sender, options);
        Fixture {
            store,
            transport,
            promoter,
        }
    }

    async fn delayed(store: &InMemoryMessageStore, due_in: Duration, past: bool) -> Message {
        let cancel = CancellationToken::new();
        let mut m = store
            .store_message("orders.remind", &Content::new(serde_json::json!(1)), None, &cancel)
            .await
            .unwrap();
        let now = Utc::now();
        m.expires_at = Some(if past { time::before(now, due_in) } else { time::after(now, due_in) });
        store
            .change_publish_state(&m, MessageStatus::Delayed, None, &cancel)
            .await
            .unwrap();
        m
    }

    #[tokio::test]
    async fn overdue_rows_are_sent_immediately() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let m = delayed(&f.store, Duration::from_secs(5), true).await;

        assert_eq!(f.promoter.promote(&cancel).await.unwrap(), 1);

        let row = f.store.get_message(MessageTable::Published, &m.id, &cancel).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Succeeded);
        assert_eq!(f.transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn far_future_rows_are_left_alone() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let m = delayed(&f.store, Duration::from_secs(600), false).await;

        assert_eq!(f.promoter.promote(&cancel).await.unwrap(), 0);

        let row = f.store.get_message(MessageTable::Published, &m.id, &cancel).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Delayed);
    }

    #[tokio::test]
    async fn cancelled_timer_returns_row_to_delayed() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let m = delayed(&f.store, Duration::from_secs(90), false).await;

        assert_eq!(f.promoter.promote(&cancel).await.unwrap(), 1);
        assert_eq!(f.promoter.pending_timers(), 1);
        let row = f.store.get_message(MessageTable::Published, &m.id, &cancel).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Queued);

        cancel.cancel();
        f.promoter.drain().await;

        let fresh = CancellationToken::new();
        let row = f.store.get_message(MessageTable::Published, &m.id, &fresh).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Delayed);
        assert_eq!(f.promoter.pending_timers(), 0);
        assert_eq!(f.transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_waits_for_pending_timers() {
        let f = fixture();
        let m = delayed(&f.store, Duration::from_secs(90), false).await;
        let promoter = Arc::new(f.promoter);
        let cancel = CancellationToken::new();
        let mut handle = WorkerHandle::new(cancel.clone());
        handle.push(spawn_periodic(promoter.clone(), Duration::from_secs(3600), cancel));

        for _ in 0..200 {
            if promoter.pending_timers() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(promoter.pending_timers(), 1);

        handle.shutdown().await;

        let row = f
            .store
            .get_message(MessageTable::Published, &m.id, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, MessageStatus::Delayed);
        assert_eq!(f.transport.sent_count(), 0);
    }
}
