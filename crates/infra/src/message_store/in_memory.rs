use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use courier_core::MessageId;
use courier_messaging::{
    Content, JsonSerializer, Message, MessageStatus, MessageTable, Serializer, TransportMessage,
};

use super::r#trait::{
    DelayedBatchHandler, MessageStatistics, MessageStore, RETRY_BATCH_LIMIT, StatusCounts,
    StoreError, ensure_active,
};
use super::{is_expired, is_promotable, needs_retry, new_published, new_received, new_received_exception, with_status};
use crate::config::CourierOptions;
use crate::lease::{InMemoryLeaseLock, LeaseLock};

type Table = HashMap<MessageId, Message>;

#[derive(Debug)]
enum PendingWrite {
    Insert(MessageTable, Message),
    Update(MessageTable, Message),
}

/// Buffered writes of an in-memory transaction.
///
/// Nothing is visible to readers until [`MessageStore::commit`]. Business code
/// sharing the transaction registers its own writes with
/// [`InMemoryTransaction::on_commit`]; they run after the message rows land,
/// or never if the transaction is rolled back or dropped.
#[derive(Default)]
pub struct InMemoryTransaction {
    writes: Vec<PendingWrite>,
    on_commit: Vec<Box<dyn FnOnce() + Send>>,
}

impl InMemoryTransaction {
    pub fn on_commit<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_commit.push(Box::new(f));
    }

    /// Number of buffered message writes.
    pub fn pending(&self) -> usize {
        self.writes.len()
    }
}

impl core::fmt::Debug for InMemoryTransaction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryTransaction")
            .field("writes", &self.writes)
            .field("on_commit", &self.on_commit.len())
            .finish()
    }
}

/// In-memory message store.
///
/// Intended for tests/dev. Each table sits behind its own `RwLock`; every
/// state change is a read-modify-write under the write guard.
pub struct InMemoryMessageStore {
    options: CourierOptions,
    serializer: Arc<dyn Serializer>,
    published: RwLock<Table>,
    received: RwLock<Table>,
    leases: InMemoryLeaseLock,
}

impl InMemoryMessageStore {
    pub fn new(options: CourierOptions) -> Self {
        Self::with_serializer(options, Arc::new(JsonSerializer))
    }

    pub fn with_serializer(options: CourierOptions, serializer: Arc<dyn Serializer>) -> Self {
        Self {
            options,
            serializer,
            published: RwLock::new(HashMap::new()),
            received: RwLock::new(HashMap::new()),
            leases: InMemoryLeaseLock::new(),
        }
    }

    pub fn options(&self) -> &CourierOptions {
        &self.options
    }

    fn table(&self, table: MessageTable) -> &RwLock<Table> {
        match table {
            MessageTable::Published => &self.published,
            MessageTable::Received => &self.received,
        }
    }

    fn write(&self, table: MessageTable) -> Result<RwLockWriteGuard<'_, Table>, StoreError> {
        self.table(table)
            .write()
            .map_err(|_| StoreError::storage(format!("{} lock poisoned", table.table_name())))
    }

    fn read_all(&self, table: MessageTable) -> Result<Vec<Message>, StoreError> {
        let rows = self
            .table(table)
            .read()
            .map_err(|_| StoreError::storage(format!("{} lock poisoned", table.table_name())))?;
        Ok(rows.values().cloned().collect())
    }

    fn insert_now(&self, table: MessageTable, message: Message) -> Result<(), StoreError> {
        self.write(table)?.insert(message.id.clone(), message);
        Ok(())
    }

    fn update_now(&self, table: MessageTable, message: Message) -> Result<(), StoreError> {
        let mut rows = self.write(table)?;
        match rows.get_mut(&message.id) {
            Some(row) => {
                *row = message;
                Ok(())
            }
            None => Err(StoreError::NotFound(message.id.to_string())),
        }
    }

    fn change_state(
        &self,
        table: MessageTable,
        message: &Message,
        status: MessageStatus,
        tx: Option<&mut InMemoryTransaction>,
    ) -> Result<(), StoreError> {
        let updated = with_status(message, status, self.serializer.as_ref())?;
        match tx {
            Some(tx) => {
                tx.writes.push(PendingWrite::Update(table, updated));
                Ok(())
            }
            None => self.update_now(table, updated),
        }
    }

    fn retry_candidates(&self, table: MessageTable, lookback: Duration) -> Result<Vec<Message>, StoreError> {
        let now = Utc::now();
        let max = self.options.failed_retry_count;
        let mut rows: Vec<Message> = self
            .read_all(table)?
            .into_iter()
            .filter(|m| needs_retry(m, max, lookback, now))
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        rows.truncate(RETRY_BATCH_LIMIT);
        Ok(rows)
    }

    /// Overwrite a row's creation time.
    #[cfg(test)]
    pub(crate) fn backdate(&self, table: MessageTable, id: &MessageId, created_at: DateTime<Utc>) {
        if let Some(row) = self.table(table).write().unwrap().get_mut(id) {
            row.created_at = created_at;
        }
    }

    /// Insert a fully-formed row, bypassing the state machine.
    #[cfg(test)]
    pub(crate) fn seed(&self, table: MessageTable, message: Message) {
        self.table(table).write().unwrap().insert(message.id.clone(), message);
    }
}

impl core::fmt::Debug for InMemoryMessageStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryMessageStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl LeaseLock for InMemoryMessageStore {
    async fn acquire_lock(
        &self,
        key: &str,
        ttl: Duration,
        owner: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, StoreError> {
        self.leases.acquire_lock(key, ttl, owner, cancel).await
    }

    async fn renew_lock(
        &self,
        key: &str,
        ttl: Duration,
        owner: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, StoreError> {
        self.leases.renew_lock(key, ttl, owner, cancel).await
    }

    async fn release_lock(
        &self,
        key: &str,
        owner: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, StoreError> {
        self.leases.release_lock(key, owner, cancel).await
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    type Tx = InMemoryTransaction;

    async fn begin(&self, cancel: &CancellationToken) -> Result<Self::Tx, StoreError> {
        ensure_active(cancel)?;
        Ok(InMemoryTransaction::default())
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError> {
        let InMemoryTransaction { writes, on_commit } = tx;
        {
            let mut published = self.write(MessageTable::Published)?;
            let mut received = self.write(MessageTable::Received)?;

            // Every update must target a stored row or one inserted earlier in
            // the same transaction; otherwise nothing is applied.
            let mut inserted: HashSet<(MessageTable, &MessageId)> = HashSet::new();
            for write in &writes {
                match write {
                    PendingWrite::Insert(t, m) => {
                        inserted.insert((*t, &m.id));
                    }
                    PendingWrite::Update(t, m) => {
                        let stored = match t {
                            MessageTable::Published => published.contains_key(&m.id),
                            MessageTable::Received => received.contains_key(&m.id),
                        };
                        if !stored && !inserted.contains(&(*t, &m.id)) {
                            return Err(StoreError::NotFound(m.id.to_string()));
                        }
                    }
                }
            }
            drop(inserted);

            for write in writes {
                let (PendingWrite::Insert(table, message) | PendingWrite::Update(table, message)) = write;
                let rows = match table {
                    MessageTable::Published => &mut *published,
                    MessageTable::Received => &mut *received,
                };
                rows.insert(message.id.clone(), message);
            }
        }

        for f in on_commit {
            f();
        }
        Ok(())
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError> {
        drop(tx);
        Ok(())
    }

    async fn store_message(
        &self,
        name: &str,
        content: &Content,
        tx: Option<&mut Self::Tx>,
        cancel: &CancellationToken,
    ) -> Result<Message, StoreError> {
        ensure_active(cancel)?;
        let message = new_published(name, content, self.serializer.as_ref(), Utc::now())?;

        match tx {
            Some(tx) => tx
                .writes
                .push(PendingWrite::Insert(MessageTable::Published, message.clone())),
            None => self.insert_now(MessageTable::Published, message.clone())?,
        }
        Ok(message)
    }

    async fn store_received_message(
        &self,
        name: &str,
        group: &str,
        content: &Content,
        cancel: &CancellationToken,
    ) -> Result<Message, StoreError> {
        ensure_active(cancel)?;
        let message = new_received(name, group, content, self.serializer.as_ref(), Utc::now())?;
        self.insert_now(MessageTable::Received, message.clone())?;
        Ok(message)
    }

    async fn store_received_exception_message(
        &self,
        name: &str,
        group: &str,
        raw: &TransportMessage,
        cancel: &CancellationToken,
    ) -> Result<Message, StoreError> {
        ensure_active(cancel)?;
        let message = new_received_exception(name, group, raw, &self.options, Utc::now());
        self.insert_now(MessageTable::Received, message.clone())?;
        Ok(message)
    }

    async fn change_publish_state(
        &self,
        message: &Message,
        status: MessageStatus,
        tx: Option<&mut Self::Tx>,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        ensure_active(cancel)?;
        self.change_state(MessageTable::Published, message, status, tx)
    }

    async fn change_receive_state(
        &self,
        message: &Message,
        status: MessageStatus,
        tx: Option<&mut Self::Tx>,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        ensure_active(cancel)?;
        self.change_state(MessageTable::Received, message, status, tx)
    }

    async fn change_publish_state_to_delayed(
        &self,
        ids: &[MessageId],
        cancel: &CancellationToken,
    ) -> Result<usize, StoreError> {
        ensure_active(cancel)?;
        let mut rows = self.write(MessageTable::Published)?;
        let mut changed = 0;
        for id in ids {
            if let Some(row) = rows.get_mut(id) {
                row.status = MessageStatus::Delayed;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn delete_expires(
        &self,
        table: MessageTable,
        cutoff: DateTime<Utc>,
        batch_size: usize,
        cancel: &CancellationToken,
    ) -> Result<usize, StoreError> {
        ensure_active(cancel)?;
        let max = self.options.failed_retry_count;
        let mut rows = self.write(table)?;

        let doomed: Vec<MessageId> = rows
            .values()
            .filter(|m| is_expired(m, max, cutoff))
            .map(|m| m.id.clone())
            .take(batch_size)
            .collect();

        for id in &doomed {
            rows.remove(id);
        }
        Ok(doomed.len())
    }

    async fn get_published_messages_of_need_retry(
        &self,
        lookback: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>, StoreError> {
        ensure_active(cancel)?;
        self.retry_candidates(MessageTable::Published, lookback)
    }

    async fn get_received_messages_of_need_retry(
        &self,
        lookback: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>, StoreError> {
        ensure_active(cancel)?;
        self.retry_candidates(MessageTable::Received, lookback)
    }

    async fn schedule_messages_of_delayed(
        &self,
        handler: &dyn DelayedBatchHandler,
        cancel: &CancellationToken,
    ) -> Result<usize, StoreError> {
        ensure_active(cancel)?;
        let now = Utc::now();

        let batch: Vec<Message> = {
            let mut rows = self.write(MessageTable::Published)?;
            let mut claimed: Vec<&mut Message> =
                rows.values_mut().filter(|m| is_promotable(m, now)).collect();
            claimed.sort_by_key(|m| m.expires_at);
            claimed.truncate(self.options.delayed_batch_size);

            claimed
                .into_iter()
                .map(|m| {
                    let due = match (m.status, m.expires_at) {
                        (MessageStatus::Delayed, Some(due)) if due > now => due,
                        _ => now,
                    };
                    m.status = MessageStatus::Queued;
                    m.expires_at = Some(due);
                    m.clone()
                })
                .collect()
        };

        let count = batch.len();
        if count > 0 {
            handler.handle(batch, cancel).await?;
        }
        Ok(count)
    }

    async fn get_message(
        &self,
        table: MessageTable,
        id: &MessageId,
        cancel: &CancellationToken,
    ) -> Result<Option<Message>, StoreError> {
        ensure_active(cancel)?;
        let rows = self
            .table(table)
            .read()
            .map_err(|_| StoreError::storage(format!("{} lock poisoned", table.table_name())))?;
        Ok(rows.get(id).cloned())
    }

    async fn statistics(&self, cancel: &CancellationToken) -> Result<MessageStatistics, StoreError> {
        ensure_active(cancel)?;
        let mut stats = MessageStatistics::default();
        for (table, counts) in [
            (MessageTable::Published, &mut stats.published),
            (MessageTable::Received, &mut stats.received),
        ] {
            let mut c = StatusCounts::default();
            for m in self.read_all(table)? {
                c.add(m.status, 1);
            }
            *counts = c;
        }
        Ok(stats)
    }
}
