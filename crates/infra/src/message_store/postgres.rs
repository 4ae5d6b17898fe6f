//! Postgres-backed message store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | Database (any code) | `Storage` (code and operation in the message) |
//! | PoolClosed | `Storage` |
//! | RowNotFound | `NotFound` |
//! | Other | `Storage` |
//!
//! ## Concurrency
//!
//! State changes are single-row conditional updates. The delayed sweep claims
//! rows with `FOR UPDATE SKIP LOCKED` and flips them to `queued` in the same
//! statement, so two instances never hand out the same row.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio_util::sync::CancellationToken;
use tracing::{Span, instrument};

use courier_core::{MessageId, time};
use courier_messaging::{
    Content, JsonSerializer, Message, MessageStatus, MessageTable, Serializer, TransportMessage,
};

use super::r#trait::{
    DELAYED_LOOKAHEAD, DelayedBatchHandler, MessageStatistics, MessageStore, QUEUED_STALE_AFTER,
    RETRY_BATCH_LIMIT, StoreError, ensure_active,
};
use super::{new_published, new_received, new_received_exception, with_status};
use crate::config::CourierOptions;
use crate::lease::LeaseLock;

const COLUMNS: &str =
    "id, name, group_name, content, body, created_at, expires_at, retry_count, status";

/// Postgres-backed message store and lease lock.
#[derive(Clone)]
pub struct PostgresMessageStore {
    pool: Arc<PgPool>,
    options: CourierOptions,
    serializer: Arc<dyn Serializer>,
}

impl PostgresMessageStore {
    pub fn new(pool: PgPool, options: CourierOptions) -> Self {
        Self::with_serializer(pool, options, Arc::new(JsonSerializer))
    }

    pub fn with_serializer(pool: PgPool, options: CourierOptions, serializer: Arc<dyn Serializer>) -> Self {
        Self {
            pool: Arc::new(pool),
            options,
            serializer,
        }
    }

    /// Create the schema if it does not exist yet.
    pub async fn initialize(&self) -> Result<(), StoreError> {
        crate::schema::initialize(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("initialize", e))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn update_row<'e, E>(exec: E, table: MessageTable, m: &Message) -> Result<(), StoreError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let sql = format!(
            "UPDATE {} SET status = $2, expires_at = $3, retry_count = $4, content = $5, body = $6 WHERE id = $1",
            table.table_name()
        );
        let result = sqlx::query(&sql)
            .bind(m.id.as_str())
            .bind(m.status.as_str())
            .bind(m.expires_at)
            .bind(sql_retries(m.retry_count))
            .bind(content_json(&m.content)?)
            .bind(&m.body)
            .execute(exec)
            .await
            .map_err(|e| map_sqlx_error("update_state", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(m.id.to_string()));
        }
        Ok(())
    }

    async fn change_state(
        &self,
        table: MessageTable,
        message: &Message,
        status: MessageStatus,
        tx: Option<&mut Transaction<'static, Postgres>>,
    ) -> Result<(), StoreError> {
        let updated = with_status(message, status, self.serializer.as_ref())?;
        match tx {
            Some(tx) => Self::update_row(&mut **tx, table, &updated).await,
            None => Self::update_row(&*self.pool, table, &updated).await,
        }
    }

    async fn retry_candidates(&self, table: MessageTable, lookback: Duration) -> Result<Vec<Message>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {} \
             WHERE retry_count < $1 AND created_at < $2 AND status IN ('scheduled', 'failed') \
             ORDER BY created_at ASC LIMIT $3",
            table.table_name()
        );
        let rows = sqlx::query(&sql)
            .bind(sql_retries(self.options.failed_retry_count))
            .bind(time::before(Utc::now(), lookback))
            .bind(sql_limit(RETRY_BATCH_LIMIT))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("retry_candidates", e))?;

        let messages = rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()?;
        Span::current().record("count", messages.len());
        Ok(messages)
    }
}

impl core::fmt::Debug for PostgresMessageStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PostgresMessageStore").finish_non_exhaustive()
    }
}

async fn insert_row<'e, E>(exec: E, table: MessageTable, m: &Message) -> Result<(), StoreError>
where
    E: sqlx::PgExecutor<'e>,
{
    let sql = format!(
        "INSERT INTO {} ({COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        table.table_name()
    );
    sqlx::query(&sql)
        .bind(m.id.as_str())
        .bind(&m.name)
        .bind(m.group.as_deref())
        .bind(content_json(&m.content)?)
        .bind(&m.body)
        .bind(m.created_at)
        .bind(m.expires_at)
        .bind(sql_retries(m.retry_count))
        .bind(m.status.as_str())
        .execute(exec)
        .await
        .map_err(|e| map_sqlx_error("insert_message", e))?;
    Ok(())
}

#[async_trait]
impl LeaseLock for PostgresMessageStore {
    #[instrument(skip(self, cancel), err)]
    async fn acquire_lock(
        &self,
        key: &str,
        ttl: Duration,
        owner: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, StoreError> {
        ensure_active(cancel)?;
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO leases (key, owner, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE
                SET owner = EXCLUDED.owner, expires_at = EXCLUDED.expires_at
                WHERE leases.expires_at <= $4 OR leases.owner = EXCLUDED.owner
            "#,
        )
        .bind(key)
        .bind(owner)
        .bind(time::after(now, ttl))
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("acquire_lock", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, cancel), err)]
    async fn renew_lock(
        &self,
        key: &str,
        ttl: Duration,
        owner: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, StoreError> {
        ensure_active(cancel)?;
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE leases SET expires_at = $3 WHERE key = $1 AND owner = $2 AND expires_at > $4",
        )
        .bind(key)
        .bind(owner)
        .bind(time::after(now, ttl))
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("renew_lock", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, cancel), err)]
    async fn release_lock(
        &self,
        key: &str,
        owner: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, StoreError> {
        ensure_active(cancel)?;
        let result = sqlx::query("DELETE FROM leases WHERE key = $1 AND owner = $2")
            .bind(key)
            .bind(owner)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("release_lock", e))?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl MessageStore for PostgresMessageStore {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self, cancel: &CancellationToken) -> Result<Self::Tx, StoreError> {
        ensure_active(cancel)?;
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError> {
        tx.commit()
            .await
            .map_err(|e| StoreError::Transaction(format!("commit failed: {e}")))
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError> {
        tx.rollback()
            .await
            .map_err(|e| StoreError::Transaction(format!("rollback failed: {e}")))
    }

    #[instrument(skip(self, content, tx, cancel), fields(transactional = tx.is_some()), err)]
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
            Some(tx) => insert_row(&mut **tx, MessageTable::Published, &message).await?,
            None => insert_row(&*self.pool, MessageTable::Published, &message).await?,
        }
        Ok(message)
    }

    #[instrument(skip(self, content, cancel), err)]
    async fn store_received_message(
        &self,
        name: &str,
        group: &str,
        content: &Content,
        cancel: &CancellationToken,
    ) -> Result<Message, StoreError> {
        ensure_active(cancel)?;
        let message = new_received(name, group, content, self.serializer.as_ref(), Utc::now())?;
        insert_row(&*self.pool, MessageTable::Received, &message).await?;
        Ok(message)
    }

    #[instrument(skip(self, raw, cancel), err)]
    async fn store_received_exception_message(
        &self,
        name: &str,
        group: &str,
        raw: &TransportMessage,
        cancel: &CancellationToken,
    ) -> Result<Message, StoreError> {
        ensure_active(cancel)?;
        let message = new_received_exception(name, group, raw, &self.options, Utc::now());
        insert_row(&*self.pool, MessageTable::Received, &message).await?;
        Ok(message)
    }

    #[instrument(skip(self, message, tx, cancel), fields(id = %message.id), err)]
    async fn change_publish_state(
        &self,
        message: &Message,
        status: MessageStatus,
        tx: Option<&mut Self::Tx>,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        ensure_active(cancel)?;
        self.change_state(MessageTable::Published, message, status, tx).await
    }

    #[instrument(skip(self, message, tx, cancel), fields(id = %message.id), err)]
    async fn change_receive_state(
        &self,
        message: &Message,
        status: MessageStatus,
        tx: Option<&mut Self::Tx>,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        ensure_active(cancel)?;
        self.change_state(MessageTable::Received, message, status, tx).await
    }

    #[instrument(skip(self, ids, cancel), fields(count = ids.len()), err)]
    async fn change_publish_state_to_delayed(
        &self,
        ids: &[MessageId],
        cancel: &CancellationToken,
    ) -> Result<usize, StoreError> {
        ensure_active(cancel)?;
        let ids: Vec<String> = ids.iter().map(|id| id.as_str().to_string()).collect();
        let result = sqlx::query("UPDATE published_messages SET status = 'delayed' WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("change_publish_state_to_delayed", e))?;
        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }

    #[instrument(skip(self, cancel), fields(table = table.table_name()), err)]
    async fn delete_expires(
        &self,
        table: MessageTable,
        cutoff: DateTime<Utc>,
        batch_size: usize,
        cancel: &CancellationToken,
    ) -> Result<usize, StoreError> {
        ensure_active(cancel)?;
        let sql = delete_expires_sql(table);
        let result = sqlx::query(&sql)
            .bind(cutoff)
            .bind(sql_limit(batch_size))
            .bind(sql_retries(self.options.failed_retry_count))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_expires", e))?;
        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }

    #[instrument(skip(self, cancel), fields(count = tracing::field::Empty), err)]
    async fn get_published_messages_of_need_retry(
        &self,
        lookback: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>, StoreError> {
        ensure_active(cancel)?;
        self.retry_candidates(MessageTable::Published, lookback).await
    }

    #[instrument(skip(self, cancel), fields(count = tracing::field::Empty), err)]
    async fn get_received_messages_of_need_retry(
        &self,
        lookback: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>, StoreError> {
        ensure_active(cancel)?;
        self.retry_candidates(MessageTable::Received, lookback).await
    }

    #[instrument(skip(self, handler, cancel), fields(count = tracing::field::Empty), err)]
    async fn schedule_messages_of_delayed(
        &self,
        handler: &dyn DelayedBatchHandler,
        cancel: &CancellationToken,
    ) -> Result<usize, StoreError> {
        ensure_active(cancel)?;
        let now = Utc::now();
        let sql = format!(
            r#"
            WITH due AS (
                SELECT id FROM published_messages
                WHERE (status = 'delayed' AND (expires_at IS NULL OR expires_at <= $1))
                   OR (status = 'queued' AND expires_at < $2)
                ORDER BY expires_at ASC NULLS FIRST
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE published_messages p
            SET status = 'queued',
                expires_at = CASE
                    WHEN p.status = 'delayed' AND p.expires_at > $4 THEN p.expires_at
                    ELSE $4
                END
            FROM due
            WHERE p.id = due.id
            RETURNING {}
            "#,
            prefixed_columns("p")
        );

        let rows = sqlx::query(&sql)
            .bind(time::after(now, DELAYED_LOOKAHEAD))
            .bind(time::before(now, QUEUED_STALE_AFTER))
            .bind(sql_limit(self.options.delayed_batch_size))
            .bind(now)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("schedule_messages_of_delayed", e))?;

        let mut batch = rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()?;
        batch.sort_by_key(|m| m.expires_at);

        let count = batch.len();
        Span::current().record("count", count);
        if count > 0 {
            handler.handle(batch, cancel).await?;
        }
        Ok(count)
    }

    #[instrument(skip(self, cancel), fields(table = table.table_name(), id = %id), err)]
    async fn get_message(
        &self,
        table: MessageTable,
        id: &MessageId,
        cancel: &CancellationToken,
    ) -> Result<Option<Message>, StoreError> {
        ensure_active(cancel)?;
        let sql = format!("SELECT {COLUMNS} FROM {} WHERE id = $1", table.table_name());
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_message", e))?;
        row.as_ref().map(decode_row).transpose()
    }

    #[instrument(skip(self, cancel), err)]
    async fn statistics(&self, cancel: &CancellationToken) -> Result<MessageStatistics, StoreError> {
        ensure_active(cancel)?;
        let mut stats = MessageStatistics::default();

        for table in [MessageTable::Published, MessageTable::Received] {
            let sql = format!(
                "SELECT status, COUNT(*) AS n FROM {} GROUP BY status",
                table.table_name()
            );
            let rows = sqlx::query(&sql)
                .fetch_all(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("statistics", e))?;

            let counts = match table {
                MessageTable::Published => &mut stats.published,
                MessageTable::Received => &mut stats.received,
            };
            for row in rows {
                let status: String = row.try_get("status").map_err(|e| map_sqlx_error("statistics", e))?;
                let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("statistics", e))?;
                let status: MessageStatus = status
                    .parse()
                    .map_err(|e| StoreError::storage(format!("bad status in {}: {e}", table.table_name())))?;
                counts.add(status, u64::try_from(n).unwrap_or(0));
            }
        }
        Ok(stats)
    }
}

/// `$1` cutoff, `$2` batch size, `$3` retry budget.
fn delete_expires_sql(table: MessageTable) -> String {
    let name = table.table_name();
    format!(
        "DELETE FROM {name} WHERE id IN (\
            SELECT id FROM {name} \
            WHERE expires_at < $1 \
              AND (status = 'succeeded' OR (status = 'failed' AND retry_count >= $3)) \
            LIMIT $2)"
    )
}

fn sql_limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn sql_retries(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn prefixed_columns(alias: &str) -> String {
    COLUMNS
        .split(", ")
        .map(|c| format!("{alias}.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn content_json(content: &Content) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(content).map_err(|e| StoreError::storage(format!("content encoding failed: {e}")))
}

fn decode_row(row: &PgRow) -> Result<Message, StoreError> {
    let get = |e: sqlx::Error| map_sqlx_error("decode_row", e);

    let id: String = row.try_get("id").map_err(get)?;
    let status: String = row.try_get("status").map_err(get)?;
    let content: serde_json::Value = row.try_get("content").map_err(get)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(get)?;

    Ok(Message {
        id: MessageId::parse(id).map_err(|e| StoreError::storage(e.to_string()))?,
        name: row.try_get("name").map_err(get)?,
        group: row.try_get("group_name").map_err(get)?,
        content: serde_json::from_value(content)
            .map_err(|e| StoreError::storage(format!("content decoding failed: {e}")))?,
        body: row.try_get("body").map_err(get)?,
        created_at: row.try_get("created_at").map_err(get)?,
        expires_at: row.try_get("expires_at").map_err(get)?,
        retry_count: u32::try_from(retry_count).unwrap_or(0),
        status: status.parse().map_err(|e| StoreError::storage(format!("{e}")))?,
    })
}

/// Map SQLx errors to StoreError.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            StoreError::Storage(format!(
                "database error in {operation} ({code}): {}",
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => StoreError::Storage(format!("connection pool closed in {operation}")),
        sqlx::Error::RowNotFound => StoreError::NotFound(format!("row not found in {operation}")),
        other => StoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_columns_alias_every_column() {
        let cols = prefixed_columns("p");
        assert!(cols.starts_with("p.id, p.name"));
        assert_eq!(cols.matches("p.").count(), COLUMNS.split(", ").count());
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        assert!(matches!(
            map_sqlx_error("get_message", sqlx::Error::RowNotFound),
            StoreError::NotFound(_)
        ));
        assert!(matches!(
            map_sqlx_error("get_message", sqlx::Error::PoolClosed),
            StoreError::Storage(msg) if msg.contains("get_message")
        ));
    }

    #[test]
    fn purge_only_takes_failed_rows_with_spent_budget() {
        let sql = delete_expires_sql(MessageTable::Published);
        assert!(sql.contains("status = 'failed' AND retry_count >= $3"));
        assert!(!sql.contains("status IN ('succeeded', 'failed')"));
    }

    #[test]
    fn bind_values_saturate_instead_of_wrapping() {
        assert_eq!(sql_retries(u32::MAX), i32::MAX);
        assert_eq!(sql_retries(50), 50);
        assert_eq!(sql_limit(1000), 1000);
        assert_eq!(sql_limit(usize::MAX), i64::MAX);
    }
}
