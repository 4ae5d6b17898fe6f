//! Durable message storage boundary.
//!
//! This module defines the store contract shared by the publisher, the
//! receive path and the background sweeps, plus an in-memory implementation
//! for tests/dev and a Postgres implementation for production.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

use chrono::{DateTime, Utc};

use courier_core::{MessageId, time};
use courier_messaging::{Content, Message, MessageStatus, Serializer, TransportMessage, headers};

use crate::config::CourierOptions;

pub use in_memory::{InMemoryMessageStore, InMemoryTransaction};
pub use postgres::PostgresMessageStore;
pub use r#trait::{
    DELAYED_LOOKAHEAD, DelayedBatchHandler, MessageStatistics, MessageStore, QUEUED_STALE_AFTER,
    RETRY_BATCH_LIMIT, StatusCounts, StoreError, ensure_active,
};

/// Build a fresh outbound row. The store assigns the id and stamps the id and
/// name headers unless the caller already set them.
pub(crate) fn new_published(
    name: &str,
    content: &Content,
    serializer: &dyn Serializer,
    now: DateTime<Utc>,
) -> Result<Message, StoreError> {
    let id = MessageId::generate();
    let mut content = content.clone();
    content
        .headers
        .entry(headers::MESSAGE_ID.to_string())
        .or_insert_with(|| id.to_string());
    content
        .headers
        .entry(headers::MESSAGE_NAME.to_string())
        .or_insert_with(|| name.to_string());

    let body = serializer.serialize(&content)?;
    Ok(Message {
        id,
        name: name.to_string(),
        group: None,
        content,
        body,
        created_at: now,
        expires_at: None,
        retry_count: 0,
        status: MessageStatus::Scheduled,
    })
}

/// Build a fresh inbound row for one group.
pub(crate) fn new_received(
    name: &str,
    group: &str,
    content: &Content,
    serializer: &dyn Serializer,
    now: DateTime<Utc>,
) -> Result<Message, StoreError> {
    let mut message = new_published(name, content, serializer, now)?;
    message.content.set_header(headers::GROUP, group);
    message.body = serializer.serialize(&message.content)?;
    message.group = Some(group.to_string());
    Ok(message)
}

/// Build the terminal `Failed` row for an inbound message that could not be
/// decoded. The raw body is kept verbatim.
pub(crate) fn new_received_exception(
    name: &str,
    group: &str,
    raw: &TransportMessage,
    options: &CourierOptions,
    now: DateTime<Utc>,
) -> Message {
    let mut content = Content::new(serde_json::Value::String(
        String::from_utf8_lossy(&raw.body).into_owned(),
    ));
    content.headers = raw.headers.clone();
    content.set_header(headers::GROUP, group);
    content
        .headers
        .entry(headers::MESSAGE_NAME.to_string())
        .or_insert_with(|| name.to_string());

    Message {
        id: MessageId::generate(),
        name: name.to_string(),
        group: Some(group.to_string()),
        content,
        body: raw.body.clone(),
        created_at: now,
        expires_at: Some(time::after(now, options.failed_message_expired_after)),
        retry_count: options.failed_retry_count,
        status: MessageStatus::Failed,
    }
}

/// Row image after a state change: status applied, content re-serialized.
pub(crate) fn with_status(
    message: &Message,
    status: MessageStatus,
    serializer: &dyn Serializer,
) -> Result<Message, StoreError> {
    let mut updated = message.clone();
    updated.status = status;
    updated.body = serializer.serialize(&updated.content)?;
    Ok(updated)
}

/// Whether a row is picked up by the delayed/stuck sweep at `now`.
pub(crate) fn is_promotable(message: &Message, now: DateTime<Utc>) -> bool {
    match (message.status, message.expires_at) {
        (MessageStatus::Delayed, Some(due)) => due <= time::after(now, DELAYED_LOOKAHEAD),
        (MessageStatus::Delayed, None) => true,
        (MessageStatus::Queued, Some(at)) => at < time::before(now, QUEUED_STALE_AFTER),
        _ => false,
    }
}

/// Whether `delete_expires` may remove a row: past its expiry and terminal.
/// A `Failed` row is terminal only once its retry budget is spent.
pub(crate) fn is_expired(message: &Message, max_retries: u32, cutoff: DateTime<Utc>) -> bool {
    let terminal = message.status.is_purgeable()
        && (message.status != MessageStatus::Failed || message.retry_count >= max_retries);
    terminal && message.expires_at.is_some_and(|at| at < cutoff)
}

/// Whether a row is handed back by the retry queries at `now`.
pub(crate) fn needs_retry(
    message: &Message,
    max_retries: u32,
    lookback: std::time::Duration,
    now: DateTime<Utc>,
) -> bool {
    message.status.is_retry_eligible()
        && message.retry_count < max_retries
        && message.created_at < time::before(now, lookback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_messaging::JsonSerializer;
    use proptest::prelude::*;
    use std::time::Duration;

    fn status_strategy() -> impl Strategy<Value = MessageStatus> {
        prop::sample::select(MessageStatus::ALL.to_vec())
    }

    fn row(status: MessageStatus, retry_count: u32, age: Duration, now: DateTime<Utc>) -> Message {
        let mut m = new_published("t", &Content::new(serde_json::json!(1)), &JsonSerializer, now)
            .unwrap();
        m.status = status;
        m.retry_count = retry_count;
        m.created_at = time::before(now, age);
        m
    }

    proptest! {
        #[test]
        fn retry_eligibility_matches_status_budget_and_age(
            status in status_strategy(),
            retry_count in 0u32..10,
            max in 1u32..10,
            age_secs in 0u64..600,
        ) {
            let now = Utc::now();
            let lookback = Duration::from_secs(240);
            let m = row(status, retry_count, Duration::from_secs(age_secs), now);

            let expected = matches!(status, MessageStatus::Scheduled | MessageStatus::Failed)
                && retry_count < max
                && age_secs > 240;
            prop_assert_eq!(needs_retry(&m, max, lookback, now), expected);
        }
    }

    #[test]
    fn failed_rows_with_budget_left_never_expire() {
        let now = Utc::now();
        let mut m = row(MessageStatus::Failed, 3, Duration::ZERO, now);
        m.expires_at = Some(time::before(now, Duration::from_secs(60)));

        assert!(!is_expired(&m, 5, now));
        m.retry_count = 5;
        assert!(is_expired(&m, 5, now));

        m.status = MessageStatus::Scheduled;
        assert!(!is_expired(&m, 5, now));
    }

    #[test]
    fn delayed_window_includes_near_due_and_excludes_far_future() {
        let now = Utc::now();
        let mut m = row(MessageStatus::Delayed, 0, Duration::ZERO, now);

        m.expires_at = Some(time::after(now, Duration::from_secs(90)));
        assert!(is_promotable(&m, now));

        m.expires_at = Some(time::after(now, Duration::from_secs(300)));
        assert!(!is_promotable(&m, now));
    }

    #[test]
    fn queued_is_promotable_only_when_stale() {
        let now = Utc::now();
        let mut m = row(MessageStatus::Queued, 0, Duration::ZERO, now);

        m.expires_at = Some(time::before(now, Duration::from_secs(30)));
        assert!(!is_promotable(&m, now));

        m.expires_at = Some(time::before(now, Duration::from_secs(90)));
        assert!(is_promotable(&m, now));
    }

    #[test]
    fn caller_supplied_id_header_is_kept() {
        let content = Content::new(serde_json::json!({})).with_header(headers::MESSAGE_ID, "ext-1");
        let m = new_published("t", &content, &JsonSerializer, Utc::now()).unwrap();

        assert_eq!(m.content.header(headers::MESSAGE_ID), Some("ext-1"));
        assert_ne!(m.id.as_str(), "ext-1");
    }

    #[test]
    fn exception_rows_are_terminal() {
        let options = CourierOptions::default();
        let raw = TransportMessage {
            topic: "orders.placed".into(),
            group: Some("billing.v1".into()),
            headers: Default::default(),
            body: b"\xff not json".to_vec(),
        };
        let m = new_received_exception("orders.placed", "billing.v1", &raw, &options, Utc::now());

        assert_eq!(m.status, MessageStatus::Failed);
        assert!(m.is_retry_exhausted(options.failed_retry_count));
        assert!(m.expires_at.is_some());
        assert_eq!(m.body, raw.body);
    }
}
