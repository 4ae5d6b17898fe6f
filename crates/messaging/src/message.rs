//! Persisted message model and its status state machine.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use courier_core::{CoreError, MessageId};

use crate::transport::TransportMessage;

/// Well-known header names stamped on every stored message.
pub mod headers {
    pub const MESSAGE_ID: &str = "courier-msg-id";
    pub const MESSAGE_NAME: &str = "courier-msg-name";
    pub const GROUP: &str = "courier-msg-group";
    pub const SENT_TIME: &str = "courier-sent-time";
    pub const DELAY_TIME: &str = "courier-delay-time";
    pub const EXCEPTION: &str = "courier-exception";
}

/// Message headers. Ordered so serialized content is stable.
pub type Headers = BTreeMap<String, String>;

/// Delivery status of a stored message.
///
/// ```text
/// Scheduled ──► Queued ──► Succeeded
///     │           ▲  │
///     ▼           │  └──► Failed ──► (retry) Queued
///  Delayed ───────┘
/// ```
///
/// `Failed` becomes terminal once the retry budget is exhausted.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Persisted, awaiting the first delivery attempt.
    Scheduled,
    /// Future-dated; `expires_at` holds the due time.
    Delayed,
    /// Handed to the transport; `expires_at` holds the hand-off time.
    Queued,
    /// Delivered (terminal).
    Succeeded,
    /// Last attempt failed.
    Failed,
}

impl MessageStatus {
    pub const ALL: [MessageStatus; 5] = [
        MessageStatus::Scheduled,
        MessageStatus::Delayed,
        MessageStatus::Queued,
        MessageStatus::Succeeded,
        MessageStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Scheduled => "scheduled",
            MessageStatus::Delayed => "delayed",
            MessageStatus::Queued => "queued",
            MessageStatus::Succeeded => "succeeded",
            MessageStatus::Failed => "failed",
        }
    }

    /// Only `Scheduled` and `Failed` messages are picked up by the retry sweep.
    pub fn is_retry_eligible(&self) -> bool {
        matches!(self, MessageStatus::Scheduled | MessageStatus::Failed)
    }

    /// Statuses whose rows may be purged once `expires_at` passes.
    pub fn is_purgeable(&self) -> bool {
        matches!(self, MessageStatus::Succeeded | MessageStatus::Failed)
    }
}

impl core::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CoreError::validation(format!("unknown message status: {s}")))
    }
}

/// The two logical message tables.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageTable {
    /// Outbound messages.
    Published,
    /// Inbound messages.
    Received,
}

impl MessageTable {
    pub fn table_name(&self) -> &'static str {
        match self {
            MessageTable::Published => "published_messages",
            MessageTable::Received => "received_messages",
        }
    }
}

/// Headers plus the original typed value of a message.
///
/// `value` is what in-process consumers see; the serialized form lives in
/// [`Message::body`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub headers: Headers,
    pub value: JsonValue,
}

impl Content {
    pub fn new(value: JsonValue) -> Self {
        Self {
            headers: Headers::new(),
            value,
        }
    }

    /// Build content from any serializable value.
    pub fn from_typed<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_value(value)?))
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }
}

/// A persisted message (outbound rows have no group; inbound rows do).
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    /// Topic / routing key.
    pub name: String,
    /// Consumer group (inbound only).
    pub group: Option<String>,
    pub content: Content,
    /// Serialized `content`.
    pub body: Vec<u8>,
    pub created_at: DateTime<Utc>,
    /// Purge time for terminal rows, due time for `Delayed`, hand-off time for `Queued`.
    pub expires_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub status: MessageStatus,
}

impl Message {
    /// Whether the retry budget is used up.
    pub fn is_retry_exhausted(&self, max_retries: u32) -> bool {
        self.retry_count >= max_retries
    }

    /// Shape handed to the transport.
    pub fn to_transport(&self) -> TransportMessage {
        TransportMessage {
            topic: self.name.clone(),
            group: self.group.clone(),
            headers: self.content.headers.clone(),
            body: self.body.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("Failed".parse::<MessageStatus>().unwrap(), MessageStatus::Failed);
        assert_eq!("queued".parse::<MessageStatus>().unwrap(), MessageStatus::Queued);
        assert!("processing".parse::<MessageStatus>().is_err());
    }

    #[test]
    fn only_scheduled_and_failed_are_retry_eligible() {
        let eligible: Vec<_> = MessageStatus::ALL
            .into_iter()
            .filter(MessageStatus::is_retry_eligible)
            .collect();
        assert_eq!(eligible, vec![MessageStatus::Scheduled, MessageStatus::Failed]);
    }

    #[test]
    fn content_headers_are_settable() {
        let content = Content::new(serde_json::json!({"order": 1}))
            .with_header(headers::MESSAGE_NAME, "orders.placed");
        assert_eq!(content.header(headers::MESSAGE_NAME), Some("orders.placed"));
        assert_eq!(content.header(headers::GROUP), None);
    }
}
