//! Transport boundary.
//!
//! Concrete brokers live outside this workspace. The engine only needs to hand
//! a message over and learn whether the hand-off succeeded; the result drives
//! the next state transition of the stored row.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::Headers;

/// Wire shape exchanged with a transport, in both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    pub topic: String,
    pub group: Option<String>,
    pub headers: Headers,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The broker could not be reached.
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// The broker refused the message.
    #[error("transport rejected message: {0}")]
    Rejected(String),
}

/// Outbound side of a broker connection.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: TransportMessage) -> Result<(), TransportError>;
}

#[async_trait]
impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    async fn send(&self, message: TransportMessage) -> Result<(), TransportError> {
        (**self).send(message).await
    }
}
