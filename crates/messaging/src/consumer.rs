//! Consumer abstraction.
//!
//! Consumers are registered statically (see [`crate::registry`]) instead of being
//! discovered at runtime. A consumer may handle several message types; each
//! (consumer, message type) pair is its own registration.
//!
//! Delivery is at-least-once, so consumers must be idempotent: handling the same
//! message twice must produce the same result (or be a no-op).

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use courier_core::MessageId;

use crate::message::Content;

/// Error returned by consumer code. Consumers fail for arbitrary reasons, so
/// this is deliberately untyped.
pub type ConsumerError = anyhow::Error;

/// Everything a consumer gets to see about one inbound message.
#[derive(Debug, Clone)]
pub struct ConsumerContext {
    pub message_id: Option<MessageId>,
    pub topic: String,
    /// When set, only consumers of this group are invoked.
    pub group: Option<String>,
    pub content: Content,
}

impl ConsumerContext {
    pub fn new(topic: impl Into<String>, content: Content) -> Self {
        Self {
            message_id: None,
            topic: topic.into(),
            group: None,
            content,
        }
    }

    pub fn with_message_id(mut self, id: MessageId) -> Self {
        self.message_id = Some(id);
        self
    }

    pub fn for_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

/// Object-safe consumer invoked by the dispatcher.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn consume(
        &self,
        context: &ConsumerContext,
        cancel: &CancellationToken,
    ) -> Result<(), ConsumerError>;
}

/// A message type that can be routed by name.
///
/// `NAME` is the default topic for the type unless a topic mapping overrides it.
pub trait MessageContract: DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;
}

/// Typed handler for one message contract.
#[async_trait]
pub trait Handles<M: MessageContract>: Send + Sync + 'static {
    async fn handle(
        &self,
        message: M,
        context: &ConsumerContext,
        cancel: &CancellationToken,
    ) -> Result<(), ConsumerError>;
}

/// Adapts a typed handler into an object-safe [`Consumer`] by decoding the
/// content value into `M` first.
pub(crate) struct TypedConsumer<C, M> {
    inner: Arc<C>,
    _message: PhantomData<fn() -> M>,
}

impl<C, M> TypedConsumer<C, M> {
    pub(crate) fn new(inner: Arc<C>) -> Self {
        Self {
            inner,
            _message: PhantomData,
        }
    }
}

#[async_trait]
impl<C, M> Consumer for TypedConsumer<C, M>
where
    C: Handles<M>,
    M: MessageContract,
{
    async fn consume(
        &self,
        context: &ConsumerContext,
        cancel: &CancellationToken,
    ) -> Result<(), ConsumerError> {
        let message: M = serde_json::from_value(context.content.value.clone()).map_err(|e| {
            anyhow::anyhow!("payload on '{}' is not a valid {}: {e}", context.topic, M::NAME)
        })?;
        self.inner.handle(message, context, cancel).await
    }
}
