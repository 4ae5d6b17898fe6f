//! `courier-messaging`: message model and the consumer side of the engine.
//!
//! Storage lives in `courier-infra`; this crate only describes what a message is,
//! how it crosses the transport/serializer boundaries, and how inbound messages
//! reach registered consumers.

pub mod consumer;
pub mod dispatcher;
pub mod in_memory_transport;
pub mod message;
pub mod registry;
pub mod selector;
pub mod serializer;
pub mod transport;

pub use consumer::{Consumer, ConsumerContext, ConsumerError, Handles, MessageContract};
pub use dispatcher::{DispatchError, Dispatcher};
pub use in_memory_transport::{InMemoryTransport, TransportSubscription};
pub use message::{Content, Headers, Message, MessageStatus, MessageTable, headers};
pub use registry::{ConsumerRegistration, ConsumerRegistry, ConsumerResolver};
pub use selector::{
    ConsumerDescriptor, ConsumerServiceSelector, DefaultConsumerSelector,
    DuplicateConsumerPolicy, SelectorError, SelectorOptions,
};
pub use serializer::{JsonSerializer, Serializer, SerializerError};
pub use transport::{Transport, TransportError, TransportMessage};
