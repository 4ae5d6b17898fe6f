//! `courier-infra`: storage, delivery and background workers.
//!
//! The message store and job store each come in an in-memory flavour for
//! tests/dev and a Postgres flavour for production. Everything else in this
//! crate is written against the store traits.

pub mod bootstrap;
pub mod config;
pub mod jobs;
pub mod lease;
pub mod message_store;
pub mod outbox;
pub mod receiver;
pub mod schema;
pub mod sender;
pub mod workers;


pub use bootstrap::{Courier, CourierBuilder};
pub use config::CourierOptions;
pub use lease::LeaseLock;
pub use message_store::{InMemoryMessageStore, MessageStore, PostgresMessageStore, StoreError};
pub use outbox::{MessagePublisher, OutboxError, OutboxTransaction};
pub use receiver::{ReceiveExecutor, ReceiveReport};
pub use sender::{MessageSender, SendOutcome};
pub use workers::{PeriodicTask, WorkerError, WorkerHandle};
