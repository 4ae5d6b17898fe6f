//! `courier-core`: shared building blocks for the outbox and scheduler crates.
//!
//! This crate contains identifiers, the configuration-level error model and a
//! couple of time helpers. It has no IO and no async.

pub mod error;
pub mod id;
pub mod time;

pub use error::{CoreError, CoreResult};
pub use id::{ExecutionId, JobId, MessageId};
