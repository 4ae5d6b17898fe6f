//! Logging setup shared by processes embedding courier.
//!
//! The library crates only emit `tracing` events; nothing installs a
//! subscriber for them. The embedding binary calls [`init`] (or
//! [`tracing::init`] with an explicit [`LogConfig`]) once at startup, before
//! the workers are started:
//!
//! ```
//! courier_observability::init();
//! ::tracing::info!("service starting");
//! ```

/// Tracing subscriber configuration.
pub mod tracing;

pub use crate::tracing::{LogConfig, LogFormat};

/// Initialize process-wide logging from the environment.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init(&LogConfig::from_env());
}
