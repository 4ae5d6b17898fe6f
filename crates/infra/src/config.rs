//! Engine configuration.
//!
//! Defaults are production-sane; `from_env()` overlays `COURIER_*` variables
//! on top of them. Durations are read from the environment as whole seconds.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use courier_core::CoreError;
use courier_messaging::SelectorOptions;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierOptions {
    /// Maximum delivery attempts before a failed message becomes terminal.
    pub failed_retry_count: u32,
    /// Reaper poll period.
    pub failed_retry_interval: Duration,
    /// Only messages older than this are considered by the reaper, so in-flight
    /// first attempts are not raced.
    pub fallback_window: Duration,
    pub succeeded_message_expired_after: Duration,
    pub failed_message_expired_after: Duration,
    pub collector_cleaning_interval: Duration,
    pub expired_delete_batch_size: usize,
    pub delayed_batch_size: usize,
    pub delayed_poll_interval: Duration,
    pub lease_ttl: Duration,
    /// Guard cluster-wide sweeps with the storage lease lock.
    pub use_storage_lock: bool,
    pub scheduler_batch_size: usize,
    pub scheduler_poll_interval: Duration,
    pub stale_job_threshold: Duration,
    pub execution_retention: Duration,
    /// A due job this late counts as misfired.
    pub misfire_threshold: Duration,
    pub default_group: String,
    pub version: String,
    /// Lease owner / job lock holder name of this process.
    pub instance_id: String,
    pub database_url: Option<String>,
}

impl Default for CourierOptions {
    fn default() -> Self {
        Self {
            failed_retry_count: 50,
            failed_retry_interval: Duration::from_secs(60),
            fallback_window: Duration::from_secs(4 * 60),
            succeeded_message_expired_after: Duration::from_secs(24 * 3600),
            failed_message_expired_after: Duration::from_secs(15 * 24 * 3600),
            collector_cleaning_interval: Duration::from_secs(300),
            expired_delete_batch_size: 1000,
            delayed_batch_size: 1000,
            delayed_poll_interval: Duration::from_secs(60),
            lease_ttl: Duration::from_secs(5 * 60),
            use_storage_lock: false,
            scheduler_batch_size: 100,
            scheduler_poll_interval: Duration::from_secs(1),
            stale_job_threshold: Duration::from_secs(5 * 60),
            execution_retention: Duration::from_secs(7 * 24 * 3600),
            misfire_threshold: Duration::from_secs(60),
            default_group: "default".to_string(),
            version: "v1".to_string(),
            instance_id: format!("courier-{}", uuid::Uuid::now_v7()),
            database_url: None,
        }
    }
}

impl CourierOptions {
    pub fn with_failed_retry_count(mut self, count: u32) -> Self {
        self.failed_retry_count = count;
        self
    }

    pub fn with_failed_retry_interval(mut self, interval: Duration) -> Self {
        self.failed_retry_interval = interval;
        self
    }

    pub fn with_fallback_window(mut self, window: Duration) -> Self {
        self.fallback_window = window;
        self
    }

    pub fn with_succeeded_expiry(mut self, after: Duration) -> Self {
        self.succeeded_message_expired_after = after;
        self
    }

    pub fn with_failed_expiry(mut self, after: Duration) -> Self {
        self.failed_message_expired_after = after;
        self
    }

    pub fn with_collector_interval(mut self, interval: Duration) -> Self {
        self.collector_cleaning_interval = interval;
        self
    }

    pub fn with_expired_delete_batch_size(mut self, size: usize) -> Self {
        self.expired_delete_batch_size = size;
        self
    }

    pub fn with_delayed_batch_size(mut self, size: usize) -> Self {
        self.delayed_batch_size = size;
        self
    }

    pub fn with_delayed_poll_interval(mut self, interval: Duration) -> Self {
        self.delayed_poll_interval = interval;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_storage_lock(mut self, enabled: bool) -> Self {
        self.use_storage_lock = enabled;
        self
    }

    pub fn with_scheduler_batch_size(mut self, size: usize) -> Self {
        self.scheduler_batch_size = size;
        self
    }

    pub fn with_scheduler_poll_interval(mut self, interval: Duration) -> Self {
        self.scheduler_poll_interval = interval;
        self
    }

    pub fn with_stale_job_threshold(mut self, threshold: Duration) -> Self {
        self.stale_job_threshold = threshold;
        self
    }

    pub fn with_execution_retention(mut self, retention: Duration) -> Self {
        self.execution_retention = retention;
        self
    }

    pub fn with_misfire_threshold(mut self, threshold: Duration) -> Self {
        self.misfire_threshold = threshold;
        self
    }

    pub fn with_default_group(mut self, group: impl Into<String>) -> Self {
        self.default_group = group.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = id.into();
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Defaults overlaid with `COURIER_*` environment variables and `DATABASE_URL`.
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`CourierOptions::from_env`] over an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut o = Self::default();

        if let Some(v) = parse(&lookup, "COURIER_FAILED_RETRY_COUNT")? {
            o.failed_retry_count = v;
        }
        if let Some(v) = secs(&lookup, "COURIER_FAILED_RETRY_INTERVAL_SECS")? {
            o.failed_retry_interval = v;
        }
        if let Some(v) = secs(&lookup, "COURIER_FALLBACK_WINDOW_SECS")? {
            o.fallback_window = v;
        }
        if let Some(v) = secs(&lookup, "COURIER_SUCCEEDED_EXPIRED_AFTER_SECS")? {
            o.succeeded_message_expired_after = v;
        }
        if let Some(v) = secs(&lookup, "COURIER_FAILED_EXPIRED_AFTER_SECS")? {
            o.failed_message_expired_after = v;
        }
        if let Some(v) = secs(&lookup, "COURIER_COLLECTOR_INTERVAL_SECS")? {
            o.collector_cleaning_interval = v;
        }
        if let Some(v) = parse(&lookup, "COURIER_EXPIRED_DELETE_BATCH_SIZE")? {
            o.expired_delete_batch_size = v;
        }
        if let Some(v) = parse(&lookup, "COURIER_DELAYED_BATCH_SIZE")? {
            o.delayed_batch_size = v;
        }
        if let Some(v) = secs(&lookup, "COURIER_DELAYED_POLL_INTERVAL_SECS")? {
            o.delayed_poll_interval = v;
        }
        if let Some(v) = secs(&lookup, "COURIER_LEASE_TTL_SECS")? {
            o.lease_ttl = v;
        }
        if let Some(v) = parse(&lookup, "COURIER_USE_STORAGE_LOCK")? {
            o.use_storage_lock = v;
        }
        if let Some(v) = parse(&lookup, "COURIER_SCHEDULER_BATCH_SIZE")? {
            o.scheduler_batch_size = v;
        }
        if let Some(v) = secs(&lookup, "COURIER_SCHEDULER_POLL_INTERVAL_SECS")? {
            o.scheduler_poll_interval = v;
        }
        if let Some(v) = secs(&lookup, "COURIER_STALE_JOB_THRESHOLD_SECS")? {
            o.stale_job_threshold = v;
        }
        if let Some(v) = secs(&lookup, "COURIER_EXECUTION_RETENTION_SECS")? {
            o.execution_retention = v;
        }
        if let Some(v) = secs(&lookup, "COURIER_MISFIRE_THRESHOLD_SECS")? {
            o.misfire_threshold = v;
        }
        if let Some(v) = lookup("COURIER_DEFAULT_GROUP") {
            o.default_group = v;
        }
        if let Some(v) = lookup("COURIER_VERSION") {
            o.version = v;
        }
        if let Some(v) = lookup("COURIER_INSTANCE_ID") {
            o.instance_id = v;
        }
        if let Some(v) = lookup("DATABASE_URL") {
            o.database_url = Some(v);
        }

        o.validate()?;
        Ok(o)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.failed_retry_count == 0 {
            return Err(CoreError::configuration("failed_retry_count must be > 0"));
        }

        let sizes = [
            ("expired_delete_batch_size", self.expired_delete_batch_size),
            ("delayed_batch_size", self.delayed_batch_size),
            ("scheduler_batch_size", self.scheduler_batch_size),
        ];
        for (name, size) in sizes {
            if size == 0 {
                return Err(CoreError::configuration(format!("{name} must be > 0")));
            }
        }

        let durations = [
            ("failed_retry_interval", self.failed_retry_interval),
            ("collector_cleaning_interval", self.collector_cleaning_interval),
            ("delayed_poll_interval", self.delayed_poll_interval),
            ("lease_ttl", self.lease_ttl),
            ("scheduler_poll_interval", self.scheduler_poll_interval),
            ("stale_job_threshold", self.stale_job_threshold),
        ];
        for (name, d) in durations {
            if d.is_zero() {
                return Err(CoreError::configuration(format!("{name} must be non-zero")));
            }
        }

        if self.instance_id.trim().is_empty() {
            return Err(CoreError::configuration("instance_id cannot be empty"));
        }
        Ok(())
    }

    /// Routing options derived from the group/version settings.
    pub fn selector_options(&self) -> SelectorOptions {
        SelectorOptions::default()
            .with_default_group(self.default_group.clone())
            .with_version(self.version.clone())
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, CoreError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| CoreError::configuration(format!("{key}: {e}"))),
    }
}

fn secs<F>(lookup: &F, key: &str) -> Result<Option<Duration>, CoreError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse::<u64, F>(lookup, key)?.map(Duration::from_secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let o = CourierOptions::default();
        o.validate().unwrap();
        assert_eq!(o.failed_retry_count, 50);
        assert_eq!(o.fallback_window, Duration::from_secs(240));
        assert!(o.instance_id.starts_with("courier-"));
    }

    #[test]
    fn env_overrides_defaults() {
        let o = CourierOptions::from_lookup(lookup(&[
            ("COURIER_FAILED_RETRY_COUNT", "3"),
            ("COURIER_LEASE_TTL_SECS", "30"),
            ("COURIER_USE_STORAGE_LOCK", "true"),
            ("COURIER_DEFAULT_GROUP", "billing"),
            ("DATABASE_URL", "postgres://localhost/courier"),
        ]))
        .unwrap();

        assert_eq!(o.failed_retry_count, 3);
        assert_eq!(o.lease_ttl, Duration::from_secs(30));
        assert!(o.use_storage_lock);
        assert_eq!(o.default_group, "billing");
        assert_eq!(o.database_url.as_deref(), Some("postgres://localhost/courier"));
    }

    #[test]
    fn malformed_values_are_configuration_errors() {
        let err = CourierOptions::from_lookup(lookup(&[("COURIER_DELAYED_BATCH_SIZE", "lots")]))
            .unwrap_err();
        assert!(matches!(err, CoreError::Configuration(msg) if msg.contains("COURIER_DELAYED_BATCH_SIZE")));
    }

    #[test]
    fn zero_values_are_rejected() {
        assert!(CourierOptions::default().with_failed_retry_count(0).validate().is_err());
        assert!(CourierOptions::default().with_delayed_batch_size(0).validate().is_err());
        assert!(CourierOptions::default().with_lease_ttl(Duration::ZERO).validate().is_err());
    }
}
