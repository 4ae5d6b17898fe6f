//! TTL-bound distributed leases.
//!
//! A lease is held by one owner until it is released or its TTL lapses. Sweeps
//! that must run on a single instance at a time acquire a lease first; an
//! instance that dies while holding one simply lets it expire.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use courier_core::time;

use crate::message_store::{StoreError, ensure_active};

/// Well-known lease keys, one per cluster-wide sweep.
pub mod keys {
    pub const PUBLISHED_RETRY: &str = "courier.retry.published";
    pub const RECEIVED_RETRY: &str = "courier.retry.received";
    pub const DELAYED_PROMOTION: &str = "courier.delayed";
    pub const EXPIRY_COLLECTOR: &str = "courier.collector";
}

/// Lease operations. Contention is reported as `Ok(false)`, never as an error.
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Take `key` for `ttl` if it is free, expired, or already ours.
    async fn acquire_lock(
        &self,
        key: &str,
        ttl: Duration,
        owner: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, StoreError>;

    /// Extend a live lease held by `owner`.
    async fn renew_lock(
        &self,
        key: &str,
        ttl: Duration,
        owner: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, StoreError>;

    /// Give up a lease held by `owner`.
    async fn release_lock(
        &self,
        key: &str,
        owner: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
impl<L> LeaseLock for Arc<L>
where
    L: LeaseLock + ?Sized,
{
    async fn acquire_lock(
        &self,
        key: &str,
        ttl: Duration,
        owner: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, StoreError> {
        (**self).acquire_lock(key, ttl, owner, cancel).await
    }

    async fn renew_lock(
        &self,
        key: &str,
        ttl: Duration,
        owner: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, StoreError> {
        (**self).renew_lock(key, ttl, owner, cancel).await
    }

    async fn release_lock(
        &self,
        key: &str,
        owner: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, StoreError> {
        (**self).release_lock(key, owner, cancel).await
    }
}

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    expires_at: DateTime<Utc>,
}

/// Process-local lease table.
#[derive(Debug, Default)]
pub struct InMemoryLeaseLock {
    leases: RwLock<HashMap<String, Lease>>,
}

impl InMemoryLeaseLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of `key`, if the lease is live.
    pub fn holder(&self, key: &str) -> Option<String> {
        let now = Utc::now();
        self.leases
            .read()
            .ok()?
            .get(key)
            .filter(|l| l.expires_at > now)
            .map(|l| l.owner.clone())
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Lease>>, StoreError> {
        self.leases
            .write()
            .map_err(|_| StoreError::storage("lease table lock poisoned"))
    }
}

#[async_trait]
impl LeaseLock for InMemoryLeaseLock {
    async fn acquire_lock(
        &self,
        key: &str,
        ttl: Duration,
        owner: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, StoreError> {
        ensure_active(cancel)?;
        let now = Utc::now();
        let mut leases = self.write()?;

        let free = match leases.get(key) {
            None => true,
            Some(l) => l.expires_at <= now || l.owner == owner,
        };
        if free {
            leases.insert(
                key.to_string(),
                Lease {
                    owner: owner.to_string(),
                    expires_at: time::after(now, ttl),
                },
            );
        }
        Ok(free)
    }

    async fn renew_lock(
        &self,
        key: &str,
        ttl: Duration,
        owner: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, StoreError> {
        ensure_active(cancel)?;
        let now = Utc::now();
        let mut leases = self.write()?;

        match leases.get_mut(key) {
            Some(l) if l.owner == owner && l.expires_at > now => {
                l.expires_at = time::after(now, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(
        &self,
        key: &str,
        owner: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, StoreError> {
        ensure_active(cancel)?;
        let mut leases = self.write()?;

        match leases.get(key) {
            Some(l) if l.owner == owner => {
                leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
