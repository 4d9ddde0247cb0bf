//! Per-instance locking
//!
//! Every lifecycle operation on a service instance holds a lock keyed by the
//! instance id for its whole duration, so that at most one mutating operation
//! per instance is in flight across all broker processes.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::MemoryLockService;
#[cfg(feature = "postgres")]
pub use postgres::PostgresLockService;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::settings::LockSettings;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock {key} is held by another owner")]
    Collision { key: String },
    #[error("lock service unavailable: {0}")]
    Unavailable(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// External lock service holding named, owner-scoped, expiring locks
#[async_trait]
pub trait LockService: Send + Sync {
    /// Take or refresh the lock `key` for `owner`.
    ///
    /// Succeeds if the key is free, expired, or already held by `owner`;
    /// fails with `LockError::Collision` if another owner holds it.
    async fn lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<(), LockError>;

    /// Release `key` if it is held by `owner`
    async fn release(&self, key: &str, owner: &str) -> Result<(), LockError>;
}

/// A lock held on one service instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceLock {
    pub instance_id: String,
    pub key: String,
    pub owner: String,
    pub ttl: Duration,
}

pub fn lock_key(instance_id: &str) -> String {
    format!("broker/{}", instance_id)
}

/// Acquires and releases instance locks with bounded retries
#[derive(Clone)]
pub struct InstanceLocker {
    service: Arc<dyn LockService>,
    ttl: Duration,
    max_attempts: u32,
    retry_interval: Duration,
}

impl InstanceLocker {
    pub fn new(service: Arc<dyn LockService>, settings: &LockSettings) -> Self {
        Self {
            service,
            ttl: settings.ttl(),
            max_attempts: settings.max_attempts.max(1),
            retry_interval: settings.retry_interval(),
        }
    }

    /// Acquire the lock for `instance_id`.
    ///
    /// Each attempt uses a fresh owner token, so a retry can never collide with
    /// an abandoned earlier attempt of the same operation. Returns the last
    /// error once all attempts are exhausted.
    pub async fn acquire(&self, instance_id: &str) -> Result<ServiceLock, LockError> {
        let key = lock_key(instance_id);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let owner = format!("broker/{}", Uuid::new_v4());

            match self.service.lock(&key, &owner, self.ttl).await {
                Ok(()) => {
                    debug!("Obtained lock '{}' as '{}' (attempt {})", key, owner, attempt);
                    return Ok(ServiceLock {
                        instance_id: instance_id.to_string(),
                        key,
                        owner,
                        ttl: self.ttl,
                    });
                }
                Err(e) if attempt >= self.max_attempts => {
                    error!(
                        "Failed to obtain lock '{}' after {} attempts: {}",
                        key, attempt, e
                    );
                    return Err(e);
                }
                Err(e) => {
                    debug!(
                        "Lock '{}' not obtained (attempt {}/{}): {}",
                        key, attempt, self.max_attempts, e
                    );
                    sleep(self.retry_interval).await;
                }
            }
        }
    }

    /// Release a lock. Failures are logged only; the lock TTL bounds a leaked lock.
    pub async fn release(&self, lock: &ServiceLock) {
        match self.service.release(&lock.key, &lock.owner).await {
            Ok(()) => debug!("Released lock '{}'", lock.key),
            Err(e) => warn!(
                "Failed to release lock '{}' held by '{}': {}",
                lock.key, lock.owner, e
            ),
        }
    }
}
