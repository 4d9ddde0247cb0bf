use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use super::{LockError, LockService};

struct Holder {
    owner: String,
    expires_at: Instant,
}

/// In-process lock service.
///
/// Only serializes operations within a single broker process; use
/// `PostgresLockService` when several brokers share the same instances.
#[derive(Default)]
pub struct MemoryLockService {
    locks: Mutex<HashMap<String, Holder>>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<(), LockError> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        if let Some(holder) = locks.get(key) {
            if holder.owner != owner && holder.expires_at > now {
                return Err(LockError::Collision {
                    key: key.to_string(),
                });
            }
        }

        locks.insert(
            key.to_string(),
            Holder {
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn release(&self, key: &str, owner: &str) -> Result<(), LockError> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(key).is_some_and(|holder| holder.owner == owner) {
            locks.remove(key);
        }
        Ok(())
    }
}
