//! Process-local lease map (tests/dev, or a single worker without Redis).

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use herald_core::JobId;

use super::{DEFAULT_LEASE_TTL, DedupeError, DedupeGuard, lease_key};

#[derive(Debug)]
pub struct InMemoryDedupeGuard {
    ttl: Duration,
    leases: Mutex<HashMap<String, Instant>>,
}

impl Default for InMemoryDedupeGuard {
    fn default() -> Self {
        Self::new(DEFAULT_LEASE_TTL)
    }
}

impl InMemoryDedupeGuard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            leases: Mutex::new(HashMap::new()),
        }
    }

    /// Whether an unexpired lease exists for `id`.
    pub fn is_held(&self, id: &JobId) -> bool {
        let leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        leases
            .get(&lease_key(id))
            .is_some_and(|expires_at| *expires_at > Instant::now())
    }
}

#[async_trait]
impl DedupeGuard for InMemoryDedupeGuard {
    async fn acquire(&self, id: &JobId) -> Result<bool, DedupeError> {
        let now = Instant::now();
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        leases.retain(|_, expires_at| *expires_at > now);

        let key = lease_key(id);
        if leases.contains_key(&key) {
            return Ok(false);
        }
        leases.insert(key, now + self.ttl);
        Ok(true)
    }

    async fn release(&self, id: &JobId) -> Result<(), DedupeError> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        leases.remove(&lease_key(id));
        Ok(())
    }
}
