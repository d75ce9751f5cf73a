//! Best-effort processing leases keyed by job id.
//!
//! The store claim already guarantees single ownership; a lease only guards
//! against paths that bypass the claim. Leases expire on their own, so a
//! failed release costs promptness, never correctness.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryDedupeGuard;
#[cfg(feature = "redis")]
pub use self::redis::RedisDedupeGuard;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use herald_core::JobId;

/// Key prefix shared with every other process that touches the cache.
pub const LEASE_PREFIX: &str = "poster:processing:";

pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(15 * 60);

/// Cache key for a job's lease.
pub fn lease_key(id: &JobId) -> String {
    format!("{LEASE_PREFIX}{id}")
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DedupeError {
    #[error("dedupe cache unavailable: {0}")]
    Unavailable(String),
    #[error("dedupe cache command failed: {0}")]
    Command(String),
}

/// Check-and-set lease on a job id.
#[async_trait]
pub trait DedupeGuard: Send + Sync {
    /// Try to take the lease. `Ok(false)` means someone else holds it.
    async fn acquire(&self, id: &JobId) -> Result<bool, DedupeError>;

    /// Drop the lease early.
    async fn release(&self, id: &JobId) -> Result<(), DedupeError>;
}

#[async_trait]
impl<G> DedupeGuard for Arc<G>
where
    G: DedupeGuard + ?Sized,
{
    async fn acquire(&self, id: &JobId) -> Result<bool, DedupeError> {
        (**self).acquire(id).await
    }

    async fn release(&self, id: &JobId) -> Result<(), DedupeError> {
        (**self).release(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_format() {
        assert_eq!(lease_key(&JobId::new("abc-1")), "poster:processing:abc-1");
    }
}
