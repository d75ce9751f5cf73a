//! Redis-backed lease guard.
//!
//! Acquire is a single `SET key 1 NX EX ttl`, so check and set cannot race
//! between workers. Release is a plain `DEL`.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::instrument;

use herald_core::JobId;

use super::{DedupeError, DedupeGuard, lease_key};

#[derive(Clone)]
pub struct RedisDedupeGuard {
    conn: MultiplexedConnection,
    ttl_secs: u64,
}

impl std::fmt::Debug for RedisDedupeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisDedupeGuard")
            .field("ttl_secs", &self.ttl_secs)
            .finish_non_exhaustive()
    }
}

impl RedisDedupeGuard {
    /// Open a multiplexed connection to `redis_url`.
    pub async fn connect(redis_url: impl AsRef<str>, ttl: Duration) -> Result<Self, DedupeError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| DedupeError::Unavailable(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| DedupeError::Unavailable(e.to_string()))?;
        Ok(Self {
            conn,
            ttl_secs: ttl.as_secs().max(1),
        })
    }

    /// Round-trip check used at startup.
    pub async fn ping(&self) -> Result<(), DedupeError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| DedupeError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl DedupeGuard for RedisDedupeGuard {
    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn acquire(&self, id: &JobId) -> Result<bool, DedupeError> {
        let mut conn = self.conn.clone();
        // Reply is "OK" when set, nil when the key already exists.
        let reply: Option<String> = redis::cmd("SET")
            .arg(lease_key(id))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(|e| DedupeError::Command(e.to_string()))?;
        Ok(reply.is_some())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn release(&self, id: &JobId) -> Result<(), DedupeError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(lease_key(id))
            .query_async(&mut conn)
            .await
            .map_err(|e| DedupeError::Command(e.to_string()))?;
        Ok(())
    }
}
