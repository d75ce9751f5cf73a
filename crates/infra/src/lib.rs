//! Infrastructure layer: job store, rate limiting, retries, dedupe leases,
//! publisher registry and the dispatch loop that ties them together.

pub mod config;
pub mod dedupe;
pub mod dispatch;
pub mod publisher;
pub mod rate_limit;
pub mod retry;
pub mod store;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, WorkerConfig};
pub use dedupe::{DedupeError, DedupeGuard, InMemoryDedupeGuard};
pub use dispatch::{DispatchConfig, DispatchError, DispatchSummary, Dispatcher};
pub use publisher::{DryRunPublisher, Publisher, PublisherEntry, PublisherRegistry, PublisherWithId};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use retry::{RetryEngine, RetryError, RetryPolicy};
pub use store::{InMemoryJobStore, JobStore, PostgresJobStore, StatusUpdate, StoreError};

#[cfg(feature = "redis")]
pub use dedupe::RedisDedupeGuard;
