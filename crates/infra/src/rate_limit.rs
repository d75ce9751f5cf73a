//! Per-destination rate limiting.
//!
//! Each configured destination owns a bucket of `capacity` tokens; every other
//! destination shares one default bucket. Buckets are topped back up to full
//! (not incremented) at fixed window boundaries, so at most `capacity` takes
//! complete for a destination inside any one window.
//!
//! Refill is lazy: the first caller to observe a passed boundary resets the
//! bucket. Waiters sleep until the next boundary instead of polling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use herald_core::Destination;

/// Capacity used for destinations without an explicit entry.
pub const DEFAULT_BUCKET_CAPACITY: u32 = 2;

/// Default refill window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

const MIN_WINDOW: Duration = Duration::from_millis(1);

/// Longest accepted window; larger values are clamped to it.
pub const MAX_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Rate limiter configuration, read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Tokens per window for each named destination.
    pub capacities: HashMap<Destination, u32>,
    /// Tokens per window shared by all unnamed destinations.
    pub default_capacity: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut capacities = HashMap::new();
        capacities.insert(Destination::new(Destination::LINKEDIN), 1);
        capacities.insert(Destination::new(Destination::INSTAGRAM), 1);
        Self {
            capacities,
            default_capacity: DEFAULT_BUCKET_CAPACITY,
            window: DEFAULT_WINDOW,
        }
    }
}

impl RateLimitConfig {
    pub fn with_capacity(mut self, destination: impl Into<Destination>, capacity: u32) -> Self {
        self.capacities.insert(destination.into(), capacity);
        self
    }

    pub fn with_default_capacity(mut self, capacity: u32) -> Self {
        self.default_capacity = capacity;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Effective capacity for a destination.
    pub fn capacity_for(&self, destination: &Destination) -> u32 {
        self.capacities
            .get(destination)
            .copied()
            .unwrap_or(self.default_capacity)
    }
}

#[derive(Debug)]
struct Bucket {
    capacity: u32,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    next_refill: Instant,
}

impl Bucket {
    fn new(capacity: u32, window: Duration, now: Instant) -> Self {
        // A zero-capacity bucket would block forever.
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                next_refill: now + window,
            }),
        }
    }

    /// Take a token if one is available, otherwise return the instant of the
    /// next refill.
    fn try_take(&self, window: Duration, now: Instant) -> Result<(), Instant> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if now >= state.next_refill {
            state.tokens = self.capacity;
            state.next_refill = next_boundary(state.next_refill, now, window);
        }

        if state.tokens > 0 {
            state.tokens -= 1;
            Ok(())
        } else {
            Err(state.next_refill)
        }
    }
}

/// First boundary strictly after `now`, keeping boundaries aligned to the
/// limiter's first window.
fn next_boundary(boundary: Instant, now: Instant, window: Duration) -> Instant {
    let behind = now.saturating_duration_since(boundary).as_nanos();
    let periods = behind / window.as_nanos() + 1;
    let periods = u32::try_from(periods).unwrap_or(u32::MAX);
    boundary + window.saturating_mul(periods)
}

/// Process-local, per-destination rate limiter.
///
/// Cheap to share behind an `Arc`; buckets for different destinations never
/// contend with each other.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    buckets: HashMap<Destination, Arc<Bucket>>,
    default_bucket: Arc<Bucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let window = config.window.clamp(MIN_WINDOW, MAX_WINDOW);
        let now = Instant::now();
        let buckets = config
            .capacities
            .iter()
            .map(|(destination, capacity)| {
                (destination.clone(), Arc::new(Bucket::new(*capacity, window, now)))
            })
            .collect();

        Self {
            window,
            buckets,
            default_bucket: Arc::new(Bucket::new(config.default_capacity, window, now)),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn bucket_for(&self, destination: &Destination) -> &Bucket {
        self.buckets
            .get(destination)
            .unwrap_or(&self.default_bucket)
    }

    /// Wait until a token for `destination` is available and consume it.
    pub async fn take(&self, destination: &Destination) {
        let bucket = self.bucket_for(destination);
        loop {
            match bucket.try_take(self.window, Instant::now()) {
                Ok(()) => return,
                Err(refill_at) => {
                    debug!(%destination, "rate limit reached, waiting for refill");
                    tokio::time::sleep_until(refill_at).await;
                }
            }
        }
    }

    /// Non-blocking variant of [`RateLimiter::take`].
    pub fn try_take(&self, destination: &Destination) -> bool {
        self.bucket_for(destination)
            .try_take(self.window, Instant::now())
            .is_ok()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
