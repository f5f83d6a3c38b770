//! Per-tenant token-bucket rate limiting.

use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tracedb_time::{Time, TimeProvider};

/// A family of token buckets, one per tenant, refilled against the
/// injected clock so tests can drive time explicitly.
#[derive(Debug)]
pub struct RateLimiter {
    time_provider: Arc<dyn TimeProvider>,
    buckets: Mutex<HashMap<String, Bucket>>,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Time,
}

impl RateLimiter {
    /// Create an empty limiter.
    pub fn new(time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            time_provider,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `tenant` may spend `n` bytes given `rate` bytes/sec and
    /// `burst` capacity. Spends the tokens when allowed.
    pub fn allow_n(&self, tenant: &str, n: u64, rate: f64, burst: f64) -> bool {
        let now = self.time_provider.now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(tenant.to_string()).or_insert(Bucket {
            tokens: burst,
            last_refill: now,
        });

        let elapsed = now
            .checked_duration_since(bucket.last_refill)
            .unwrap_or_default();
        bucket.tokens = burst.min(bucket.tokens + elapsed.as_secs_f64() * rate);
        bucket.last_refill = now;

        let cost = n as f64;
        // requests larger than the burst can never pass; deny without
        // draining the bucket
        if cost > burst {
            return false;
        }
        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            true
        } else {
            false
        }
    }
}
