//! Requeue delay policies for the work queue

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Decides how long a key waits before it is requeued
pub trait RateLimiter<K>: Send + Sync {
    /// Delay for the next requeue of `key`; records the attempt
    fn when(&self, key: &K) -> Duration;

    /// Drop any failure history for `key`
    fn forget(&self, key: &K);

    fn num_requeues(&self, key: &K) -> u32;
}

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`
pub struct ExponentialBackoff<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K> ExponentialBackoff<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone + Send> RateLimiter<K> for ExponentialBackoff<K> {
    fn when(&self, key: &K) -> Duration {
        let mut failures = self.failures.lock();
        let count = failures.entry(key.clone()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);

        // 2^31 times any sane base is past every cap
        if exp >= 31 {
            return self.max;
        }
        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.max, |d| d.min(self.max))
    }

    fn forget(&self, key: &K) {
        self.failures.lock().remove(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Longest delay the bucket hands out, however slow its rate
pub const MAX_BUCKET_DELAY: Duration = Duration::from_secs(3600);

/// Overall token bucket shared by all keys
pub struct TokenBucket {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl TokenBucket {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: qps.max(f64::MIN_POSITIVE),
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }
}

impl<K> RateLimiter<K> for TokenBucket {
    /// Reserve one token; the delay is how long until it is actually
    /// available
    fn when(&self, _key: &K) -> Duration {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-bucket.tokens / self.qps)
                .map_or(MAX_BUCKET_DELAY, |d| d.min(MAX_BUCKET_DELAY))
        }
    }

    fn forget(&self, _key: &K) {}

    fn num_requeues(&self, _key: &K) -> u32 {
        0
    }
}

/// Consults every limiter and waits for the slowest
pub struct MaxOf<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOf<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOf<K> {
    fn when(&self, key: &K) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(key))
            .max()
            .unwrap_or_default()
    }

    fn forget(&self, key: &K) {
        for limiter in &self.limiters {
            limiter.forget(key);
        }
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(key))
            .max()
            .unwrap_or(0)
    }
}

/// Controller default: per-key backoff combined with an overall bucket
pub fn controller_rate_limiter<K>(
    base: Duration,
    max: Duration,
    qps: f64,
    burst: u32,
) -> MaxOf<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    MaxOf::new(vec![
        Box::new(ExponentialBackoff::new(base, max)),
        Box::new(TokenBucket::new(qps, burst)),
    ])
}
