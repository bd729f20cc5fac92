use std::time::Duration;

use recon_core::Key;
use rustc_hash::FxHashMap;
use tokio::time::Instant;

/// Decides how long a key waits before it is re-queued.
///
/// Limiters live inside the queue's lock, so they take `&mut self` and the
/// current time instead of synchronising on their own.
pub trait RateLimiter: Send {
    /// Delay for this attempt. Counts as one more requeue of `key`.
    fn when(&mut self, key: &Key, now: Instant) -> Duration;
    /// Stop tracking `key`; its next attempt starts from scratch.
    fn forget(&mut self, key: &Key);
    fn num_requeues(&self, key: &Key) -> u32;
}

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug)]
pub struct ItemExponentialFailureRateLimiter {
    base: Duration,
    max: Duration,
    failures: FxHashMap<Key, u32>,
}

impl ItemExponentialFailureRateLimiter {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base), failures: FxHashMap::default() }
    }
}

impl RateLimiter for ItemExponentialFailureRateLimiter {
    fn when(&mut self, key: &Key, _now: Instant) -> Duration {
        let failures = self.failures.entry(key.clone()).or_insert(0);
        let exp = *failures;
        *failures = failures.saturating_add(1);

        match 2u32.checked_pow(exp).and_then(|m| self.base.checked_mul(m)) {
            Some(backoff) if backoff < self.max => backoff,
            _ => self.max,
        }
    }

    fn forget(&mut self, key: &Key) {
        self.failures.remove(key);
    }

    fn num_requeues(&self, key: &Key) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }
}

/// Global token bucket shared by all keys. Every call reserves a token; when
/// the bucket is empty the returned delay is the time until that token exists.
#[derive(Debug)]
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    tokens: f64,
    last: Option<Instant>,
}

impl BucketRateLimiter {
    /// A non-positive `qps` disables limiting.
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self { qps, burst, tokens: burst, last: None }
    }
}

impl RateLimiter for BucketRateLimiter {
    fn when(&mut self, _key: &Key, now: Instant) -> Duration {
        if !(self.qps > 0.0) || !self.qps.is_finite() {
            return Duration::ZERO;
        }
        if let Some(last) = self.last {
            let elapsed = now.saturating_duration_since(last).as_secs_f64();
            self.tokens = (self.tokens + elapsed * self.qps).min(self.burst);
        }
        self.last = Some(now);
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.qps)
        }
    }

    fn forget(&mut self, _key: &Key) {}

    fn num_requeues(&self, _key: &Key) -> u32 {
        0
    }
}

/// Worst case of several limiters.
pub struct MaxOfRateLimiter {
    limiters: Vec<Box<dyn RateLimiter>>,
}

impl MaxOfRateLimiter {
    pub fn new(limiters: Vec<Box<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }
}

impl RateLimiter for MaxOfRateLimiter {
    fn when(&mut self, key: &Key, now: Instant) -> Duration {
        self.limiters.iter_mut().map(|l| l.when(key, now)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&mut self, key: &Key) {
        for l in self.limiters.iter_mut() {
            l.forget(key);
        }
    }

    fn num_requeues(&self, key: &Key) -> u32 {
        self.limiters.iter().map(|l| l.num_requeues(key)).max().unwrap_or(0)
    }
}

/// Per-key backoff from 5ms to 1000s, combined with an overall 10 qps / 100
/// burst bucket.
pub fn default_controller_rate_limiter() -> MaxOfRateLimiter {
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1000))),
        Box::new(BucketRateLimiter::new(10.0, 100)),
    ])
}
