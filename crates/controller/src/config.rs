use std::time::Duration;

use recon_queue::{BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Used as the queue name and the event reporter.
    pub name: String,
    /// `None` waits for the caches until stopped.
    pub sync_timeout: Option<Duration>,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Overall enqueue rate; non-positive disables the bucket.
    pub qps: f64,
    pub burst: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: "recon-controller".to_string(),
            sync_timeout: Some(Duration::from_secs(60)),
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            qps: 10.0,
            burst: 100,
        }
    }
}

impl ControllerConfig {
    /// Per-key exponential backoff combined with the overall bucket; the
    /// larger delay wins.
    pub fn rate_limiter(&self) -> MaxOfRateLimiter {
        MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialFailureRateLimiter::new(self.base_delay, self.max_delay)),
            Box::new(BucketRateLimiter::new(self.qps, self.burst)),
        ])
    }
}
