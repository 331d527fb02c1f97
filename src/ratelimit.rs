//! C1 — RateLimiter.
//!
//! A classic token bucket keyed by an arbitrary string (client IP or agent
//! address), with periodic eviction of buckets nobody has touched in a
//! while. Time is read from [`tokio::time::Instant`], which is monotonic, so
//! a wall-clock jump backwards can never hand out extra tokens.

use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// A single named rate limiter instance (e.g. "tunnel-connect", "request").
pub struct RateLimiter {
    name: &'static str,
    capacity: f64,
    window: Duration,
    rate_per_ms: f64,
    buckets: DashMap<String, Mutex<Bucket>>,
}

impl RateLimiter {
    pub fn new(name: &'static str, capacity: u32, window: Duration) -> Self {
        let capacity = capacity as f64;
        Self {
            name,
            capacity,
            window,
            rate_per_ms: capacity / window.as_millis().max(1) as f64,
            buckets: DashMap::new(),
        }
    }

    /// Returns true and (if true) consumes one token for `key`.
    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();

        if let Some(entry) = self.buckets.get(key) {
            let mut bucket = entry.lock().expect("bucket mutex poisoned");
            self.refill(&mut bucket, now);
            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                return true;
            }
            return false;
        }

        // Fresh bucket: starts at capacity - 1 and the first call always succeeds.
        self.buckets.insert(
            key.to_string(),
            Mutex::new(Bucket {
                tokens: self.capacity - 1.0,
                last_refill: now,
            }),
        );
        true
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed_ms = now.saturating_duration_since(bucket.last_refill).as_millis() as f64;
        if elapsed_ms > 0.0 {
            bucket.tokens = (bucket.tokens + elapsed_ms * self.rate_per_ms).min(self.capacity);
            bucket.last_refill = now;
        }
    }

    /// Evicts buckets that have sat untouched longer than twice the window.
    /// Intended to be driven by a periodic maintenance task.
    pub fn evict_stale(&self) {
        let now = Instant::now();
        let stale_after = self.window * 2;
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            let bucket = bucket.lock().expect("bucket mutex poisoned");
            now.saturating_duration_since(bucket.last_refill) < stale_after
        });
        let removed = before - self.buckets.len();
        if removed > 0 {
            tracing::debug!(limiter = self.name, removed, "evicted stale rate-limit buckets");
        }
    }
}

/// Spawns the periodic maintenance loop for `limiter`, evicting stale
/// buckets every `interval`. Runs until the process exits.
pub fn spawn_eviction_task(
    limiter: std::sync::Arc<RateLimiter>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            limiter.evict_stale();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn allows_exactly_capacity_within_window() {
        let limiter = RateLimiter::new("test", 5, Duration::from_secs(60));
        for _ in 0..5 {
            assert!(limiter.allow("k"));
        }
        assert!(!limiter.allow("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn refills_after_window_elapses() {
        let limiter = RateLimiter::new("test", 2, Duration::from_secs(60));
        assert!(limiter.allow("k"));
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(limiter.allow("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let limiter = RateLimiter::new("test", 1, Duration::from_secs(60));
        assert!(limiter.allow("a"));
        assert!(limiter.allow("b"));
        assert!(!limiter.allow("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn evicts_only_stale_buckets() {
        let limiter = RateLimiter::new("test", 1, Duration::from_millis(100));
        limiter.allow("stale");
        tokio::time::advance(Duration::from_millis(250)).await;
        limiter.allow("fresh");
        limiter.evict_stale();
        assert!(limiter.buckets.contains_key("fresh"));
        assert!(!limiter.buckets.contains_key("stale"));
    }
}
