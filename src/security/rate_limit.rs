//! Per-client token bucket rate limiting.
//!
//! Buckets live in a `DashMap` keyed by client; each bucket sits behind its own mutex
//! that is held for arithmetic only, so two requests contend only when they come from
//! the same client. Idle buckets are evicted by a periodic sweep.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::{RateLimitConfig, RouteRateLimit};
use crate::observability::metrics;

/// Bucket size and refill speed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketParams {
    pub capacity: f64,
    /// Tokens per second.
    pub refill_rate: f64,
}

impl BucketParams {
    pub fn per_minute(capacity: u32, refill_per_minute: u32) -> Self {
        Self {
            capacity: capacity as f64,
            refill_rate: refill_per_minute as f64 / 60.0,
        }
    }
}

impl From<RouteRateLimit> for BucketParams {
    fn from(limit: RouteRateLimit) -> Self {
        Self::per_minute(limit.capacity, limit.refill_per_minute)
    }
}

/// Admission decision for one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Admitted,
    Rejected { retry_after: Duration },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// A token bucket. `0 <= tokens <= capacity` holds after every operation.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    last_access: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
            last_access: now,
        }
    }

    fn try_acquire(&mut self, params: BucketParams, now: Instant) -> Admission {
        // A caller that read the clock before a concurrent caller may arrive late.
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * params.refill_rate).clamp(0.0, params.capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
        if now > self.last_access {
            self.last_access = now;
        }

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Admission::Admitted
        } else {
            let wait = (1.0 - self.tokens) / params.refill_rate;
            let secs = wait.ceil().max(1.0) as u64;
            Admission::Rejected {
                retry_after: Duration::from_secs(secs),
            }
        }
    }
}

/// Token bucket limiter keyed by client identifier.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<String, Mutex<TokenBucket>>,
    params: BucketParams,
    idle_timeout: Duration,
}

impl RateLimiter {
    pub fn new(params: BucketParams, idle_timeout: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            params,
            idle_timeout,
        }
    }

    /// Limiter with the global defaults.
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            BucketParams::per_minute(config.capacity, config.refill_per_minute),
            Duration::from_secs(config.idle_timeout_secs),
        )
    }

    /// Limiter for a route override, sharing the global idle policy.
    pub fn with_params(params: BucketParams, config: &RateLimitConfig) -> Self {
        Self::new(params, Duration::from_secs(config.idle_timeout_secs))
    }

    pub fn params(&self) -> BucketParams {
        self.params
    }

    /// Try to take one token for `key`.
    pub fn check(&self, key: &str) -> Admission {
        self.check_at(key, Instant::now())
    }

    /// Same as [`check`](Self::check) with an explicit clock reading.
    pub fn check_at(&self, key: &str, now: Instant) -> Admission {
        if let Some(bucket) = self.buckets.get(key) {
            let mut bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
            return bucket.try_acquire(self.params, now);
        }

        let bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(TokenBucket::new(self.params.capacity, now)));
        let mut bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
        bucket.try_acquire(self.params, now)
    }

    /// Number of tracked clients.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Evict buckets idle for longer than the idle timeout. Returns how many were removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        let idle_timeout = self.idle_timeout;
        self.buckets.retain(|_, bucket| {
            let bucket = bucket.get_mut().unwrap_or_else(PoisonError::into_inner);
            now.saturating_duration_since(bucket.last_access) < idle_timeout
        });
        before.saturating_sub(self.buckets.len())
    }
}

/// Periodically sweep every limiter until shutdown.
pub fn spawn_sweeper(
    limiters: Vec<Arc<RateLimiter>>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let mut evicted = 0;
                    let mut tracked = 0;
                    for limiter in &limiters {
                        evicted += limiter.sweep(now);
                        tracked += limiter.len();
                    }
                    metrics::record_bucket_count(tracked);
                    if evicted > 0 {
                        tracing::debug!(evicted, tracked, "Evicted idle rate limit buckets");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("Rate limit sweeper stopping");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(BucketParams::per_minute(120, 100), Duration::from_secs(600))
    }

    #[test]
    fn burst_of_150_admits_first_120() {
        let limiter = limiter();
        let start = Instant::now();
        let mut admitted = 0;
        let mut rejected = 0;
        for i in 0..150u64 {
            // all 150 within a few milliseconds
            match limiter.check_at("10.0.0.1", start + Duration::from_micros(i)) {
                Admission::Admitted => {
                    assert_eq!(rejected, 0, "no admission after the first rejection");
                    admitted += 1;
                }
                Admission::Rejected { retry_after } => {
                    assert!(retry_after >= Duration::from_secs(1));
                    rejected += 1;
                }
            }
        }
        assert_eq!(admitted, 120);
        assert_eq!(rejected, 30);
    }

    #[test]
    fn clients_have_independent_buckets() {
        let limiter = RateLimiter::new(BucketParams::per_minute(1, 60), Duration::from_secs(60));
        let now = Instant::now();
        assert!(limiter.check_at("a", now).is_admitted());
        assert!(!limiter.check_at("a", now).is_admitted());
        assert!(limiter.check_at("b", now).is_admitted());
    }

    #[test]
    fn refill_and_retry_after() {
        let limiter = RateLimiter::new(BucketParams::per_minute(2, 60), Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(limiter.check_at("c", t0).is_admitted());
        assert!(limiter.check_at("c", t0).is_admitted());
        assert_eq!(
            limiter.check_at("c", t0),
            Admission::Rejected { retry_after: Duration::from_secs(1) }
        );
        assert!(limiter.check_at("c", t0 + Duration::from_millis(1000)).is_admitted());

        // long idle refills only up to capacity
        let later = t0 + Duration::from_secs(3600);
        assert!(limiter.check_at("c", later).is_admitted());
        assert!(limiter.check_at("c", later).is_admitted());
        assert!(!limiter.check_at("c", later).is_admitted());
    }

    #[test]
    fn admitted_never_exceeds_window_bound() {
        let params = BucketParams::per_minute(120, 100);
        let limiter = RateLimiter::new(params, Duration::from_secs(600));
        let start = Instant::now();
        let mut admitted_at = Vec::new();

        // one request every 50ms for 3 minutes
        for i in 0..3600u64 {
            let t = start + Duration::from_millis(i * 50);
            if limiter.check_at("client", t).is_admitted() {
                admitted_at.push(t);
            }
        }

        for window_secs in [1u64, 10, 30, 60, 120] {
            let window = Duration::from_secs(window_secs);
            let bound = params.capacity + window_secs as f64 * params.refill_rate;
            for (i, &from) in admitted_at.iter().enumerate() {
                let count = admitted_at[i..].iter().take_while(|&&t| t - from <= window).count();
                assert!(count as f64 <= bound, "window {window_secs}s admitted {count} > {bound}");
            }
        }
    }

    #[test]
    fn late_clock_reading_never_overfills() {
        let limiter = RateLimiter::new(BucketParams::per_minute(1, 60), Duration::from_secs(60));
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(5);
        assert!(limiter.check_at("k", t1).is_admitted());
        // a request that read the clock earlier arrives after
        assert!(!limiter.check_at("k", t0).is_admitted());
    }

    #[test]
    fn sweep_evicts_idle_buckets() {
        let limiter = RateLimiter::new(BucketParams::per_minute(10, 60), Duration::from_secs(30));
        let t0 = Instant::now();
        limiter.check_at("old", t0);
        limiter.check_at("fresh", t0 + Duration::from_secs(25));

        assert_eq!(limiter.sweep(t0 + Duration::from_secs(40)), 1);
        assert_eq!(limiter.len(), 1);
        // an evicted client starts again with a full bucket
        for _ in 0..10 {
            assert!(limiter.check_at("old", t0 + Duration::from_secs(41)).is_admitted());
        }
    }

    #[test]
    fn concurrent_clients_never_share_tokens() {
        let limiter = Arc::new(RateLimiter::new(
            BucketParams::per_minute(50, 1),
            Duration::from_secs(60),
        ));
        let now = Instant::now();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..20).filter(|_| limiter.check_at("same", now).is_admitted()).count()
                })
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }
}
