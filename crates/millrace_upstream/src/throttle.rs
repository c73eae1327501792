//! Per-environment token-bucket rate limiter.
//!
//! One bucket per environment: capacity = `api_throttle_burst_size`, refill
//! = `api_throttle_requests_per_second`. Every upstream call acquires one
//! token before issuing. Waiters queue on a fair async mutex held across
//! the refill sleep, so admission is FIFO and no caller is starved.
//! Dropping the acquire future abandons the wait cleanly.
//!
//! Target property: over any 1-second window the number of acquired tokens
//! never exceeds refill_rate + burst_size.

use millrace_protocol::{defaults, EnvId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct BucketConfig {
    rate_per_sec: f64,
    burst: u32,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            rate_per_sec: defaults::DEFAULT_THROTTLE_RPS,
            burst: defaults::DEFAULT_THROTTLE_BURST,
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

struct Bucket {
    config: StdMutex<BucketConfig>,
    // Fair mutex: waiters are admitted in arrival order
    gate: AsyncMutex<BucketState>,
}

impl Bucket {
    fn new(config: BucketConfig) -> Self {
        Self {
            config: StdMutex::new(config),
            gate: AsyncMutex::new(BucketState {
                tokens: config.burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    fn snapshot_config(&self) -> BucketConfig {
        *self.config.lock().expect("bucket config poisoned")
    }

    async fn acquire(&self) {
        let mut state = self.gate.lock().await;
        loop {
            let config = self.snapshot_config();
            let now = Instant::now();
            let elapsed = now.duration_since(state.last_refill).as_secs_f64();
            state.tokens =
                (state.tokens + elapsed * config.rate_per_sec).min(config.burst as f64);
            state.last_refill = now;

            if state.tokens >= 1.0 {
                state.tokens -= 1.0;
                return;
            }

            let deficit = 1.0 - state.tokens;
            let wait = Duration::from_secs_f64(deficit / config.rate_per_sec);
            // Holding the gate across the sleep keeps admission FIFO
            sleep(wait).await;
        }
    }
}

/// Token buckets shared by all workers, keyed by environment.
#[derive(Clone, Default)]
pub struct RateLimiter {
    buckets: Arc<StdMutex<HashMap<EnvId, Arc<Bucket>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket(&self, env: &EnvId) -> Arc<Bucket> {
        let mut buckets = self.buckets.lock().expect("limiter poisoned");
        buckets
            .entry(env.clone())
            .or_insert_with(|| Arc::new(Bucket::new(BucketConfig::default())))
            .clone()
    }

    /// Apply throttle settings for an environment. Existing waiters pick up
    /// the new rate on their next refill; banked tokens are clamped to the
    /// new burst.
    pub fn configure(&self, env: &EnvId, rate_per_sec: f64, burst: u32) {
        let bucket = self.bucket(env);
        let mut config = bucket.config.lock().expect("bucket config poisoned");
        config.rate_per_sec = rate_per_sec.max(0.1);
        config.burst = burst.max(1);
        debug!(env = %env, rate_per_sec, burst, "rate limiter configured");
    }

    /// Acquire one token, waiting FIFO under contention. Cancel by dropping
    /// the future; an abandoned wait consumes nothing.
    pub async fn acquire(&self, env: &EnvId) {
        self.bucket(env).acquire().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> EnvId {
        EnvId::new("TRN").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn burst_drains_without_waiting() {
        let limiter = RateLimiter::new();
        limiter.configure(&env(), 10.0, 5);

        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire(&env()).await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_load_respects_refill_rate() {
        let limiter = RateLimiter::new();
        limiter.configure(&env(), 10.0, 5);

        // 50 concurrent callers: 5 from burst, 45 refilled at 10/s => >= 4.5s
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..50 {
            let limiter = limiter.clone();
            let env = env();
            handles.push(tokio::spawn(async move {
                limiter.acquire(&env).await;
                Instant::now()
            }));
        }
        let mut times = Vec::new();
        for handle in handles {
            times.push(handle.await.unwrap());
        }
        assert!(start.elapsed() >= Duration::from_millis(4_500));

        // No 1-second window admits more than rate + burst
        times.sort();
        for (i, t) in times.iter().enumerate() {
            let window_end = *t + Duration::from_secs(1);
            let in_window = times[i..].iter().take_while(|u| **u < window_end).count();
            assert!(in_window <= 15, "window admitted {in_window} tokens");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_wait_consumes_nothing() {
        let limiter = RateLimiter::new();
        limiter.configure(&env(), 1.0, 1);

        limiter.acquire(&env()).await; // drain the bucket

        let waiting = {
            let limiter = limiter.clone();
            let env = env();
            tokio::spawn(async move { limiter.acquire(&env).await })
        };
        tokio::task::yield_now().await;
        waiting.abort();
        let _ = waiting.await;

        // The abandoned wait left the token for us
        let start = Instant::now();
        limiter.acquire(&env()).await;
        assert!(start.elapsed() <= Duration::from_millis(1_100));
    }

    #[tokio::test(start_paused = true)]
    async fn environments_have_independent_buckets() {
        let limiter = RateLimiter::new();
        limiter.configure(&env(), 1.0, 1);
        let prd = EnvId::new("PRD").unwrap();
        limiter.configure(&prd, 1.0, 1);

        limiter.acquire(&env()).await;

        // PRD's bucket is untouched
        let start = Instant::now();
        limiter.acquire(&prd).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
