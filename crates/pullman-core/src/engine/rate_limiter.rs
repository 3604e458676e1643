//! Token-bucket bandwidth governor
//!
//! One bucket enforces one ceiling: the engine keeps a global bucket
//! shared by every transport worker, plus an optional per-task bucket.
//! Refill rate equals the limit in bytes per second and the burst
//! capacity equals one second of tokens, so throughput stays smooth
//! without dropping connections.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Shared token bucket. Cloning shares the underlying state.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    state: Arc<Mutex<BucketState>>,
}

#[derive(Debug)]
struct BucketState {
    /// Ceiling in bytes/sec; None means unlimited
    limit: Option<u64>,
    /// Currently available tokens (bytes)
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Create a limiter with the given bytes-per-second ceiling.
    pub fn new(bytes_per_second: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(BucketState {
                limit: Some(bytes_per_second),
                tokens: bytes_per_second as f64,
                last_refill: Instant::now(),
            })),
        }
    }

    /// Create a limiter that never throttles.
    pub fn unlimited() -> Self {
        Self {
            state: Arc::new(Mutex::new(BucketState {
                limit: None,
                tokens: 0.0,
                last_refill: Instant::now(),
            })),
        }
    }

    pub fn from_limit(limit: Option<u64>) -> Self {
        match limit {
            Some(l) if l > 0 => Self::new(l),
            _ => Self::unlimited(),
        }
    }

    /// Change the ceiling at runtime. `None` or 0 lifts the limit.
    pub async fn set_limit(&self, bytes_per_second: Option<u64>) {
        let mut state = self.state.lock().await;
        match bytes_per_second {
            Some(limit) if limit > 0 => {
                state.tokens = state.tokens.min(limit as f64);
                state.limit = Some(limit);
            }
            _ => {
                state.limit = None;
            }
        }
    }

    pub async fn limit(&self) -> Option<u64> {
        self.state.lock().await.limit
    }

    /// Take `bytes` worth of tokens, waiting as long as necessary.
    ///
    /// Waits in slices of at most 50ms so sibling workers get fair
    /// access to freshly refilled tokens.
    pub async fn acquire(&self, bytes: u64) {
        // Large chunks are metered 16 KiB at a time so one worker
        // cannot drain a whole second of budget in a single call.
        let mut remaining = bytes;
        while remaining > 0 {
            let step = remaining.min(16 * 1024);
            self.acquire_step(step).await;
            remaining -= step;
        }
    }

    async fn acquire_step(&self, bytes: u64) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let Some(limit) = state.limit else {
                    return;
                };

                refill(&mut state, limit);

                if state.tokens >= bytes as f64 {
                    state.tokens -= bytes as f64;
                    return;
                }

                let needed = bytes as f64 - state.tokens;
                let wait_secs = needed / limit as f64;
                Duration::from_secs_f64(wait_secs.min(0.05))
            };

            if wait > Duration::ZERO {
                tokio::time::sleep(wait).await;
            }
        }
    }

    /// Non-blocking acquire; returns false when the bucket is short.
    pub async fn try_acquire(&self, bytes: u64) -> bool {
        let mut state = self.state.lock().await;
        let Some(limit) = state.limit else {
            return true;
        };

        refill(&mut state, limit);

        if state.tokens >= bytes as f64 {
            state.tokens -= bytes as f64;
            true
        } else {
            false
        }
    }
}

fn refill(state: &mut BucketState, limit: u64) {
    let now = Instant::now();
    let elapsed = now.duration_since(state.last_refill).as_secs_f64();
    if elapsed > 0.001 {
        state.tokens = (state.tokens + elapsed * limit as f64).min(limit as f64);
        state.last_refill = now;
    }
}

/// The global and per-task ceilings a worker must clear before each
/// chunk transfer.
#[derive(Clone, Debug)]
pub struct BandwidthGovernor {
    global: RateLimiter,
    task: RateLimiter,
}

impl BandwidthGovernor {
    pub fn new(global: RateLimiter, task: RateLimiter) -> Self {
        Self { global, task }
    }

    /// Acquire from both buckets; waits rather than erroring.
    pub async fn acquire(&self, bytes: u64) {
        self.global.acquire(bytes).await;
        self.task.acquire(bytes).await;
    }

    pub fn task_limiter(&self) -> &RateLimiter {
        &self.task
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_then_throttle() {
        let limiter = RateLimiter::new(1000); // 1 KB/s

        let start = Instant::now();
        limiter.acquire(500).await;
        limiter.acquire(500).await;
        // Bucket started full, both fit in the burst
        assert!(start.elapsed().as_millis() < 50);

        limiter.acquire(500).await;
        // Third request needs ~0.5s of refill
        assert!(start.elapsed().as_millis() >= 400);
    }

    #[tokio::test]
    async fn unlimited_never_waits() {
        let limiter = RateLimiter::unlimited();

        let start = Instant::now();
        for _ in 0..100 {
            limiter.acquire(10_000).await;
        }
        assert!(start.elapsed().as_millis() < 50);
    }

    #[tokio::test]
    async fn lifting_the_limit_unblocks() {
        let limiter = RateLimiter::new(10);
        assert!(limiter.try_acquire(10).await);
        assert!(!limiter.try_acquire(10).await);

        limiter.set_limit(None).await;
        assert!(limiter.try_acquire(1_000_000).await);
    }

    #[tokio::test]
    async fn governor_respects_the_tighter_bucket() {
        let global = RateLimiter::unlimited();
        let task = RateLimiter::new(1000);
        let gov = BandwidthGovernor::new(global, task);

        let start = Instant::now();
        gov.acquire(1000).await;
        gov.acquire(500).await;
        assert!(start.elapsed().as_millis() >= 400);
    }
}
