//! Token bucket rate limiter
//!
//! Shared by every transfer of one priority class. The bucket holds one
//! second worth of tokens so concurrent transfers draw from it fairly.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Largest slice handed out per bucket check
const MAX_SLICE: u64 = 16 * 1024;

/// Rate limiter using a token bucket
#[derive(Clone)]
pub struct RateLimiter {
    state: Arc<Mutex<RateLimiterState>>,
}

struct RateLimiterState {
    /// Maximum tokens (bytes) in the bucket
    capacity: u64,
    /// Current available tokens
    tokens: f64,
    /// Last token refill time
    last_refill: Instant,
    /// Tokens added per second
    refill_rate: u64,
    is_unlimited: bool,
}

impl RateLimiter {
    /// Create a limiter for `bytes_per_second`; 0 means unlimited
    pub fn new(bytes_per_second: u64) -> Self {
        let limiter = Self {
            state: Arc::new(Mutex::new(RateLimiterState {
                capacity: u64::MAX,
                tokens: f64::MAX,
                last_refill: Instant::now(),
                refill_rate: u64::MAX,
                is_unlimited: true,
            })),
        };
        limiter.set_limit(bytes_per_second);
        limiter
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Current limit in bytes/sec, `None` when unlimited
    pub fn limit(&self) -> Option<u64> {
        let state = self.state.lock();
        (!state.is_unlimited).then_some(state.refill_rate)
    }

    /// Update the speed limit; 0 means unlimited
    pub fn set_limit(&self, bytes_per_second: u64) {
        let mut state = self.state.lock();
        if bytes_per_second == 0 || bytes_per_second == u64::MAX {
            state.capacity = u64::MAX;
            state.refill_rate = u64::MAX;
            state.tokens = f64::MAX;
            state.is_unlimited = true;
        } else {
            let was_unlimited = state.is_unlimited;
            state.capacity = bytes_per_second;
            state.refill_rate = bytes_per_second;
            state.is_unlimited = false;
            state.last_refill = Instant::now();
            // Don't let tokens exceed new capacity
            state.tokens = if was_unlimited {
                bytes_per_second as f64
            } else {
                state.tokens.min(bytes_per_second as f64)
            };
        }
    }

    /// Wait until `bytes` may be transferred
    pub async fn acquire(&self, bytes: u64) {
        let mut remaining = bytes;
        while remaining > 0 {
            let slice = remaining.min(MAX_SLICE);
            self.acquire_slice(slice).await;
            remaining -= slice;
        }
    }

    async fn acquire_slice(&self, bytes: u64) {
        loop {
            let wait_time = {
                let mut state = self.state.lock();

                if state.is_unlimited {
                    return;
                }

                Self::refill_tokens(&mut state);

                // A slice larger than the whole bucket would never fit
                let needed = (bytes as f64).min(state.capacity as f64);
                if state.tokens >= needed {
                    state.tokens -= needed;
                    return;
                }

                let missing = needed - state.tokens;
                let wait_secs = missing / state.refill_rate as f64;

                // Cap wait time to 50ms for responsiveness
                Duration::from_secs_f64(wait_secs.min(0.05))
            };

            // Wait outside the lock so other transfers can also check
            if wait_time > Duration::ZERO {
                tokio::time::sleep(wait_time).await;
            }
        }
    }

    fn refill_tokens(state: &mut RateLimiterState) {
        let now = Instant::now();
        let elapsed_secs = now.duration_since(state.last_refill).as_secs_f64();

        if elapsed_secs > 0.001 {
            let new_tokens = elapsed_secs * state.refill_rate as f64;
            state.tokens = (state.tokens + new_tokens).min(state.capacity as f64);
            state.last_refill = now;
        }
    }
}
