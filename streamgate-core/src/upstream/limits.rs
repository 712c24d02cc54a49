//! Session call pacing
//!
//! Two layers wrap every upstream call, in fixed order: the flood-wait
//! handler retries "retry after N" responses, and the token bucket paces
//! sustained throughput (one token every 33 ms, bursts up to 15).

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Sustained refill interval: ~30 requests per second.
pub const REFILL_INTERVAL: Duration = Duration::from_millis(33);
/// Burst capacity.
pub const BURST_CAPACITY: f64 = 15.0;

/// Flood-wait handler configuration.
#[derive(Debug, Clone, Copy)]
pub struct FloodWaitConfig {
    pub max_retries: u32,
}

impl Default for FloodWaitConfig {
    fn default() -> Self {
        Self { max_retries: 10 }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket rate limiter.
///
/// The lock guards only arithmetic; waiting happens outside it.
pub struct TokenBucket {
    capacity: f64,
    refill_interval: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    #[must_use]
    pub fn new(refill_interval: Duration, capacity: f64) -> Self {
        Self {
            capacity,
            refill_interval,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill);
                let refilled =
                    elapsed.as_secs_f64() / self.refill_interval.as_secs_f64();
                state.tokens = (state.tokens + refilled).min(self.capacity);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - state.tokens;
                    Some(self.refill_interval.mul_f64(deficit))
                }
            };

            match wait {
                None => return,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new(REFILL_INTERVAL, BURST_CAPACITY)
    }
}
