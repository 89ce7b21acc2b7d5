// Per-provider rate limiting, layered on top of the Model Gateway's concurrency
// semaphore (spec.md §5 "per-provider concurrency cap... to respect provider
// rate limits"): the semaphore bounds simultaneous in-flight calls, this bounds
// calls per unit time, which is the failure mode provider-side 429s actually
// come from.

use crate::error::{MemoryError, Result};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Jitter, Quota, RateLimiter as GovRateLimiter};

pub struct RateLimiter {
    limiter: Arc<GovRateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    jitter: Jitter,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32) -> Result<Self> {
        let quota = Quota::per_minute(
            NonZeroU32::new(requests_per_minute)
                .ok_or_else(|| MemoryError::Validation("rate limit must be > 0".to_string()))?,
        );

        Ok(Self {
            limiter: Arc::new(GovRateLimiter::direct(quota)),
            jitter: Jitter::new(Duration::from_millis(10), Duration::from_millis(100)),
        })
    }

    pub async fn acquire(&self) {
        self.limiter.until_ready_with_jitter(self.jitter).await;
    }

    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_quota() {
        assert!(RateLimiter::new(0).is_err());
    }

    #[test]
    fn try_acquire_allows_first_call() {
        let limiter = RateLimiter::new(60).unwrap();
        assert!(limiter.try_acquire());
    }
}
