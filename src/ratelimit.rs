use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as GovernorRateLimiter};
use std::{num::NonZeroU32, time::Duration};

/// Paces outgoing requests to the grades source. This is separate from the
/// fetcher's concurrency gate: the gate bounds how many requests are open,
/// this bounds how fast new ones start.
pub struct RateLimiter {
    req_per_sec: DefaultDirectRateLimiter,
    // None when the configured gap is zero.
    min_gap: Option<DefaultDirectRateLimiter>,
}

impl RateLimiter {
    pub fn new(req_per_sec: NonZeroU32, min_gap: Duration) -> Self {
        // Limit to X total req/sec on average.
        let req_per_sec = GovernorRateLimiter::direct(Quota::per_second(req_per_sec));

        // No two requests closer than Y ms.
        let min_gap = Quota::with_period(min_gap).map(GovernorRateLimiter::direct);

        RateLimiter {
            req_per_sec,
            min_gap,
        }
    }

    pub async fn wait_until_ready(&self) {
        // Await the per-second bucket first. Waiting on the gap limiter first
        // would let a queue of callers pile up behind it and then all cross the
        // per-second boundary together.
        self.req_per_sec.until_ready().await;
        if let Some(min_gap) = &self.min_gap {
            min_gap.until_ready().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn zero_gap_disables_the_gap_limiter() {
        let limiter = RateLimiter::new(NonZeroU32::new(1000).unwrap(), Duration::ZERO);
        assert!(limiter.min_gap.is_none());
        limiter.wait_until_ready().await;
    }

    #[tokio::test]
    async fn gap_limiter_spaces_requests() {
        let limiter = RateLimiter::new(NonZeroU32::new(1000).unwrap(), Duration::from_millis(20));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.wait_until_ready().await;
        }
        // First request is free, the next two each wait one gap.
        assert!(start.elapsed() >= Duration::from_millis(35));
    }
}
