use std::num::NonZeroU32;
use std::thread;
use std::time::Duration;

use governor::clock::Clock;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

/// Blocking request pacer enforcing a minimum interval between outbound requests.
///
/// One pacer is shared by every worker talking to the same upstream, so the cap is global
/// rather than per thread. A zero interval disables pacing.
pub struct RequestPacer {
    interval: Duration,
    limiter: Option<DefaultDirectRateLimiter>,
}

impl RequestPacer {
    pub fn new(interval: Duration) -> Self {
        let limiter = Quota::with_period(interval)
            .map(|quota| RateLimiter::direct(quota.allow_burst(NonZeroU32::MIN)));
        Self { interval, limiter }
    }

    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Blocks until the next request is allowed.
    pub fn acquire(&self) {
        let Some(limiter) = &self.limiter else {
            return;
        };
        while let Err(not_until) = limiter.check() {
            thread::sleep(not_until.wait_time_from(limiter.clock().now()));
        }
    }
}

impl std::fmt::Debug for RequestPacer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPacer")
            .field("interval", &self.interval)
            .finish()
    }
}

impl Default for RequestPacer {
    fn default() -> Self {
        Self::unlimited()
    }
}
