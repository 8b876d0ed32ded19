//! Token bucket shared by every resolver call.
//!
//! Sized to the API's published limit (`requests_per_window` per
//! `window_secs`). Callers wait for capacity instead of failing, up to
//! `max_wait`; past that the call fails as rate limited.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tracing::debug;

use crate::error::ResolutionError;

pub struct ApiRateLimiter {
    limiter: DefaultDirectRateLimiter,
    max_wait: Duration,
}

impl ApiRateLimiter {
    pub fn new(capacity: u32, window: Duration, max_wait: Duration) -> Self {
        let burst = NonZeroU32::new(capacity).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::with_period(window / burst.get())
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst);
        Self {
            limiter: RateLimiter::direct(quota),
            max_wait,
        }
    }

    /// Take one token, waiting cooperatively for at most `max_wait`.
    pub async fn acquire(&self) -> Result<(), ResolutionError> {
        if self.limiter.check().is_ok() {
            return Ok(());
        }

        debug!(
            max_wait_ms = self.max_wait.as_millis() as u64,
            "API token bucket empty, waiting"
        );
        tokio::time::timeout(self.max_wait, self.limiter.until_ready())
            .await
            .map_err(|_| {
                ResolutionError::RateLimited(format!(
                    "no API capacity within {}s",
                    self.max_wait.as_secs_f32()
                ))
            })
    }
}
