//! Pacing dispatches to a fixed rate.

use std::{fmt, num::NonZeroU32, time::Duration};

use governor::{
    clock::Clock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota,
};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::WaitError;

type Gcra =
    governor::RateLimiter<NotKeyed, InMemoryState, TokioClock, NoOpMiddleware<std::time::Instant>>;

/// Paces callers to a target number of operations per second.
///
/// A token bucket with a capacity of one token, refilled continuously at `rate` tokens per second.
/// Idle time never banks more than a single token, so callers are released at least `1 / rate`
/// apart rather than in bursts.
///
/// Tokio timers fire on millisecond ticks, and a caller woken late can't make up the lost time
/// without bursting. Rates above a thousand per second are therefore not reached.
pub struct RateLimiter {
    rate: f64,
    interval: Duration,
    clock: TokioClock,
    gcra: Gcra,
}

/// Reads the time from tokio, so that pausing the runtime's clock pauses the limiter.
#[derive(Debug, Clone, Copy, Default)]
struct TokioClock;

impl Clock for TokioClock {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        Instant::now().into_std()
    }
}

impl RateLimiter {
    /// Intervals are capped to this, so rates slower than one per century behave as one per
    /// century.
    const MAX_INTERVAL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

    /// Create a limiter releasing `rate` callers per second. The bucket starts full.
    ///
    /// Fractional rates are allowed, e.g. `0.5` releases one caller every two seconds.
    pub fn new(rate: f64) -> Self {
        assert!(
            rate.is_finite() && rate > 0.0,
            "rate must be positive and finite"
        );

        let interval = Duration::try_from_secs_f64(rate.recip())
            .unwrap_or(Self::MAX_INTERVAL)
            .clamp(Duration::from_nanos(1), Self::MAX_INTERVAL);
        let quota = Quota::with_period(interval)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MAX))
            .allow_burst(NonZeroU32::MIN);

        let clock = TokioClock;
        Self {
            rate,
            interval,
            clock,
            gcra: governor::RateLimiter::direct_with_clock(quota, &clock),
        }
    }

    /// The configured rate, in operations per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Wait until a token is available, then consume it.
    ///
    /// Concurrent waiters race for tokens, in no particular order. If `cancel` fires first,
    /// returns [WaitError::Cancelled] without consuming a token.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), WaitError> {
        loop {
            if cancel.is_cancelled() {
                return Err(WaitError::Cancelled);
            }

            let not_until = match self.gcra.check() {
                Ok(()) => return Ok(()),
                Err(not_until) => not_until,
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(WaitError::Cancelled),
                _ = time::sleep(not_until.wait_time_from(self.clock.now())) => {}
            }
        }
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("rate", &self.rate)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}
