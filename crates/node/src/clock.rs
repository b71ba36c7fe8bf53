//! Wall-clock time mapped onto the tokio timer.
//!
//! Rounds are scheduled in unix seconds while sleeping happens on tokio
//! instants. A [`Clock`] pins the two together at creation, so a paused tokio
//! runtime drives beacon time deterministically in tests.

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

#[derive(Clone, Debug)]
pub struct Clock {
    origin_unix_ms: u64,
    origin: Instant,
}

impl Clock {
    /// Clock following the system time.
    pub fn system() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            origin_unix_ms: now.as_millis() as u64,
            origin: Instant::now(),
        }
    }

    /// Clock reading `unix_secs` now.
    pub fn starting_at(unix_secs: u64) -> Self {
        Self {
            origin_unix_ms: unix_secs * 1000,
            origin: Instant::now(),
        }
    }

    pub fn now_unix_ms(&self) -> u64 {
        self.origin_unix_ms + self.origin.elapsed().as_millis() as u64
    }

    /// Current unix time in seconds.
    pub fn now_unix(&self) -> u64 {
        self.now_unix_ms() / 1000
    }

    /// Timer instant at which the clock reads `unix_secs`.
    pub fn instant_at(&self, unix_secs: u64) -> Instant {
        let target_ms = unix_secs.saturating_mul(1000);
        self.origin + Duration::from_millis(target_ms.saturating_sub(self.origin_unix_ms))
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_paused_time() {
        let clock = Clock::starting_at(1_000);
        assert_eq!(clock.now_unix(), 1_000);

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(clock.now_unix(), 1_002);

        tokio::time::sleep_until(clock.instant_at(1_010)).await;
        assert_eq!(clock.now_unix(), 1_010);

        // Past instants resolve immediately
        assert!(clock.instant_at(900) <= Instant::now());
    }
}
