//! Sliding-window rate limiting.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A sliding-window counter.
///
/// Each allowance records its timestamp; on every draw, timestamps older
/// than the window are evicted and the remaining count is compared against
/// the ceiling. A ceiling of zero or below disables the limiter entirely.
pub struct SlidingWindow {
    max: i64,
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl SlidingWindow {
    /// A limiter allowing at most `max` draws per `window`.
    #[must_use]
    pub const fn new(max: i64, window: Duration) -> Self {
        Self {
            max,
            window,
            timestamps: Mutex::new(VecDeque::new()),
        }
    }

    /// A limiter counting per second.
    #[must_use]
    pub const fn per_second(max: i64) -> Self {
        Self::new(max, Duration::from_secs(1))
    }

    /// A limiter counting per minute.
    #[must_use]
    pub const fn per_minute(max: i64) -> Self {
        Self::new(max, Duration::from_secs(60))
    }

    /// Draw a token: `true` records the draw, `false` refuses it.
    pub fn allow(&self) -> bool {
        if self.max <= 0 {
            return true;
        }
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock();
        while let Some(front) = timestamps.front() {
            if now.duration_since(*front) >= self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
        if timestamps.len() as i64 >= self.max {
            return false;
        }
        timestamps.push_back(now);
        true
    }

    /// Number of draws currently inside the window.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock();
        while let Some(front) = timestamps.front() {
            if now.duration_since(*front) >= self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
        timestamps.len()
    }
}
