//! Wall-clock timers and the adaptive network timeout.

use std::time::{Duration, Instant};

/// Measures elapsed time from construction.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    started: Instant,
}

impl Timer {
    #[must_use]
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Restarts the timer, returning the time that had elapsed.
    pub fn restart(&mut self) -> Duration {
        let elapsed = self.elapsed();
        self.started = Instant::now();
        elapsed
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::start()
    }
}

/// A poll timeout that tracks observed round-trip latencies.
///
/// The timeout is an exponentially weighted moving average of observed
/// successful-response latencies, padded by a fixed multiplier and clamped
/// to a configured band. Unanswered polls feed the maximum back in, so
/// repeated losses walk the timeout toward the ceiling.
#[derive(Debug, Clone)]
pub struct AdaptiveTimeout {
    current: Duration,
    floor: Duration,
    ceiling: Duration,
    smoothing: f64,
    headroom: f64,
}

impl AdaptiveTimeout {
    const DEFAULT_SMOOTHING: f64 = 0.1;
    const DEFAULT_HEADROOM: f64 = 2.0;

    #[must_use]
    pub fn new(initial: Duration, floor: Duration, ceiling: Duration) -> Self {
        Self {
            current: initial.clamp(floor, ceiling),
            floor,
            ceiling,
            smoothing: Self::DEFAULT_SMOOTHING,
            headroom: Self::DEFAULT_HEADROOM,
        }
    }

    /// Overrides the EWMA smoothing factor.
    ///
    /// # Panics
    ///
    /// Panics unless `smoothing` is within `[0, 1]`.
    #[must_use]
    pub fn with_smoothing(mut self, smoothing: f64) -> Self {
        assert!(
            (0.0..=1.0).contains(&smoothing),
            "smoothing factor outside [0, 1]"
        );
        self.smoothing = smoothing;
        self
    }

    /// Folds a successful round-trip latency into the average.
    pub fn observe_latency(&mut self, latency: Duration) {
        let target = latency.as_secs_f64() * self.headroom;
        let blended =
            self.current.as_secs_f64() * (1.0 - self.smoothing) + target * self.smoothing;
        self.current = Duration::from_secs_f64(blended).clamp(self.floor, self.ceiling);
    }

    /// Records an expired poll; treated as a response at the ceiling.
    pub fn observe_timeout(&mut self) {
        let blended = self.current.as_secs_f64() * (1.0 - self.smoothing)
            + self.ceiling.as_secs_f64() * self.smoothing;
        self.current = Duration::from_secs_f64(blended).clamp(self.floor, self.ceiling);
    }

    /// The deadline to attach to the next poll.
    #[must_use]
    pub fn current(&self) -> Duration {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout() -> AdaptiveTimeout {
        AdaptiveTimeout::new(
            Duration::from_secs(2),
            Duration::from_millis(200),
            Duration::from_secs(10),
        )
    }

    #[test]
    fn initial_is_clamped() {
        let t = AdaptiveTimeout::new(
            Duration::from_secs(60),
            Duration::from_secs(1),
            Duration::from_secs(10),
        );
        assert_eq!(t.current(), Duration::from_secs(10));

        let t = AdaptiveTimeout::new(
            Duration::from_millis(1),
            Duration::from_secs(1),
            Duration::from_secs(10),
        );
        assert_eq!(t.current(), Duration::from_secs(1));
    }

    #[test]
    fn fast_responses_shrink_the_timeout() {
        let mut t = timeout();
        for _ in 0..200 {
            t.observe_latency(Duration::from_millis(50));
        }
        assert!(t.current() < Duration::from_secs(1));
        assert!(t.current() >= Duration::from_millis(200));
    }

    #[test]
    fn slow_responses_grow_the_timeout() {
        let mut t = timeout();
        for _ in 0..200 {
            t.observe_latency(Duration::from_secs(4));
        }
        assert!(t.current() > Duration::from_secs(2));
        assert!(t.current() <= Duration::from_secs(10));
    }

    #[test]
    fn timeouts_walk_toward_the_ceiling() {
        let mut t = timeout();
        let before = t.current();
        t.observe_timeout();
        assert!(t.current() > before);
        for _ in 0..500 {
            t.observe_timeout();
        }
        assert!(t.current() <= Duration::from_secs(10));
        assert!(t.current() > Duration::from_secs(9));
    }
}
