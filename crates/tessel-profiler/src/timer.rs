//! Host wall-clock timer.

use std::time::{Duration, Instant};

/// Measures host time between `start` and `stop`.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostTimer {
    started: Option<Instant>,
    elapsed: Duration,
}

impl HostTimer {
    /// A stopped timer with nothing recorded.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            started: None,
            elapsed: Duration::ZERO,
        }
    }

    /// Starts (or restarts) the timer, discarding any previous measurement.
    pub fn start(&mut self) {
        self.elapsed = Duration::ZERO;
        self.started = Some(Instant::now());
    }

    /// Stops the timer. Stopping a timer that is not running is a no-op.
    pub fn stop(&mut self) {
        if let Some(started) = self.started.take() {
            self.elapsed = started.elapsed();
        }
    }

    /// Returns true between `start` and `stop`.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.started.is_some()
    }

    /// Last measured interval in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_stop() {
        let mut timer = HostTimer::new();
        assert!(!timer.is_running());
        timer.start();
        assert!(timer.is_running());
        std::thread::sleep(Duration::from_millis(2));
        timer.stop();
        assert!(!timer.is_running());
        assert!(timer.elapsed_ms() >= 2.0);
    }

    #[test]
    fn test_stop_without_start() {
        let mut timer = HostTimer::new();
        timer.stop();
        assert_eq!(timer.elapsed_ms(), 0.0);
    }
}
