//! Host clocks
//!
//! The run loop asks its clock for "now" in milliseconds and waits on it for
//! the next due timer. [`VirtualClock`] jumps straight to the deadline, which
//! keeps test runs deterministic and instant; [`SystemClock`] sleeps.

use std::time::{Duration, Instant};

/// Millisecond clock consulted by the scheduler
pub trait Clock {
    /// Current time in milliseconds since the clock's epoch
    fn now(&self) -> u64;

    /// Block until `now() >= deadline`
    fn wait_until(&mut self, deadline: u64);

    /// Whether waiting costs no wall time
    fn is_virtual(&self) -> bool {
        false
    }
}

/// Deterministic clock that advances only when asked to
#[derive(Debug, Clone, Default)]
pub struct VirtualClock {
    now: u64,
}

impl VirtualClock {
    /// Create a virtual clock starting at 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward by `ms`
    pub fn advance(&mut self, ms: u64) {
        self.now = self.now.saturating_add(ms);
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> u64 {
        self.now
    }

    fn wait_until(&mut self, deadline: u64) {
        self.now = self.now.max(deadline);
    }

    fn is_virtual(&self) -> bool {
        true
    }
}

/// Monotonic wall clock
#[derive(Debug, Clone)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    /// Create a clock whose epoch is the current instant
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn wait_until(&mut self, deadline: u64) {
        let now = self.now();
        if deadline > now {
            std::thread::sleep(Duration::from_millis(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_clock_jumps() {
        let mut clock = VirtualClock::new();
        assert_eq!(clock.now(), 0);
        clock.wait_until(250);
        assert_eq!(clock.now(), 250);
        // Never moves backwards
        clock.wait_until(100);
        assert_eq!(clock.now(), 250);
        clock.advance(5);
        assert_eq!(clock.now(), 255);
        assert!(clock.is_virtual());
    }

    #[test]
    fn test_system_clock_sleeps() {
        let mut clock = SystemClock::new();
        let start = clock.now();
        clock.wait_until(start + 15);
        assert!(clock.now() >= start + 15);
        assert!(!clock.is_virtual());
    }
}
