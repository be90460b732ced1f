//! Countdown tracking for transaction, ping and work deadlines
//!
//! A tracker holds an elapsed value in milliseconds that advances by a fixed
//! step on every tick while running. Reaching the configured maximum freezes
//! the value and stops the tracker, so expiry is observed as
//! `value == max && !running`. Trackers own no timers; the engine ticks all of
//! them from a single interval.

use serde::Serialize;

/// Start/stop/reset countdown with a fixed tick step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlineTracker {
    value: u64,
    max: u64,
    step: u64,
    running: bool,
}

impl DeadlineTracker {
    /// Create a stopped tracker at zero
    pub fn new(max: u64, step: u64) -> Self {
        Self {
            value: 0,
            max,
            step,
            running: false,
        }
    }

    /// Start advancing. Returns false if it was already running.
    pub fn start(&mut self) -> bool {
        if self.running {
            return false;
        }
        self.running = true;
        true
    }

    /// Stop advancing. Returns false if it was already stopped.
    pub fn stop(&mut self) -> bool {
        if !self.running {
            return false;
        }
        self.running = false;
        true
    }

    /// Set the elapsed value without changing the running state
    pub fn reset(&mut self, value: u64) {
        self.value = value.min(self.max);
    }

    /// Change the maximum, clamping the current value
    pub fn set_max(&mut self, max: u64) {
        self.max = max;
        self.value = self.value.min(max);
    }

    /// Advance one step. Returns true if the value changed.
    pub fn tick(&mut self) -> bool {
        if !self.running {
            return false;
        }
        let before = self.value;
        self.value = self.value.saturating_add(self.step).min(self.max);
        if self.value >= self.max {
            self.running = false;
        }
        self.value != before
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn remaining(&self) -> u64 {
        self.max - self.value
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_expired(&self) -> bool {
        self.value >= self.max && !self.running
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            value: self.value,
            max: self.max,
            running: self.running,
            expired: self.is_expired(),
        }
    }
}

/// Serializable view of a tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrackerSnapshot {
    pub value: u64,
    pub max: u64,
    pub running: bool,
    pub expired: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_freezes_at_max_after_five_ticks() {
        let mut tracker = DeadlineTracker::new(1000, 200);
        assert!(tracker.start());

        for expected in [200, 400, 600, 800] {
            assert!(tracker.tick());
            assert_eq!(tracker.value(), expected);
            assert!(tracker.is_running());
        }

        assert!(tracker.tick());
        assert_eq!(tracker.value(), 1000);
        assert!(!tracker.is_running());
        assert!(tracker.is_expired());

        assert!(!tracker.tick());
        assert_eq!(tracker.value(), 1000);
    }

    #[test]
    fn test_reset_then_start_restarts() {
        let mut tracker = DeadlineTracker::new(1000, 200);
        tracker.start();
        for _ in 0..5 {
            tracker.tick();
        }
        assert!(tracker.is_expired());

        tracker.reset(0);
        assert_eq!(tracker.value(), 0);
        assert!(!tracker.is_running());

        assert!(tracker.start());
        tracker.tick();
        assert_eq!(tracker.value(), 200);
    }

    #[test]
    fn test_start_and_stop_are_idempotent() {
        let mut tracker = DeadlineTracker::new(1000, 200);
        assert!(tracker.start());
        assert!(!tracker.start());
        tracker.tick();
        assert_eq!(tracker.value(), 200);

        assert!(tracker.stop());
        assert!(!tracker.stop());
        assert!(!tracker.tick());
        assert_eq!(tracker.value(), 200);
        assert!(!tracker.is_expired());
    }

    #[test]
    fn test_uneven_max_is_clamped() {
        let mut tracker = DeadlineTracker::new(500, 200);
        tracker.start();
        tracker.tick();
        tracker.tick();
        tracker.tick();
        assert_eq!(tracker.value(), 500);
        assert!(tracker.is_expired());
        assert_eq!(tracker.remaining(), 0);
    }

    #[test]
    fn test_reset_does_not_start_and_clamps() {
        let mut tracker = DeadlineTracker::new(400, 200);
        tracker.reset(900);
        assert_eq!(tracker.value(), 400);
        assert!(!tracker.is_running());
    }

    #[test]
    fn test_set_max_rearms() {
        let mut tracker = DeadlineTracker::new(0, 200);
        tracker.start();
        tracker.tick();
        assert!(tracker.is_expired());

        tracker.set_max(5000);
        tracker.start();
        tracker.tick();
        assert_eq!(tracker.value(), 200);
        assert_eq!(tracker.snapshot().max, 5000);
    }
}
