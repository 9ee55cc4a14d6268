//! Deferred save scheduling.
//!
//! The drive owns one pending deadline; the host pumps it with the current time.
//! Scheduling again replaces the deadline, so bursts of writes coalesce into a
//! single save.

use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct SaveTimer {
    due: Option<Instant>,
}

impl SaveTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) the timer to fire `delay` after `now`.
    pub fn schedule(&mut self, now: Instant, delay: Duration) {
        self.due = Some(now + delay);
    }

    pub fn cancel(&mut self) {
        self.due = None;
    }

    pub fn is_pending(&self) -> bool {
        self.due.is_some()
    }

    pub fn due(&self) -> Option<Instant> {
        self.due
    }

    /// Disarm and return true if the deadline has passed.
    pub fn fire_if_due(&mut self, now: Instant) -> bool {
        match self.due {
            Some(due) if now >= due => {
                self.due = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_once_after_deadline() {
        let start = Instant::now();
        let mut t = SaveTimer::new();
        assert!(!t.fire_if_due(start));
        t.schedule(start, Duration::from_millis(500));
        assert!(t.is_pending());
        assert!(!t.fire_if_due(start + Duration::from_millis(499)));
        assert!(t.fire_if_due(start + Duration::from_millis(500)));
        assert!(!t.fire_if_due(start + Duration::from_secs(10)));
    }

    #[test]
    fn test_reschedule_replaces_deadline() {
        let start = Instant::now();
        let mut t = SaveTimer::new();
        t.schedule(start, Duration::from_millis(100));
        t.schedule(start + Duration::from_millis(50), Duration::from_millis(100));
        assert_eq!(t.due(), Some(start + Duration::from_millis(150)));
        assert!(!t.fire_if_due(start + Duration::from_millis(120)));
        t.cancel();
        assert!(!t.is_pending());
    }
}
