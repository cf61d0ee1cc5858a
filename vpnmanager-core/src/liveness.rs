//! Liveness status with hysteresis.
//!
//! A single lost probe should not move traffic off a path, and a single
//! answered probe should not move it back. The debouncer turns a stream of
//! raw probe outcomes into edge-triggered status transitions:
//!
//! - The first observation sets the status directly.
//! - `failure_threshold` consecutive failures flip Available to Unavailable.
//! - `recovery_threshold` consecutive successes flip Unavailable to Available.

use std::fmt;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_RECOVERY_THRESHOLD: u32 = 1;

/// Reachability status of one VPN path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkStatus {
    Available,
    Unavailable,
}

impl LinkStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available)
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Available => f.write_str("available"),
            Self::Unavailable => f.write_str("unavailable"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Debouncer {
    failure_threshold: u32,
    recovery_threshold: u32,
    status: Option<LinkStatus>,
    /// Consecutive outcomes disagreeing with the current status
    streak: u32,
}

impl Debouncer {
    /// Thresholds below 1 are treated as 1.
    pub fn new(failure_threshold: u32, recovery_threshold: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_threshold: recovery_threshold.max(1),
            status: None,
            streak: 0,
        }
    }

    pub fn status(&self) -> Option<LinkStatus> {
        self.status
    }

    /// Feed one probe outcome; returns the new status on a transition.
    pub fn observe(&mut self, reachable: bool) -> Option<LinkStatus> {
        let observed = if reachable {
            LinkStatus::Available
        } else {
            LinkStatus::Unavailable
        };

        let Some(current) = self.status else {
            self.status = Some(observed);
            return Some(observed);
        };

        if observed == current {
            self.streak = 0;
            return None;
        }

        self.streak += 1;
        let threshold = match observed {
            LinkStatus::Available => self.recovery_threshold,
            LinkStatus::Unavailable => self.failure_threshold,
        };
        if self.streak < threshold {
            return None;
        }

        self.streak = 0;
        self.status = Some(observed);
        Some(observed)
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_RECOVERY_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_observation_is_a_transition() {
        let mut d = Debouncer::default();
        assert_eq!(d.status(), None);
        assert_eq!(d.observe(false), Some(LinkStatus::Unavailable));

        let mut d = Debouncer::default();
        assert_eq!(d.observe(true), Some(LinkStatus::Available));
    }

    #[test]
    fn test_failures_need_threshold() {
        let mut d = Debouncer::new(3, 1);
        d.observe(true);
        assert_eq!(d.observe(false), None);
        assert_eq!(d.observe(false), None);
        assert_eq!(d.observe(false), Some(LinkStatus::Unavailable));
        assert_eq!(d.observe(false), None);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let mut d = Debouncer::new(2, 1);
        d.observe(true);
        assert_eq!(d.observe(false), None);
        assert_eq!(d.observe(true), None);
        assert_eq!(d.observe(false), None);
        assert_eq!(d.status(), Some(LinkStatus::Available));
    }

    #[test]
    fn test_recovery_threshold() {
        let mut d = Debouncer::new(1, 2);
        d.observe(false);
        assert_eq!(d.observe(true), None);
        assert_eq!(d.observe(true), Some(LinkStatus::Available));
    }

    #[test]
    fn test_zero_threshold_acts_as_one() {
        let mut d = Debouncer::new(0, 0);
        d.observe(true);
        assert_eq!(d.observe(false), Some(LinkStatus::Unavailable));
        assert_eq!(d.observe(true), Some(LinkStatus::Available));
    }
}
