//! Restart policy for the worker subprocess.
//!
//! Only sustained, uninterrupted failure streaks count toward escalation:
//! any inbound data from the worker resets the streak to zero.

/// Default maximum consecutive failures tolerated before escalating.
pub const DEFAULT_MAX_FAILS: u32 = 4;

/// What the supervisor should do after a worker-lifecycle failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Spawn a replacement worker.
    Restart,
    /// The streak exceeded the maximum: stop restarting and escalate.
    Escalate,
}

/// Consecutive worker-failure streak, checked against a fixed maximum.
#[derive(Debug)]
pub struct FailureCounter {
    count: u32,
    max: u32,
}

impl FailureCounter {
    pub fn new(max: u32) -> Self {
        Self { count: 0, max }
    }

    /// Record one failure and decide whether another restart is allowed.
    pub fn record(&mut self) -> RestartDecision {
        self.count += 1;
        if self.count > self.max {
            RestartDecision::Escalate
        } else {
            RestartDecision::Restart
        }
    }

    /// The worker produced data: the streak is broken.
    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

impl Default for FailureCounter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FAILS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restarts_up_to_max() {
        let mut fails = FailureCounter::new(4);
        for _ in 0..4 {
            assert_eq!(fails.record(), RestartDecision::Restart);
        }
        assert_eq!(fails.record(), RestartDecision::Escalate);
    }

    #[test]
    fn reset_breaks_the_streak() {
        let mut fails = FailureCounter::new(2);
        assert_eq!(fails.record(), RestartDecision::Restart);
        assert_eq!(fails.record(), RestartDecision::Restart);
        fails.reset();
        assert_eq!(fails.count(), 0);
        // A fresh streak gets the full allowance again.
        assert_eq!(fails.record(), RestartDecision::Restart);
        assert_eq!(fails.record(), RestartDecision::Restart);
        assert_eq!(fails.record(), RestartDecision::Escalate);
    }

    #[test]
    fn zero_max_escalates_on_first_failure() {
        let mut fails = FailureCounter::new(0);
        assert_eq!(fails.record(), RestartDecision::Escalate);
    }
}
