//! Escalation bookkeeping for a repair sequence.
//!
//! Retry/escalation policy is pure state here so attempt budgets and tiering
//! are testable without providers or processes. The orchestrator consumes
//! ladder slots; this module never performs I/O.

use crate::core::types::FailureKind;

/// Provider tier for one repair attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Local,
    Remote,
}

/// Phase tags for human-readable progress reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Generating,
    Running,
    Repairing,
    Validating,
    Committing,
    RollingBack,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Generating => "generation",
            Phase::Running => "running",
            Phase::Repairing => "repairing",
            Phase::Validating => "validating",
            Phase::Committing => "committing",
            Phase::RollingBack => "rolling back",
        }
    }
}

/// Bounded attempt budget: `per_tier` attempts on the local tier, then
/// `per_tier` attempts on the remote tier, then exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationLadder {
    per_tier: u32,
    used_local: u32,
    used_remote: u32,
}

impl EscalationLadder {
    pub fn new(per_tier: u32) -> Self {
        Self {
            per_tier,
            used_local: 0,
            used_remote: 0,
        }
    }

    /// Consume the next attempt slot, or `None` when the budget is exhausted.
    pub fn next(&mut self) -> Option<Tier> {
        if self.used_local < self.per_tier {
            self.used_local += 1;
            return Some(Tier::Local);
        }
        if self.used_remote < self.per_tier {
            self.used_remote += 1;
            return Some(Tier::Remote);
        }
        None
    }

    /// 1-indexed number of attempts consumed so far.
    pub fn attempts_used(&self) -> u32 {
        self.used_local + self.used_remote
    }

    /// True once the ladder has moved past the local tier.
    pub fn escalated(&self) -> bool {
        self.used_remote > 0
    }
}

/// Counter for consecutive syntax-classified run failures.
///
/// When the streak reaches the threshold a one-shot remote rescue pass is
/// due; any non-syntax observation resets the streak.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxStreak {
    count: u32,
    threshold: u32,
}

impl SyntaxStreak {
    pub fn new(threshold: u32) -> Self {
        Self {
            count: 0,
            threshold,
        }
    }

    /// Record one run classification. Returns true when a rescue pass is due.
    pub fn observe(&mut self, kind: FailureKind) -> bool {
        match kind {
            FailureKind::Syntax => {
                self.count += 1;
                self.count >= self.threshold
            }
            FailureKind::None | FailureKind::Runtime => {
                self.count = 0;
                false
            }
        }
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_orders_local_then_remote_with_k2() {
        let mut ladder = EscalationLadder::new(2);
        assert_eq!(ladder.next(), Some(Tier::Local));
        assert_eq!(ladder.next(), Some(Tier::Local));
        assert_eq!(ladder.next(), Some(Tier::Remote));
        assert_eq!(ladder.next(), Some(Tier::Remote));
        assert_eq!(ladder.next(), None);
        assert_eq!(ladder.attempts_used(), 4);
    }

    #[test]
    fn ladder_reports_escalation_after_local_tier() {
        let mut ladder = EscalationLadder::new(1);
        ladder.next();
        assert!(!ladder.escalated());
        ladder.next();
        assert!(ladder.escalated());
    }

    #[test]
    fn zero_budget_is_immediately_exhausted() {
        let mut ladder = EscalationLadder::new(0);
        assert_eq!(ladder.next(), None);
    }

    #[test]
    fn streak_fires_at_threshold() {
        let mut streak = SyntaxStreak::new(3);
        assert!(!streak.observe(FailureKind::Syntax));
        assert!(!streak.observe(FailureKind::Syntax));
        assert!(streak.observe(FailureKind::Syntax));
    }

    #[test]
    fn runtime_failure_resets_the_streak() {
        let mut streak = SyntaxStreak::new(2);
        streak.observe(FailureKind::Syntax);
        streak.observe(FailureKind::Runtime);
        assert_eq!(streak.count(), 0);
        assert!(!streak.observe(FailureKind::Syntax));
    }
}
