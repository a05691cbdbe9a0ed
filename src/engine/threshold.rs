//! History-based short-circuit.

use crate::config::FilterSettings;
use crate::store::Verdict;

/// What the verdict history says before any filter runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdDecision {
    /// Accepted often enough to never be rejected again.
    Allowlisted,
    /// Rejected often enough to be dropped unseen.
    Rejected,
    /// Run the filter chain.
    Evaluate,
}

/// The two independent threshold rules of a proxy. Zero disables a rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThresholdPolicy {
    pub reject_threshold: u64,
    pub no_reject_threshold: u64,
}

impl ThresholdPolicy {
    pub fn new(reject_threshold: u64, no_reject_threshold: u64) -> Self {
        Self {
            reject_threshold,
            no_reject_threshold,
        }
    }

    /// Both rules off: every entity runs the chain.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Apply the rules to `verdict`. The allow-list rule wins over the
    /// reject rule.
    pub fn evaluate(&self, verdict: &Verdict) -> ThresholdDecision {
        if self.no_reject_threshold > 0 && verdict.accepts >= self.no_reject_threshold {
            return ThresholdDecision::Allowlisted;
        }
        if self.reject_threshold > 0 && verdict.rejects >= self.reject_threshold {
            return ThresholdDecision::Rejected;
        }
        ThresholdDecision::Evaluate
    }
}

impl From<&FilterSettings> for ThresholdPolicy {
    fn from(settings: &FilterSettings) -> Self {
        Self::new(settings.reject_threshold, settings.no_reject_threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(accepts: u64, rejects: u64) -> Verdict {
        Verdict { accepts, rejects }
    }

    #[test]
    fn test_disabled_always_evaluates() {
        let policy = ThresholdPolicy::disabled();
        assert_eq!(policy.evaluate(&verdict(0, 0)), ThresholdDecision::Evaluate);
        assert_eq!(
            policy.evaluate(&verdict(u64::MAX, u64::MAX)),
            ThresholdDecision::Evaluate
        );
    }

    #[test]
    fn test_reject_threshold() {
        let policy = ThresholdPolicy::new(3, 0);
        assert_eq!(policy.evaluate(&verdict(0, 2)), ThresholdDecision::Evaluate);
        assert_eq!(policy.evaluate(&verdict(0, 3)), ThresholdDecision::Rejected);
        assert_eq!(policy.evaluate(&verdict(100, 4)), ThresholdDecision::Rejected);
    }

    #[test]
    fn test_no_reject_threshold() {
        let policy = ThresholdPolicy::new(0, 5);
        assert_eq!(policy.evaluate(&verdict(4, 0)), ThresholdDecision::Evaluate);
        assert_eq!(policy.evaluate(&verdict(5, 0)), ThresholdDecision::Allowlisted);
    }

    #[test]
    fn test_allowlist_wins() {
        let policy = ThresholdPolicy::new(1, 1);
        assert_eq!(
            policy.evaluate(&verdict(1, 50)),
            ThresholdDecision::Allowlisted
        );
        assert_eq!(policy.evaluate(&verdict(0, 1)), ThresholdDecision::Rejected);
    }

    #[test]
    fn test_from_settings() {
        let settings = FilterSettings {
            reject_threshold: 7,
            no_reject_threshold: 9,
            ..Default::default()
        };
        assert_eq!(ThresholdPolicy::from(&settings), ThresholdPolicy::new(7, 9));
    }
}
