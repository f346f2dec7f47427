use std::time::Duration;

use super::cycle::FinalOutcome;

pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(1800);
pub const DEFAULT_STEP: Duration = Duration::from_secs(60);
pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IntervalError {
    #[error("min interval must be at least one second")]
    ZeroMin,
    #[error("min interval {min}s exceeds max interval {max}s")]
    MinAboveMax { min: u64, max: u64 },
    #[error("interval step must be positive")]
    ZeroStep,
}

/// Additive-increase / multiplicative-decrease sleep interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalPolicy {
    min: Duration,
    max: Duration,
    step: Duration,
    initial: Duration,
}

impl Default for IntervalPolicy {
    fn default() -> Self {
        Self {
            min: DEFAULT_MIN_INTERVAL,
            max: DEFAULT_MAX_INTERVAL,
            step: DEFAULT_STEP,
            initial: DEFAULT_INITIAL_INTERVAL,
        }
    }
}

impl IntervalPolicy {
    pub fn new(
        min: Duration,
        max: Duration,
        step: Duration,
        initial: Duration,
    ) -> Result<Self, IntervalError> {
        if min.as_secs() == 0 {
            return Err(IntervalError::ZeroMin);
        }
        if min > max {
            return Err(IntervalError::MinAboveMax {
                min: min.as_secs(),
                max: max.as_secs(),
            });
        }
        if step.is_zero() {
            return Err(IntervalError::ZeroStep);
        }
        Ok(Self {
            min,
            max,
            step,
            initial: initial.clamp(min, max),
        })
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn clamp(&self, interval: Duration) -> Duration {
        interval.clamp(self.min, self.max)
    }

    /// Interval to sleep after a cycle that ended with `outcome`.
    pub fn next(&self, current: Duration, outcome: FinalOutcome) -> Duration {
        let current = self.clamp(current);
        match outcome {
            FinalOutcome::Success => (current + self.step).min(self.max),
            FinalOutcome::RolledBack | FinalOutcome::Error => (current / 2).max(self.min),
            FinalOutcome::Cancelled => current,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn successes_grow_additively() {
        let policy = IntervalPolicy::default();
        let after_one = policy.next(secs(300), FinalOutcome::Success);
        assert_eq!(after_one, secs(360));
        assert_eq!(policy.next(after_one, FinalOutcome::Success), secs(420));
    }

    #[test]
    fn failures_halve_down_to_min() {
        let policy = IntervalPolicy::default();
        assert_eq!(policy.next(secs(100), FinalOutcome::RolledBack), secs(60));
        assert_eq!(policy.next(secs(400), FinalOutcome::Error), secs(200));
        assert_eq!(policy.next(secs(60), FinalOutcome::Error), secs(60));
    }

    #[test]
    fn growth_is_capped_at_max() {
        let policy = IntervalPolicy::default();
        assert_eq!(policy.next(secs(1790), FinalOutcome::Success), secs(1800));
        assert_eq!(policy.next(secs(1800), FinalOutcome::Success), secs(1800));
    }

    #[test]
    fn cancelled_cycles_leave_interval_alone() {
        let policy = IntervalPolicy::default();
        assert_eq!(policy.next(secs(420), FinalOutcome::Cancelled), secs(420));
    }

    #[test]
    fn custom_bounds_are_validated() {
        assert_eq!(
            IntervalPolicy::new(secs(100), secs(50), secs(10), secs(60)).unwrap_err(),
            IntervalError::MinAboveMax { min: 100, max: 50 }
        );
        assert_eq!(
            IntervalPolicy::new(secs(10), secs(50), secs(0), secs(20)).unwrap_err(),
            IntervalError::ZeroStep
        );
        let policy = IntervalPolicy::new(secs(10), secs(50), secs(5), secs(500)).unwrap();
        assert_eq!(policy.initial(), secs(50));
        assert_eq!(policy.next(secs(48), FinalOutcome::Success), secs(50));
    }
}
