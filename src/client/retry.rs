use rand::Rng;
use std::time::Duration;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Retries on transport failures and 5xx only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Per-attempt request timeout.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// `retry_delay * 2^attempt`, without jitter. `attempt` is zero-based.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        self.retry_delay.saturating_mul(2u32.saturating_pow(attempt.min(16)))
    }

    /// Base backoff plus uniform jitter in `[0, retry_delay / 2]`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let cap = (self.retry_delay / 2).as_millis() as u64;
        let jitter = if cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=cap)
        };
        self.base_backoff(attempt) + Duration::from_millis(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.retry_delay, Duration::from_secs(1));
        assert_eq!(policy.timeout, Duration::from_secs(30));
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_backoff(0), Duration::from_secs(1));
        assert_eq!(policy.base_backoff(1), Duration::from_secs(2));
        assert_eq!(policy.base_backoff(2), Duration::from_secs(4));
    }

    #[test]
    fn jitter_stays_within_half_delay() {
        let policy = RetryPolicy::default();
        for attempt in 0..3 {
            for _ in 0..50 {
                let d = policy.backoff(attempt);
                let base = policy.base_backoff(attempt);
                assert!(d >= base);
                assert!(d <= base + Duration::from_millis(500));
            }
        }
    }
}
