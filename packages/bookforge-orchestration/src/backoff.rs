use std::time::Duration;

/// Capped exponential backoff.
///
/// `delay(n)` is the wait after the n-th consecutive failure, with `n`
/// counted from 1: `base * 2^(n-1)`, never more than `cap`. Read as a
/// 0-based retry index `attempt = n - 1`, that is `base * 2^attempt`, so the
/// first retry waits exactly `base`. `delay(0)` is also `base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.cap)
            .min(self.cap)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
        }
    }
}
