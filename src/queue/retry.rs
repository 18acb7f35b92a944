//! Per-job retry policy.
//!
//! After the `n`th failure (`n` = retry count including this one) the job is
//! rescheduled `2^n` units later while `n <= max_retries`; after that it is
//! terminal.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the item back to `pending`, eligible after `delay`.
    Retry { retry_count: u32, delay: Duration },
    /// Give up; the item becomes `failed`.
    Fail { retry_count: u32 },
}

/// Decide what happens to a job that just failed.
pub fn retry_decision(previous_retries: u32, max_retries: u32, unit: Duration) -> RetryDecision {
    let retry_count = previous_retries.saturating_add(1);
    if retry_count <= max_retries {
        RetryDecision::Retry {
            retry_count,
            delay: backoff_delay(retry_count, unit),
        }
    } else {
        RetryDecision::Fail { retry_count }
    }
}

/// `2^retry_count` units, saturating instead of overflowing.
pub fn backoff_delay(retry_count: u32, unit: Duration) -> Duration {
    let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
    unit.checked_mul(factor).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_three_retries_then_fail() {
        assert_eq!(
            retry_decision(0, 3, MINUTE),
            RetryDecision::Retry { retry_count: 1, delay: 2 * MINUTE }
        );
        assert_eq!(
            retry_decision(1, 3, MINUTE),
            RetryDecision::Retry { retry_count: 2, delay: 4 * MINUTE }
        );
        assert_eq!(
            retry_decision(2, 3, MINUTE),
            RetryDecision::Retry { retry_count: 3, delay: 8 * MINUTE }
        );
        assert_eq!(retry_decision(3, 3, MINUTE), RetryDecision::Fail { retry_count: 4 });
    }

    #[test]
    fn test_zero_max_retries_fails_immediately() {
        assert_eq!(retry_decision(0, 0, MINUTE), RetryDecision::Fail { retry_count: 1 });
    }

    #[test]
    fn test_backoff_saturates() {
        assert_eq!(backoff_delay(40, MINUTE), MINUTE * u32::MAX);
        assert_eq!(backoff_delay(1, Duration::MAX), Duration::MAX);
    }
}
