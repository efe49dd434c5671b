//! Backoff delay calculation.
//!
//! Pure functions mapping an attempt number to a delay. Attempt numbers are
//! 1-based; attempt 0 is treated as the first attempt.

use std::time::Duration;

/// `initial * multiplier^(attempt - 1)`, clamped to `max`.
pub fn exponential(initial: Duration, multiplier: f64, attempt: u32, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let delay_secs = initial.as_secs_f64() * multiplier.powi(exponent);

    // Overflowing or non-finite products saturate at the cap.
    if !delay_secs.is_finite() || delay_secs >= max.as_secs_f64() {
        return max;
    }
    Duration::from_secs_f64(delay_secs.max(0.0))
}

/// `initial * attempt`, saturating.
pub fn linear(initial: Duration, attempt: u32) -> Duration {
    initial.saturating_mul(attempt.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_and_cap() {
        let initial = Duration::from_millis(100);
        let max = Duration::from_millis(1000);
        assert_eq!(exponential(initial, 2.0, 1, max), Duration::from_millis(100));
        assert_eq!(exponential(initial, 2.0, 2, max), Duration::from_millis(200));
        assert_eq!(exponential(initial, 2.0, 3, max), Duration::from_millis(400));
        assert_eq!(exponential(initial, 2.0, 5, max), max);
        assert_eq!(exponential(initial, 2.0, u32::MAX, max), max);
    }

    #[test]
    fn test_exponential_is_monotonic() {
        let initial = Duration::from_millis(50);
        let max = Duration::from_secs(30);
        let mut previous = Duration::ZERO;
        for attempt in 1..64 {
            let delay = exponential(initial, 1.5, attempt, max);
            assert!(delay >= previous, "attempt {attempt}: {delay:?} < {previous:?}");
            assert!(delay <= max);
            previous = delay;
        }
        assert_eq!(previous, max);
    }

    #[test]
    fn test_linear() {
        let initial = Duration::from_millis(250);
        assert_eq!(linear(initial, 1), Duration::from_millis(250));
        assert_eq!(linear(initial, 4), Duration::from_secs(1));
        assert_eq!(linear(initial, 0), Duration::from_millis(250));
    }
}
