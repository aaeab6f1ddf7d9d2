//! Exponential backoff shared by the job queue and the webhook dispatcher.

use std::time::Duration;

use rand::Rng;

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped at `max`.
///
/// `attempt == 0` is treated as the first attempt.
#[must_use]
pub fn exponential_backoff(base: Duration, attempt: u32, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let factor = 1u32 << exponent;
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// Add up to `ratio` of `delay` as random jitter (`ratio` is clamped to `0.0..=1.0`).
#[must_use]
pub fn with_jitter(delay: Duration, ratio: f64) -> Duration {
    let ratio = ratio.clamp(0.0, 1.0);
    if ratio == 0.0 || delay.is_zero() {
        return delay;
    }
    let extra = rand::rng().random_range(0.0..=ratio);
    delay + delay.mul_f64(extra)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_per_attempt() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(300);
        assert_eq!(exponential_backoff(base, 1, cap), Duration::from_secs(1));
        assert_eq!(exponential_backoff(base, 2, cap), Duration::from_secs(2));
        assert_eq!(exponential_backoff(base, 3, cap), Duration::from_secs(4));
        assert_eq!(exponential_backoff(base, 4, cap), Duration::from_secs(8));
    }

    #[test]
    fn respects_ceiling() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(10);
        assert_eq!(exponential_backoff(base, 8, cap), cap);
        assert_eq!(exponential_backoff(base, u32::MAX, cap), cap);
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let delay = Duration::from_millis(1000);
        for _ in 0..100 {
            let jittered = with_jitter(delay, 0.1);
            assert!(jittered >= delay);
            assert!(jittered <= Duration::from_millis(1100));
        }
        assert_eq!(with_jitter(delay, 0.0), delay);
    }
}
