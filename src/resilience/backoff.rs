//! Backoff curves.
//!
//! - [`calculate_backoff`]: jittered exponential delay before a retry
//! - [`probe_interval`]: deterministic, capped probe spacing for dead backends

use rand::Rng;
use std::time::Duration;

/// Calculate exponential backoff delay with jitter.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let delay_ms = base_ms.saturating_mul(exponential_base);
    let capped_delay = delay_ms.min(max_ms);

    // Apply jitter (0 to 10% of the delay)
    let jitter_range = capped_delay / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay + jitter)
}

/// Interval before the next probe of a backend that has failed `failed_probes`
/// probes in a row while UNHEALTHY: `min(base * 2^k, max)`.
pub fn probe_interval(failed_probes: u32, base: Duration, max: Duration) -> Duration {
    let max = max.max(base);
    let factor = 2u32.saturating_pow(failed_probes.min(31));
    base.checked_mul(factor).map_or(max, |d| d.min(max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let b1 = calculate_backoff(1, 100, 2000);
        assert!(b1.as_millis() >= 100);

        let b2 = calculate_backoff(2, 100, 2000);
        assert!(b2.as_millis() >= 200);

        let max = calculate_backoff(10, 100, 1000);
        assert!(max.as_millis() >= 1000);
        assert!(max.as_millis() < 1100);
    }

    #[test]
    fn probe_interval_doubles_up_to_cap() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(10);
        let seen: Vec<u64> = (0..6).map(|k| probe_interval(k, base, cap).as_secs()).collect();
        assert_eq!(seen, vec![1, 2, 4, 8, 10, 10]);
        assert_eq!(probe_interval(200, base, cap), cap);
    }

    #[test]
    fn probe_interval_cap_below_base_uses_base() {
        let base = Duration::from_secs(5);
        assert_eq!(probe_interval(3, base, Duration::from_secs(1)), base);
    }
}
