//! Reconnect delays.
//!
//! Reconnects happen at a fixed interval; optional jitter spreads clients
//! that lost the same server so they do not reconnect in lockstep.

use std::time::Duration;
use rand::Rng;

/// Fixed reconnect interval plus up to `jitter` (fraction of the interval) of random delay.
pub fn reconnect_delay(interval: Duration, jitter: f64) -> Duration {
    let base_ms = interval.as_millis() as u64;
    let jitter = jitter.clamp(0.0, 1.0);
    let jitter_range = (base_ms as f64 * jitter) as u64;
    let extra = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };
    Duration::from_millis(base_ms + extra)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_jitter_is_exact() {
        assert_eq!(reconnect_delay(Duration::from_millis(5000), 0.0), Duration::from_millis(5000));
    }

    #[test]
    fn jitter_stays_in_range() {
        for _ in 0..100 {
            let d = reconnect_delay(Duration::from_millis(1000), 0.2);
            assert!(d >= Duration::from_millis(1000));
            assert!(d < Duration::from_millis(1200));
        }
        // Out-of-range fractions are clamped.
        assert!(reconnect_delay(Duration::from_millis(100), 7.0) < Duration::from_millis(200));
    }
}
