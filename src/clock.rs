//! Timestamp normalization utilities.
//!
//! Versions, tag floors and lock expiries are all floating-point Unix
//! timestamps written by independent processes. Reading back a float that
//! went through the backend and comparing it against a locally computed one
//! only works if both sides round to the same precision, so every timestamp
//! is passed through [`normalize`] before it is stored or compared.

use std::time::{SystemTime, UNIX_EPOCH};

/// Decimal places kept by [`normalize`]. Microsecond precision, matching
/// what the backend round-trips without drift.
const TIME_PRECISION: i32 = 6;

/// Current Unix time in seconds, with sub-second precision.
pub fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Round a timestamp to the fixed precision used throughout the store.
///
/// Idempotent: `normalize(normalize(t)) == normalize(t)`.
pub fn normalize(time: f64) -> f64 {
    let factor = 10f64.powi(TIME_PRECISION);
    (time * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalize_rounds_to_microseconds() {
        assert_eq!(normalize(1700000000.123456789), 1700000000.123457);
        assert_eq!(normalize(2.0000004), 2.0);
        assert_eq!(normalize(2.0000006), 2.000001);
    }

    #[test]
    fn test_normalize_of_now_is_stable() {
        let t = normalize(now());
        assert_eq!(t, normalize(t));
    }

    proptest! {
        #[test]
        fn prop_normalize_idempotent(t in 0f64..4102444800f64) {
            let once = normalize(t);
            prop_assert_eq!(once, normalize(once));
        }

        #[test]
        fn prop_normalize_close_to_input(t in 0f64..4102444800f64) {
            prop_assert!((normalize(t) - t).abs() < 1e-6 + f64::EPSILON * t);
        }
    }
}
