//! Conversions between `std::time::Duration` and `chrono`.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Convert a std duration into a chrono duration, saturating on overflow.
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// `now + duration`, saturating at the maximum representable instant.
pub fn after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    now.checked_add_signed(to_chrono(duration))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `now - duration`, saturating at the minimum representable instant.
pub fn before(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(to_chrono(duration))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Milliseconds elapsed between two instants, clamped at zero.
pub fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    (to - from).num_milliseconds().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn after_and_before_are_symmetric() {
        let now = Utc::now();
        let d = Duration::from_secs(90);
        assert_eq!(before(after(now, d), d), now);
    }

    #[test]
    fn huge_durations_saturate() {
        let now = Utc::now();
        assert_eq!(after(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(before(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn elapsed_never_negative() {
        let now = Utc::now();
        assert_eq!(elapsed_ms(now, before(now, Duration::from_secs(1))), 0);
        assert_eq!(elapsed_ms(before(now, Duration::from_millis(250)), now), 250);
    }
}
