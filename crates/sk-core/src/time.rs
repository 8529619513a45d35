//! Wall-clock helpers
//!
//! Beacons, registrations and registry entries carry Unix milliseconds.
//! Monotonic deadlines inside a process use `tokio::time::Instant` instead.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch; 0 if the clock reads before 1970.
///
/// ```
/// let stamp = sk_core::time::current_time_millis();
/// assert!(stamp > 1_600_000_000_000);
/// ```
pub fn current_time_millis() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(since_epoch) => since_epoch.as_millis() as u64,
        Err(_) => 0,
    }
}

/// Milliseconds between `stamp` and now, saturating at 0 for stamps from
/// a peer whose clock runs ahead
pub fn elapsed_millis(stamp: u64) -> u64 {
    current_time_millis().saturating_sub(stamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_elapsed_grows() {
        let stamp = current_time_millis();
        std::thread::sleep(Duration::from_millis(10));
        assert!(elapsed_millis(stamp) >= 10);
    }

    #[test]
    fn test_stamp_from_the_future_is_zero_elapsed() {
        assert_eq!(elapsed_millis(current_time_millis() + 60_000), 0);
    }
}
