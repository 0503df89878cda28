//! Exponential backoff arithmetic

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Delay before the given retry.
///
/// # Formula
/// `delay = min(base * 2^(retry - 1), max_delay)`
///
/// `retry` is 1-indexed: the first retry waits `base`. A retry of 0 is
/// treated as 1. The result never decreases as `retry` grows.
#[must_use]
pub fn backoff_delay(retry: u32, base_delay_secs: u64, max_delay_secs: u64) -> Duration {
    let exponent = retry.saturating_sub(1);
    let secs = if exponent >= 63 {
        max_delay_secs
    } else {
        base_delay_secs
            .saturating_mul(1u64 << exponent)
            .min(max_delay_secs)
    };

    Duration::from_secs(secs)
}

/// `now + delay`, saturating at the latest representable instant
#[must_use]
pub fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
