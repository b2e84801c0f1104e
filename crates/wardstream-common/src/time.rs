//! ---
//! ws_section: "01-core-functionality"
//! ws_subsection: "module"
//! ws_type: "source"
//! ws_scope: "code"
//! ws_description: "Shared primitives and utilities for the streaming runtime."
//! ws_version: "v0.1.0"
//! ws_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Wall-clock timestamp used for samples and notices.
pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

/// Seconds elapsed from `earlier` to `later` as a float; negative if reversed.
pub fn seconds_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    let delta = later.signed_duration_since(earlier);
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => delta.num_milliseconds() as f64 / 1_000.0,
    }
}

/// Convert a duration into fractional milliseconds.
pub fn duration_to_millis_f64(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_between_handles_order() {
        let start = Utc::now();
        let later = start + chrono::Duration::milliseconds(1500);
        assert!((seconds_between(start, later) - 1.5).abs() < 1e-9);
        assert!((seconds_between(later, start) + 1.5).abs() < 1e-9);
    }

    #[test]
    fn millis_conversion() {
        assert_eq!(duration_to_millis_f64(Duration::from_micros(2500)), 2.5);
    }
}
