//! Protocol timestamps: nanoseconds since the Unix epoch

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn now_ns() -> u64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .map(|n| n as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ns_is_monotonic_enough() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
        // Sanity: later than 2020-01-01 in nanoseconds
        assert!(a > 1_577_836_800_000_000_000);
    }
}
