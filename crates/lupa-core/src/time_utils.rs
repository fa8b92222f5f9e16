const DAY_MS: u64 = 24 * 60 * 60 * 1_000;

fn since_epoch() -> std::time::Duration {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
}

/// Current Unix timestamp in milliseconds, the unit every investigation
/// timestamp and trace duration is recorded in.
pub fn current_unix_timestamp_ms() -> u64 {
    u64::try_from(since_epoch().as_millis()).unwrap_or(u64::MAX)
}

/// Milliseconds elapsed since `start_unix_ms`; zero when the clock moved
/// backwards. Used for `processing_time_ms` and retry-budget accounting.
pub fn elapsed_ms_since(start_unix_ms: u64) -> u64 {
    current_unix_timestamp_ms().saturating_sub(start_unix_ms)
}

/// Expiry stamp for a retained record: `now` plus the retention window in
/// days. Drives the episodic-memory retention sweep.
pub fn retention_expiry_unix_ms(now_unix_ms: u64, retention_days: u64) -> u64 {
    now_unix_ms.saturating_add(retention_days.saturating_mul(DAY_MS))
}
