//! Foundational utilities shared across Lupa crates: investigation clocks,
//! request-id generation, and the cooperative cancellation token.

pub mod cancellation;
pub mod request_id;
pub mod time_utils;

pub use cancellation::CooperativeCancellationToken;
pub use request_id::new_request_id;
pub use time_utils::{current_unix_timestamp_ms, elapsed_ms_since, retention_expiry_unix_ms};

/// Shared injectable millisecond clock so stateful components stay
/// deterministic under test.
pub type ClockFn = std::sync::Arc<dyn Fn() -> u64 + Send + Sync>;

/// Returns a clock backed by the system wall clock.
pub fn system_clock() -> ClockFn {
    std::sync::Arc::new(current_unix_timestamp_ms)
}
