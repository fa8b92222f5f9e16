//! Provider-side retry helpers layered over the shared retry policy.
//!
//! Backoff, jitter, and transience rules live in `lupa_resilience`; this
//! module only adds what an HTTP completion provider knows: transport-error
//! classification, `Retry-After` parsing, and a wall-clock retry budget.

use chrono::{DateTime, Utc};
use reqwest::header::RETRY_AFTER;

use lupa_core::{current_unix_timestamp_ms, elapsed_ms_since};
use lupa_resilience::{FailureClass, RetryPolicy};

/// Maps a transport-level failure onto the shared failure classes.
pub fn classify_transport_error(error: &reqwest::Error) -> FailureClass {
    if error.is_timeout() {
        FailureClass::Timeout
    } else if error.is_connect() || error.is_request() || error.is_body() {
        FailureClass::Network
    } else {
        FailureClass::Invalid
    }
}

/// Parses a `Retry-After` header into milliseconds. Accepts both the
/// delta-seconds and the HTTP-date forms; a date in the past reads as zero.
pub fn parse_retry_after_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(seconds.saturating_mul(1_000));
    }
    let retry_at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    let wait_ms = retry_at.signed_duration_since(Utc::now()).num_milliseconds();
    u64::try_from(wait_ms.max(0)).ok()
}

/// Delay before the attempt after `attempt`: the policy's backoff, floored
/// by whatever the provider asked for via `Retry-After`.
pub fn completion_retry_delay_ms(
    policy: &RetryPolicy,
    attempt: usize,
    retry_after_ms: Option<u64>,
) -> u64 {
    let backoff_ms = policy.backoff_ms(attempt);
    match retry_after_ms {
        Some(floor_ms) => backoff_ms.max(floor_ms),
        None => backoff_ms,
    }
}

#[derive(Debug, Clone, Copy)]
/// Wall-clock cap on one completion call's retries. A zero budget disables
/// the cap.
pub struct RetryBudget {
    budget_ms: u64,
    started_unix_ms: u64,
}

impl RetryBudget {
    pub fn start(budget_ms: u64) -> Self {
        Self {
            budget_ms,
            started_unix_ms: current_unix_timestamp_ms(),
        }
    }

    /// Whether sleeping `delay_ms` more still fits inside the budget.
    pub fn allows_delay(&self, delay_ms: u64) -> bool {
        if self.budget_ms == 0 {
            return true;
        }
        elapsed_ms_since(self.started_unix_ms).saturating_add(delay_ms) <= self.budget_ms
    }
}
