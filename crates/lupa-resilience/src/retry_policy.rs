use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

const BASE_BACKOFF_MS: u64 = 200;

static JITTER_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Deterministic jitter source: xorshift64 over a shared counter.
fn next_jitter() -> u64 {
    let mut x = JITTER_COUNTER.fetch_add(1, Ordering::Relaxed) | 1;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Classified cause of a failed source call. Escalation carries one of these,
/// never a raw wire error.
pub enum FailureClass {
    Network,
    ServerError,
    Timeout,
    RateLimited,
    Auth,
    Client,
    Invalid,
}

impl FailureClass {
    /// Transient classes are the only ones a retry may follow.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Network | Self::ServerError | Self::Timeout | Self::RateLimited
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::ServerError => "server_error",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Auth => "auth",
            Self::Client => "client",
            Self::Invalid => "invalid",
        }
    }

    /// Maps an HTTP status to its failure class.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Auth,
            408 => Self::Timeout,
            429 => Self::RateLimited,
            status if status >= 500 => Self::ServerError,
            status if status >= 400 => Self::Client,
            _ => Self::Invalid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Bounded retry with exponential backoff and deterministic bounded jitter.
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            jitter: false,
        }
    }

    /// Whether a further attempt is permitted after `attempt` (0-based) failed
    /// with `class`.
    pub fn allows_retry(&self, attempt: usize, class: FailureClass) -> bool {
        class.is_transient() && attempt.saturating_add(1) < self.max_attempts.max(1)
    }

    /// Delay before the attempt following `attempt`. Jitter stays in
    /// [50%, 100%] of the deterministic backoff.
    pub fn backoff_ms(&self, attempt: usize) -> u64 {
        let shift = attempt.min(6);
        let base = BASE_BACKOFF_MS.saturating_mul(1_u64 << shift);
        if !self.jitter || base <= 1 {
            return base;
        }
        let low = base / 2;
        let width = base - low;
        low.saturating_add(next_jitter() % width.saturating_add(1))
    }

    /// Runs `operation` under this policy. `classify` turns the error into a
    /// [`FailureClass`]; non-transient classes return immediately.
    pub async fn run<T, E, Fut, Op, Classify>(
        &self,
        mut operation: Op,
        classify: Classify,
    ) -> Result<T, E>
    where
        Op: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        Classify: Fn(&E) -> FailureClass,
    {
        let mut attempt = 0usize;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let class = classify(&error);
                    if !self.allows_retry(attempt, class) {
                        return Err(error);
                    }
                    let delay_ms = self.backoff_ms(attempt);
                    tracing::debug!(
                        attempt,
                        class = class.as_str(),
                        delay_ms,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
            }
        }
    }
}
