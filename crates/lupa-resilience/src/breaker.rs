use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use lupa_core::ClockFn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Tunables for a per-source circuit breaker.
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub window_ms: u64,
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_ms: 60_000,
            cooldown_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Observable breaker state.
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Result of asking the breaker for permission to issue a call.
pub enum AcquireDecision {
    /// Normal closed-state call.
    Allow,
    /// Half-open single-in-flight probe; the caller MUST report the outcome.
    AllowProbe,
    /// Breaker is open (or a probe is already in flight); no call may be issued.
    Reject { retry_at_unix_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Point-in-time view of breaker health for registry ordering and /health.
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: usize,
    pub last_failure_at_unix_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct BreakerInner {
    state: CircuitState,
    failure_count: usize,
    window_started_unix_ms: u64,
    opened_at_unix_ms: u64,
    probe_in_flight: bool,
    probe_started_unix_ms: u64,
    last_failure_at_unix_ms: Option<u64>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            window_started_unix_ms: 0,
            opened_at_unix_ms: 0,
            probe_in_flight: false,
            probe_started_unix_ms: 0,
            last_failure_at_unix_ms: None,
        }
    }
}

/// Stateful gate fronting one source. State machine:
/// closed -> open on `failure_threshold` failures inside `window_ms`;
/// open -> half_open after `cooldown_ms`; half_open -> closed on one probe
/// success, back to open on any probe failure.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    clock: ClockFn,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, lupa_core::system_clock())
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: ClockFn) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner::new()),
            clock,
        }
    }

    /// Asks for permission to issue one call. `AllowProbe` grants the single
    /// half-open probe; concurrent callers are rejected until its outcome is
    /// reported.
    pub fn try_acquire(&self) -> AcquireDecision {
        let now = (self.clock)();
        let mut inner = lock_or_recover(&self.inner);
        match inner.state {
            CircuitState::Closed => AcquireDecision::Allow,
            CircuitState::Open => {
                let retry_at = inner.opened_at_unix_ms.saturating_add(self.config.cooldown_ms);
                if now < retry_at {
                    return AcquireDecision::Reject {
                        retry_at_unix_ms: retry_at,
                    };
                }
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = true;
                inner.probe_started_unix_ms = now;
                AcquireDecision::AllowProbe
            }
            CircuitState::HalfOpen => {
                // A probe whose caller was cancelled and never reported back
                // is reclaimed after one cooldown, keeping the gate live.
                let probe_stale = inner.probe_in_flight
                    && now.saturating_sub(inner.probe_started_unix_ms) > self.config.cooldown_ms;
                if inner.probe_in_flight && !probe_stale {
                    let retry_at = inner.opened_at_unix_ms.saturating_add(self.config.cooldown_ms);
                    AcquireDecision::Reject {
                        retry_at_unix_ms: retry_at,
                    }
                } else {
                    inner.probe_in_flight = true;
                    inner.probe_started_unix_ms = now;
                    AcquireDecision::AllowProbe
                }
            }
        }
    }

    /// Records a successful call. A half-open probe success closes the
    /// breaker and clears the failure window.
    pub fn record_success(&self) {
        let mut inner = lock_or_recover(&self.inner);
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.probe_in_flight = false;
    }

    /// Records a failed call. Failures inside the rolling window count toward
    /// the threshold; any half-open probe failure reopens immediately.
    pub fn record_failure(&self) {
        let now = (self.clock)();
        let mut inner = lock_or_recover(&self.inner);
        inner.last_failure_at_unix_ms = Some(now);
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at_unix_ms = now;
                inner.probe_in_flight = false;
                inner.failure_count = 0;
                tracing::debug!(opened_at_unix_ms = now, "circuit probe failed, reopening");
            }
            CircuitState::Open => {}
            CircuitState::Closed => {
                if now.saturating_sub(inner.window_started_unix_ms) > self.config.window_ms {
                    inner.window_started_unix_ms = now;
                    inner.failure_count = 0;
                }
                inner.failure_count = inner.failure_count.saturating_add(1);
                if inner.failure_count >= self.config.failure_threshold.max(1) {
                    inner.state = CircuitState::Open;
                    inner.opened_at_unix_ms = now;
                    inner.failure_count = 0;
                    tracing::debug!(opened_at_unix_ms = now, "circuit opened after threshold");
                }
            }
        }
    }

    /// Current state, evaluated against the clock so an expired cooldown
    /// reads as half-open even before the next acquire.
    pub fn state(&self) -> CircuitState {
        let now = (self.clock)();
        let inner = lock_or_recover(&self.inner);
        match inner.state {
            CircuitState::Open
                if now >= inner.opened_at_unix_ms.saturating_add(self.config.cooldown_ms) =>
            {
                CircuitState::HalfOpen
            }
            state => state,
        }
    }

    /// True when the breaker would admit a normal (non-probe) call.
    pub fn is_healthy(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state();
        let inner = lock_or_recover(&self.inner);
        BreakerSnapshot {
            state,
            failure_count: inner.failure_count,
            last_failure_at_unix_ms: inner.last_failure_at_unix_ms,
        }
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
