//! Resilience primitives fronting every external data source call.
//!
//! Three composable constructs: a per-source circuit breaker, a bounded retry
//! policy with jittered exponential backoff, and an ordered fallback chain.
//! A federated call is breaker-gated(retry-wrapped(operation)) inside one
//! fallback position.

pub mod breaker;
pub mod fallback_chain;
pub mod retry_policy;

pub use breaker::{
    AcquireDecision, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};
pub use fallback_chain::run_fallback_chain;
pub use retry_policy::{FailureClass, RetryPolicy};
