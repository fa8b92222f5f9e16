//! Data-federation executor: runs N source fetches under a strategy and
//! merges the outcome into one consistent view.
//!
//! Strategies differ only in scheduling shape; resilience (breaker gating,
//! bounded retry) and per-source outcome classification are common to all
//! four. "No data" is a valid answer: an empty federated result is success.

pub mod client;
pub mod dedupe;
pub mod executor;
pub mod types;

pub use client::{DemoSourceClient, FetchError, HttpSourceClient, SourceClient};
pub use dedupe::{content_fingerprint, merge_records};
pub use executor::{FederationExecutor, FederationExecutorConfig};
pub use types::{
    FederatedRecords, FederatedResult, FederationError, FetchOutcomeKind, FetchStrategy,
    RecordFilters, SourceFetchReport, SourceRecord,
};
