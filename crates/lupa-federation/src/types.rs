use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use lupa_resilience::FailureClass;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
/// Scheduling shape of a federated fetch.
pub enum FetchStrategy {
    /// Try sources in priority order; stop at the first success.
    Fallback,
    /// Start all concurrently; first success wins, peers are cancelled.
    Fastest,
    /// Start all concurrently; wait for all (or the deadline); dedupe and merge.
    Aggregate,
    /// Start all concurrently; wait for all; keep per-source grouping.
    Parallel,
}

impl FetchStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fallback => "fallback",
            Self::Fastest => "fastest",
            Self::Aggregate => "aggregate",
            Self::Parallel => "parallel",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
/// Filters derived from extracted entities, forwarded to source adapters.
pub struct RecordFilters {
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub date_from: Option<String>,
    #[serde(default)]
    pub date_to: Option<String>,
    #[serde(default)]
    pub value_min_centavos: Option<i64>,
    #[serde(default)]
    pub value_max_centavos: Option<i64>,
    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// One normalized record fetched from a source.
pub struct SourceRecord {
    /// Contract number when the upstream payload carries one.
    #[serde(default)]
    pub contract_id: Option<String>,
    /// Generic document number, the second dedupe key in precedence.
    #[serde(default)]
    pub document_number: Option<String>,
    pub organization: String,
    /// ISO-8601 date the record refers to.
    pub date: String,
    /// Monetary value in centavos; absent for non-monetary records.
    #[serde(default)]
    pub value_centavos: Option<i64>,
    #[serde(default)]
    pub description: String,
    /// Raw upstream payload, kept for the analysis agents.
    #[serde(default)]
    pub payload: Value,
    /// Source ids that contributed this record; the first is the winner of
    /// any dedupe tie.
    #[serde(default)]
    pub provenance: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Per-source outcome classification surfaced in provenance.
pub enum FetchOutcomeKind {
    Ok,
    TransientFailure,
    PermanentFailure,
    Timeout,
    CircuitOpen,
    /// Fastest-strategy peers cancelled after the winner, and deadline
    /// cancellations requested by the caller.
    Cancelled,
}

impl FetchOutcomeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::TransientFailure => "transient_failure",
            Self::PermanentFailure => "permanent_failure",
            Self::Timeout => "timeout",
            Self::CircuitOpen => "circuit_open",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Ok)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// What happened to one source during a federated fetch.
pub struct SourceFetchReport {
    pub source_id: String,
    pub outcome: FetchOutcomeKind,
    pub records_fetched: usize,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_class: Option<FailureClass>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "shape", rename_all = "snake_case")]
/// Records in the shape the strategy promised.
pub enum FederatedRecords {
    /// `fallback`/`fastest`/`aggregate`: one flat list.
    Merged { records: Vec<SourceRecord> },
    /// `parallel`: per-source grouping preserved.
    Grouped {
        by_source: BTreeMap<String, Vec<SourceRecord>>,
    },
}

impl FederatedRecords {
    pub fn total_records(&self) -> usize {
        match self {
            Self::Merged { records } => records.len(),
            Self::Grouped { by_source } => by_source.values().map(Vec::len).sum(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Outcome of one federated fetch.
pub struct FederatedResult {
    pub strategy: FetchStrategy,
    pub records: FederatedRecords,
    /// Sources that answered nothing before the deadline or failed; their
    /// absence from the merged view is an annotation, not an error.
    pub missing_sources: Vec<String>,
    /// True when at least one resolved source is missing from the result.
    pub partial: bool,
    pub reports: Vec<SourceFetchReport>,
    /// Duplicates removed during an aggregate merge.
    pub duplicates_dropped: usize,
}

impl FederatedResult {
    pub fn total_records(&self) -> usize {
        self.records.total_records()
    }
}

#[derive(Debug, Error)]
/// Failures that make a federated fetch unusable as a whole.
pub enum FederationError {
    /// Every resolved source was shed by its breaker; no network call was
    /// issued at all.
    #[error("all sources unavailable (circuit open): {source_ids:?}")]
    AllSourcesUnavailable { source_ids: Vec<String> },
    /// A single-winner strategy (`fallback`/`fastest`) exhausted every
    /// source without one success.
    #[error("no source produced a usable response")]
    AllAttemptsFailed { reports: Vec<SourceFetchReport> },
}
