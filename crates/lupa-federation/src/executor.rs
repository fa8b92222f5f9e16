use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::json;

use lupa_core::CooperativeCancellationToken;
use lupa_resilience::{AcquireDecision, FailureClass, RetryPolicy};
use lupa_sources::{CallOutcome, Capability, Source, SourceFilters, SourceRegistry};

use crate::client::{FetchError, SourceClient};
use crate::dedupe::merge_records;
use crate::types::{
    FederatedRecords, FederatedResult, FederationError, FetchOutcomeKind, FetchStrategy,
    RecordFilters, SourceFetchReport, SourceRecord,
};

type EventSink = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
/// Executor tunables. Defaults follow the design-level timeout table.
pub struct FederationExecutorConfig {
    pub per_source_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for FederationExecutorConfig {
    fn default() -> Self {
        Self {
            per_source_timeout_ms: 10_000,
            retry: RetryPolicy::default(),
        }
    }
}

/// Runs N source fetches under one strategy. Every call is
/// breaker-gated(retry-wrapped(fetch)): a source whose breaker is open is
/// never dialed at all.
pub struct FederationExecutor {
    registry: Arc<SourceRegistry>,
    client: Arc<dyn SourceClient>,
    config: FederationExecutorConfig,
    event_sink: Option<EventSink>,
}

struct FetchAttempt {
    report: SourceFetchReport,
    records: Option<Vec<SourceRecord>>,
}

enum CallError {
    TimedOut,
    Fetch(FetchError),
}

impl CallError {
    fn failure_class(&self) -> FailureClass {
        match self {
            Self::TimedOut => FailureClass::Timeout,
            Self::Fetch(error) => error.failure_class(),
        }
    }
}

impl FederationExecutor {
    pub fn new(
        registry: Arc<SourceRegistry>,
        client: Arc<dyn SourceClient>,
        config: FederationExecutorConfig,
    ) -> Self {
        Self {
            registry,
            client,
            config,
            event_sink: None,
        }
    }

    pub fn with_event_sink(mut self, event_sink: EventSink) -> Self {
        self.event_sink = Some(event_sink);
        self
    }

    fn emit(&self, event: serde_json::Value) {
        if let Some(sink) = &self.event_sink {
            sink(event);
        }
    }

    /// Executes one federated fetch. `deadline_ms` bounds the whole call;
    /// sources still in flight at the deadline are cancelled and annotated,
    /// not treated as fatal.
    pub async fn execute(
        &self,
        capability: Capability,
        source_filters: &SourceFilters,
        record_filters: &RecordFilters,
        strategy: FetchStrategy,
        deadline_ms: u64,
        cancel: &CooperativeCancellationToken,
    ) -> Result<FederatedResult, FederationError> {
        let resolved = self.registry.resolve(capability, source_filters);
        tracing::debug!(
            capability = capability.as_str(),
            strategy = strategy.as_str(),
            sources = resolved.len(),
            "federated fetch starting"
        );

        if resolved.is_empty() {
            // No declared source serves this capability+filters: a valid
            // empty answer, not an error.
            return Ok(FederatedResult {
                strategy,
                records: FederatedRecords::Merged {
                    records: Vec::new(),
                },
                missing_sources: Vec::new(),
                partial: false,
                reports: Vec::new(),
                duplicates_dropped: 0,
            });
        }

        let result = match strategy {
            FetchStrategy::Fallback => {
                self.run_fallback(&resolved, capability, record_filters, cancel)
                    .await
            }
            FetchStrategy::Fastest => {
                self.run_fastest(&resolved, capability, record_filters, deadline_ms, cancel)
                    .await
            }
            FetchStrategy::Aggregate | FetchStrategy::Parallel => {
                self.run_concurrent(
                    &resolved,
                    capability,
                    record_filters,
                    strategy,
                    deadline_ms,
                    cancel,
                )
                .await
            }
        };

        if let Ok(federated) = &result {
            self.emit(json!({
                "type": "federation_completed",
                "capability": capability.as_str(),
                "strategy": strategy.as_str(),
                "total_records": federated.total_records(),
                "duplicates_dropped": federated.duplicates_dropped,
                "partial": federated.partial,
                "missing_sources": federated.missing_sources,
            }));
        }
        result
    }

    /// One breaker-gated, retry-wrapped call against a single source.
    async fn fetch_one(
        &self,
        source: &Source,
        capability: Capability,
        record_filters: &RecordFilters,
    ) -> FetchAttempt {
        let started = Instant::now();
        let Some(breaker) = self.registry.breaker(&source.id) else {
            return FetchAttempt {
                report: SourceFetchReport {
                    source_id: source.id.clone(),
                    outcome: FetchOutcomeKind::PermanentFailure,
                    records_fetched: 0,
                    elapsed_ms: 0,
                    failure_class: Some(FailureClass::Invalid),
                },
                records: None,
            };
        };

        match breaker.try_acquire() {
            AcquireDecision::Reject { retry_at_unix_ms } => {
                self.emit(json!({
                    "type": "federation_circuit_skip",
                    "source_id": source.id,
                    "retry_at_unix_ms": retry_at_unix_ms,
                }));
                return FetchAttempt {
                    report: SourceFetchReport {
                        source_id: source.id.clone(),
                        outcome: FetchOutcomeKind::CircuitOpen,
                        records_fetched: 0,
                        elapsed_ms: 0,
                        failure_class: None,
                    },
                    records: None,
                };
            }
            AcquireDecision::Allow | AcquireDecision::AllowProbe => {}
        }

        let per_source_timeout =
            std::time::Duration::from_millis(self.config.per_source_timeout_ms.max(1));
        let client = self.client.clone();
        let outcome = self
            .config
            .retry
            .run(
                move |_attempt| {
                    let client = client.clone();
                    async move {
                        match tokio::time::timeout(
                            per_source_timeout,
                            client.fetch(source, capability, record_filters),
                        )
                        .await
                        {
                            Ok(Ok(records)) => Ok(records),
                            Ok(Err(error)) => Err(CallError::Fetch(error)),
                            Err(_) => Err(CallError::TimedOut),
                        }
                    }
                },
                CallError::failure_class,
            )
            .await;

        let elapsed_ms = started.elapsed().as_millis().try_into().unwrap_or(u64::MAX);
        match outcome {
            Ok(records) => {
                self.registry.report(&source.id, CallOutcome::Success);
                FetchAttempt {
                    report: SourceFetchReport {
                        source_id: source.id.clone(),
                        outcome: FetchOutcomeKind::Ok,
                        records_fetched: records.len(),
                        elapsed_ms,
                        failure_class: None,
                    },
                    records: Some(records),
                }
            }
            Err(error) => {
                self.registry.report(&source.id, CallOutcome::Failure);
                let class = error.failure_class();
                let outcome = match class {
                    FailureClass::Timeout => FetchOutcomeKind::Timeout,
                    class if class.is_transient() => FetchOutcomeKind::TransientFailure,
                    _ => FetchOutcomeKind::PermanentFailure,
                };
                self.emit(json!({
                    "type": "federation_source_failed",
                    "source_id": source.id,
                    "outcome": outcome.as_str(),
                    "failure_class": class.as_str(),
                }));
                FetchAttempt {
                    report: SourceFetchReport {
                        source_id: source.id.clone(),
                        outcome,
                        records_fetched: 0,
                        elapsed_ms,
                        failure_class: Some(class),
                    },
                    records: None,
                }
            }
        }
    }

    async fn run_fallback(
        &self,
        resolved: &[Source],
        capability: Capability,
        record_filters: &RecordFilters,
        cancel: &CooperativeCancellationToken,
    ) -> Result<FederatedResult, FederationError> {
        let mut reports = Vec::new();
        for source in resolved {
            if cancel.is_cancelled() {
                reports.push(cancelled_report(&source.id));
                continue;
            }
            let attempt = self.fetch_one(source, capability, record_filters).await;
            let succeeded = attempt.report.outcome.is_success();
            reports.push(attempt.report);
            if succeeded {
                let records = attempt.records.unwrap_or_default();
                return Ok(FederatedResult {
                    strategy: FetchStrategy::Fallback,
                    records: FederatedRecords::Merged { records },
                    missing_sources: Vec::new(),
                    partial: false,
                    reports,
                    duplicates_dropped: 0,
                });
            }
        }
        Err(self.exhaustion_error(reports))
    }

    async fn run_fastest(
        &self,
        resolved: &[Source],
        capability: Capability,
        record_filters: &RecordFilters,
        deadline_ms: u64,
        cancel: &CooperativeCancellationToken,
    ) -> Result<FederatedResult, FederationError> {
        let deadline = tokio::time::Instant::now()
            + std::time::Duration::from_millis(deadline_ms.max(1));
        let mut in_flight: FuturesUnordered<_> = resolved
            .iter()
            .map(|source| async move {
                self.fetch_one(source, capability, record_filters).await
            })
            .collect();

        let mut reports = Vec::new();
        loop {
            let next = tokio::select! {
                attempt = in_flight.next() => attempt,
                _ = cancel.cancelled() => None,
                _ = tokio::time::sleep_until(deadline) => None,
            };
            let Some(attempt) = next else {
                // Deadline, cancellation, or exhaustion without a winner.
                if reports.is_empty() || !in_flight.is_empty() {
                    drop(in_flight);
                    let completed: Vec<String> = reports
                        .iter()
                        .map(|report: &SourceFetchReport| report.source_id.clone())
                        .collect();
                    for source in resolved {
                        if !completed.contains(&source.id) {
                            reports.push(cancelled_report(&source.id));
                        }
                    }
                }
                return Err(self.exhaustion_error(reports));
            };

            let succeeded = attempt.report.outcome.is_success();
            reports.push(attempt.report);
            if !succeeded {
                continue;
            }

            // Winner found: dropping the remaining futures cancels the
            // losing peers, which still show up in telemetry as cancelled.
            drop(in_flight);
            let completed: Vec<String> =
                reports.iter().map(|report| report.source_id.clone()).collect();
            for source in resolved {
                if !completed.contains(&source.id) {
                    reports.push(cancelled_report(&source.id));
                }
            }
            let records = attempt.records.unwrap_or_default();
            return Ok(FederatedResult {
                strategy: FetchStrategy::Fastest,
                records: FederatedRecords::Merged { records },
                missing_sources: Vec::new(),
                partial: false,
                reports,
                duplicates_dropped: 0,
            });
        }
    }

    async fn run_concurrent(
        &self,
        resolved: &[Source],
        capability: Capability,
        record_filters: &RecordFilters,
        strategy: FetchStrategy,
        deadline_ms: u64,
        cancel: &CooperativeCancellationToken,
    ) -> Result<FederatedResult, FederationError> {
        let deadline = tokio::time::Instant::now()
            + std::time::Duration::from_millis(deadline_ms.max(1));

        let fetches = resolved.iter().map(|source| {
            let source_id = source.id.clone();
            async move {
                tokio::select! {
                    attempt = self.fetch_one(source, capability, record_filters) => attempt,
                    _ = cancel.cancelled() => FetchAttempt {
                        report: cancelled_report(&source_id),
                        records: None,
                    },
                    _ = tokio::time::sleep_until(deadline) => FetchAttempt {
                        report: cancelled_report(&source_id),
                        records: None,
                    },
                }
            }
        });
        let attempts = futures_util::future::join_all(fetches).await;

        let mut reports = Vec::new();
        let mut per_source: Vec<(String, Vec<SourceRecord>)> = Vec::new();
        for attempt in attempts {
            if let Some(records) = attempt.records {
                per_source.push((attempt.report.source_id.clone(), records));
            }
            reports.push(attempt.report);
        }

        if per_source.is_empty()
            && reports
                .iter()
                .all(|report| report.outcome == FetchOutcomeKind::CircuitOpen)
        {
            return Err(FederationError::AllSourcesUnavailable {
                source_ids: reports.into_iter().map(|report| report.source_id).collect(),
            });
        }

        let missing_sources: Vec<String> = reports
            .iter()
            .filter(|report| !report.outcome.is_success())
            .map(|report| report.source_id.clone())
            .collect();
        let partial = !missing_sources.is_empty();

        let (records, duplicates_dropped) = match strategy {
            FetchStrategy::Parallel => (
                FederatedRecords::Grouped {
                    by_source: per_source.into_iter().collect::<BTreeMap<_, _>>(),
                },
                0,
            ),
            _ => {
                let ranked: Vec<String> =
                    resolved.iter().map(|source| source.id.clone()).collect();
                let (merged, dropped) = merge_records(per_source, &ranked);
                (FederatedRecords::Merged { records: merged }, dropped)
            }
        };

        Ok(FederatedResult {
            strategy,
            records,
            missing_sources,
            partial,
            reports,
            duplicates_dropped,
        })
    }

    fn exhaustion_error(&self, reports: Vec<SourceFetchReport>) -> FederationError {
        if !reports.is_empty()
            && reports
                .iter()
                .all(|report| report.outcome == FetchOutcomeKind::CircuitOpen)
        {
            return FederationError::AllSourcesUnavailable {
                source_ids: reports.into_iter().map(|report| report.source_id).collect(),
            };
        }
        FederationError::AllAttemptsFailed { reports }
    }
}

fn cancelled_report(source_id: &str) -> SourceFetchReport {
    SourceFetchReport {
        source_id: source_id.to_string(),
        outcome: FetchOutcomeKind::Cancelled,
        records_fetched: 0,
        elapsed_ms: 0,
        failure_class: None,
    }
}
