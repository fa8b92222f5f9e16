use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use lupa_core::ClockFn;
use lupa_resilience::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState};

use crate::types::{Capability, Source, SourceFilters};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Outcome reported back to the registry after a source call.
pub enum CallOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Health projection for one source, derived from its breaker.
pub struct SourceHealth {
    pub source_id: String,
    pub state: CircuitState,
    pub failure_count: usize,
    pub last_failure_at_unix_ms: Option<u64>,
}

/// Owns the static source table and the per-source breakers. Sources never
/// reference each other; health is a map keyed by source id.
pub struct SourceRegistry {
    sources: BTreeMap<String, Source>,
    breakers: BTreeMap<String, Arc<CircuitBreaker>>,
}

impl SourceRegistry {
    pub fn new(catalog: Vec<Source>, breaker_config: CircuitBreakerConfig) -> Self {
        Self::with_clock(catalog, breaker_config, lupa_core::system_clock())
    }

    pub fn with_clock(
        catalog: Vec<Source>,
        breaker_config: CircuitBreakerConfig,
        clock: ClockFn,
    ) -> Self {
        let mut sources = BTreeMap::new();
        let mut breakers = BTreeMap::new();
        for source in catalog {
            breakers.insert(
                source.id.clone(),
                Arc::new(CircuitBreaker::with_clock(breaker_config, clock.clone())),
            );
            sources.insert(source.id.clone(), source);
        }
        Self { sources, breakers }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn get(&self, source_id: &str) -> Option<&Source> {
        self.sources.get(source_id)
    }

    /// Breaker handle for gating an outbound call to `source_id`.
    pub fn breaker(&self, source_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(source_id).cloned()
    }

    /// Returns sources advertising `capability` that pass `filters`, ordered
    /// healthy-first, then priority ascending, then lexicographic id.
    pub fn resolve(&self, capability: Capability, filters: &SourceFilters) -> Vec<Source> {
        let mut matched: Vec<&Source> = self
            .sources
            .values()
            .filter(|source| source.advertises(capability) && filters.matches(source))
            .collect();

        matched.sort_by(|a, b| {
            let a_healthy = self.is_healthy(&a.id);
            let b_healthy = self.is_healthy(&b.id);
            b_healthy
                .cmp(&a_healthy)
                .then(a.priority.cmp(&b.priority))
                .then(a.id.cmp(&b.id))
        });

        matched.into_iter().cloned().collect()
    }

    /// Records a call outcome against the source's breaker.
    pub fn report(&self, source_id: &str, outcome: CallOutcome) {
        let Some(breaker) = self.breakers.get(source_id) else {
            tracing::warn!(source_id, "outcome reported for unknown source");
            return;
        };
        match outcome {
            CallOutcome::Success => breaker.record_success(),
            CallOutcome::Failure => breaker.record_failure(),
        }
    }

    /// Healthy is not a stored flag: it derives from breaker state.
    pub fn is_healthy(&self, source_id: &str) -> bool {
        self.breakers
            .get(source_id)
            .map(|breaker| breaker.is_healthy())
            .unwrap_or(false)
    }

    pub fn health_snapshot(&self) -> Vec<SourceHealth> {
        self.breakers
            .iter()
            .map(|(source_id, breaker)| {
                let BreakerSnapshot {
                    state,
                    failure_count,
                    last_failure_at_unix_ms,
                } = breaker.snapshot();
                SourceHealth {
                    source_id: source_id.clone(),
                    state,
                    failure_count,
                    last_failure_at_unix_ms,
                }
            })
            .collect()
    }
}
