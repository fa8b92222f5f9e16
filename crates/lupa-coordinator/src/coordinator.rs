use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde_json::{json, Value};

use lupa_agents::AgentContext;
use lupa_core::{
    current_unix_timestamp_ms, elapsed_ms_since, new_request_id, CooperativeCancellationToken,
};
use lupa_federation::{
    FederatedRecords, FederationError, FederationExecutor, SourceRecord,
};
use lupa_memory::{EpisodicMemory, WorkingContextStore};
use lupa_planner::{ExecutionPlan, Intent, IntentKind, PlanError, QueryPlanner};
use lupa_router::Router;
use lupa_store::{
    Investigation, InvestigationPhase, InvestigationStatus, InvestigationStore,
};
use lupa_stream::{chunk_text_by_words, StreamEmitter, StreamEvent};

use crate::outcome::{ChatOutcome, Query};

#[derive(Debug, Clone, Copy)]
/// Coordinator tunables; defaults follow the design-level timeout table.
pub struct CoordinatorConfig {
    pub investigation_timeout_ms: u64,
    pub stale_after_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            investigation_timeout_ms: 180_000,
            stale_after_ms: 600_000,
        }
    }
}

enum PipelineEnd {
    Completed { message: String },
    Failed { kind: &'static str, reason: String },
    Cancelled,
}

/// Tracks whether the client side of a stream is still worth writing to.
/// A dead stream never blocks the investigation itself.
struct StreamSide<'a> {
    emitter: Option<&'a StreamEmitter>,
    alive: bool,
}

impl<'a> StreamSide<'a> {
    fn new(emitter: Option<&'a StreamEmitter>) -> Self {
        Self {
            emitter,
            alive: emitter.is_some(),
        }
    }

    async fn send(&mut self, event: StreamEvent) {
        if !self.alive {
            return;
        }
        let Some(emitter) = self.emitter else {
            return;
        };
        if let Err(error) = emitter.emit(event).await {
            tracing::warn!(error = %error, "stream emission stopped");
            self.alive = false;
        }
    }

    async fn send_text_chunks(&mut self, text: &str) {
        let words_per_chunk = self
            .emitter
            .map(|emitter| emitter.config().text_chunk_words)
            .unwrap_or(lupa_stream::DEFAULT_TEXT_CHUNK_WORDS);
        for (index, content) in chunk_text_by_words(text, words_per_chunk)
            .into_iter()
            .enumerate()
        {
            self.send(StreamEvent::Text { content, index }).await;
        }
    }
}

/// Owns investigations end to end: planning, collecting, analyzing,
/// synthesizing, and the terminal transition, with persistence at every
/// step and cooperative cancellation throughout.
pub struct InvestigationCoordinator {
    planner: Arc<QueryPlanner>,
    executor: Arc<FederationExecutor>,
    router: Arc<Router>,
    store: Arc<InvestigationStore>,
    episodic: Arc<EpisodicMemory>,
    working: Arc<WorkingContextStore>,
    config: CoordinatorConfig,
    active: Mutex<BTreeMap<String, CooperativeCancellationToken>>,
}

impl InvestigationCoordinator {
    pub fn new(
        planner: Arc<QueryPlanner>,
        executor: Arc<FederationExecutor>,
        router: Arc<Router>,
        store: Arc<InvestigationStore>,
        episodic: Arc<EpisodicMemory>,
        working: Arc<WorkingContextStore>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            planner,
            executor,
            router,
            store,
            episodic,
            working,
            config,
            active: Mutex::new(BTreeMap::new()),
        }
    }

    /// Startup sweep: any `running` row older than the threshold is failed
    /// with `stale_after_restart`. Resumption is deliberately not attempted.
    pub fn recover_stale(&self) -> Result<Vec<String>> {
        self.store.fail_stale_running(self.config.stale_after_ms)
    }

    pub fn get(&self, investigation_id: &str) -> Result<Option<Investigation>> {
        self.store.get(investigation_id)
    }

    /// Requests cancellation. Returns false when the id is not active.
    pub fn cancel(&self, investigation_id: &str) -> bool {
        let active = lock_or_recover(&self.active);
        match active.get(investigation_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn register_active(&self, investigation_id: &str) -> CooperativeCancellationToken {
        let token = CooperativeCancellationToken::new();
        lock_or_recover(&self.active).insert(investigation_id.to_string(), token.clone());
        token
    }

    fn deregister_active(&self, investigation_id: &str) {
        lock_or_recover(&self.active).remove(investigation_id);
    }

    /// Creates the record and runs the pipeline in a background task.
    pub fn spawn_investigation(self: &Arc<Self>, query: Query) -> Result<String> {
        let investigation_id = format!("inv-{}", new_request_id());
        let investigation = Investigation::new(&investigation_id);
        self.store
            .upsert(&investigation)
            .context("failed to persist pending investigation")?;

        let coordinator = self.clone();
        let id_for_task = investigation_id.clone();
        tokio::spawn(async move {
            let _ = coordinator.execute_query(id_for_task, query, None).await;
        });
        Ok(investigation_id)
    }

    /// Synchronous chat entry point; streams when an emitter is provided.
    pub async fn handle_chat(
        &self,
        query: Query,
        emitter: Option<&StreamEmitter>,
    ) -> ChatOutcome {
        let investigation_id = format!("inv-{}", new_request_id());
        self.execute_query(investigation_id, query, emitter).await
    }

    /// The full pipeline for one query, chat-initiated or background.
    async fn execute_query(
        &self,
        investigation_id: String,
        query: Query,
        emitter: Option<&StreamEmitter>,
    ) -> ChatOutcome {
        let started_ms = current_unix_timestamp_ms();
        self.working
            .append_turn(&query.session_id, "user", &query.text);
        let cancel = self.register_active(&investigation_id);
        let mut side = StreamSide::new(emitter);

        let mut investigation = Investigation::new(&investigation_id);
        let _ = self.store.upsert(&investigation);
        side.send(StreamEvent::Start {
            investigation_id: investigation_id.clone(),
            session_id: query.session_id.clone(),
        })
        .await;
        side.send(StreamEvent::Progress {
            phase: InvestigationPhase::Planning.as_str().to_string(),
            progress: 0.0,
        })
        .await;

        investigation.status = InvestigationStatus::Running;
        investigation.started_at_unix_ms = Some(current_unix_timestamp_ms());
        let _ = self.store.upsert(&investigation);

        let (intent, plan_result) = self.planner.plan(&query.text).await;
        self.record_episode(
            &investigation_id,
            "intent",
            json!({
                "intent": intent.kind.as_str(),
                "confidence": intent.confidence,
            }),
        );
        side.send(StreamEvent::Intent {
            intent: intent.kind.as_str().to_string(),
            confidence: intent.confidence,
        })
        .await;

        let context = AgentContext::new(
            investigation_id.clone(),
            query.session_id.clone(),
            query.user_id.clone(),
        );

        let (investigation, end, response_meta) = {
            let deadline =
                std::time::Duration::from_millis(self.config.investigation_timeout_ms.max(1));
            let run = self.run_phases(
                investigation,
                &intent,
                plan_result,
                &context,
                &mut side,
                &cancel,
            );
            match tokio::time::timeout(deadline, run).await {
                Ok(result) => result,
                Err(_) => {
                    // The in-flight future is gone; the store holds the last
                    // persisted transition.
                    let mut stale = self
                        .store
                        .get(&investigation_id)
                        .ok()
                        .flatten()
                        .unwrap_or_else(|| Investigation::new(&investigation_id));
                    stale.status = InvestigationStatus::Failed;
                    stale.completed_at_unix_ms = Some(current_unix_timestamp_ms());
                    merge_metadata(&mut stale, json!({ "failure_reason": "deadline_exceeded" }));
                    let _ = self.store.upsert(&stale);
                    (
                        stale,
                        PipelineEnd::Failed {
                            kind: "resource_error",
                            reason: "deadline_exceeded".to_string(),
                        },
                        Value::Null,
                    )
                }
            }
        };

        self.deregister_active(&investigation_id);
        let processing_time_ms = elapsed_ms_since(started_ms);

        let outcome = self.build_outcome(
            &investigation,
            &intent,
            end,
            response_meta,
            &query,
            processing_time_ms,
        );
        self.working
            .append_turn(&query.session_id, "assistant", &outcome.message);

        // Terminal stream event mirrors the investigation's fate.
        match investigation.status {
            InvestigationStatus::Completed => {
                side.send_text_chunks(&outcome.message).await;
                side.send(StreamEvent::Done {
                    total_records_analyzed: investigation.total_records_analyzed,
                    anomalies_found: investigation.anomalies_found,
                    processing_time_ms,
                })
                .await;
            }
            InvestigationStatus::Cancelled => {
                side.send(StreamEvent::Error {
                    reason: "cancelled".to_string(),
                    message: outcome.message.clone(),
                })
                .await;
            }
            _ => {
                let reason = investigation
                    .metadata
                    .get("failure_reason")
                    .and_then(Value::as_str)
                    .unwrap_or("internal")
                    .to_string();
                side.send(StreamEvent::Error {
                    reason,
                    message: outcome.message.clone(),
                })
                .await;
            }
        }
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_phases(
        &self,
        mut investigation: Investigation,
        intent: &Intent,
        plan_result: std::result::Result<ExecutionPlan, PlanError>,
        context: &AgentContext,
        side: &mut StreamSide<'_>,
        cancel: &CooperativeCancellationToken,
    ) -> (Investigation, PipelineEnd, Value) {
        // Planning resolves the agent set; the selected primary is announced
        // before any collection starts.
        let plan = match plan_result {
            Ok(plan) => plan,
            Err(error) => {
                let prompt = error.clarifying_prompt().to_string();
                side.send(StreamEvent::AgentSelected {
                    agent_id: "communicator".to_string(),
                })
                .await;
                let clarified = self
                    .dispatch_conversational(
                        intent,
                        json!({ "prompt": prompt }),
                        context,
                    )
                    .await;
                let message = clarified.unwrap_or(prompt);
                merge_metadata(
                    &mut investigation,
                    json!({ "clarification": true, "agent": "communicator" }),
                );
                self.finish_completed(&mut investigation, &message).await;
                return (investigation, PipelineEnd::Completed { message }, Value::Null);
            }
        };

        let primary = self
            .router
            .candidates_for(intent)
            .first()
            .cloned()
            .unwrap_or_else(|| intent.suggested_agent_id.clone());
        side.send(StreamEvent::AgentSelected {
            agent_id: primary.clone(),
        })
        .await;

        if cancel.is_cancelled() {
            return self.finish_cancelled(investigation).await;
        }
        investigation.current_phase = InvestigationPhase::Planning;
        investigation.advance_progress(InvestigationPhase::Planning.checkpoint());
        let _ = self.store.upsert(&investigation);
        side.send(StreamEvent::Progress {
            phase: InvestigationPhase::Planning.as_str().to_string(),
            progress: investigation.progress,
        })
        .await;

        // Collecting.
        let mut records: Vec<SourceRecord> = Vec::new();
        let mut missing_sources: Vec<String> = Vec::new();
        let mut duplicates_dropped = 0usize;
        let mut partial = false;
        if plan.requires_collection() {
            investigation.current_phase = InvestigationPhase::Collecting;
            let _ = self.store.upsert(&investigation);

            for step in &plan.steps {
                if cancel.is_cancelled() {
                    return self.finish_cancelled(investigation).await;
                }
                let fetched = self
                    .executor
                    .execute(
                        step.capability,
                        &step.source_filters,
                        &step.record_filters,
                        step.strategy,
                        step.deadline_ms,
                        cancel,
                    )
                    .await;
                match fetched {
                    Ok(result) => {
                        match result.records {
                            FederatedRecords::Merged { records: merged } => {
                                records.extend(merged)
                            }
                            FederatedRecords::Grouped { by_source } => {
                                records.extend(by_source.into_values().flatten())
                            }
                        }
                        for source_id in result.missing_sources {
                            if !missing_sources.contains(&source_id) {
                                missing_sources.push(source_id);
                            }
                        }
                        duplicates_dropped += result.duplicates_dropped;
                        partial = partial || result.partial;
                    }
                    Err(FederationError::AllSourcesUnavailable { source_ids }) => {
                        merge_metadata(
                            &mut investigation,
                            json!({
                                "failure_reason": "all_sources_unavailable",
                                "error": {
                                    "kind": "source_error",
                                    "reason": "all_sources_unavailable",
                                    "sources": source_ids,
                                },
                            }),
                        );
                        return self.finish_failed(
                            investigation,
                            "source_error",
                            "all_sources_unavailable".to_string(),
                        );
                    }
                    Err(FederationError::AllAttemptsFailed { reports }) => {
                        if cancel.is_cancelled() {
                            return self.finish_cancelled(investigation).await;
                        }
                        let outcomes: Vec<Value> = reports
                            .iter()
                            .map(|report| {
                                json!({
                                    "source_id": report.source_id,
                                    "outcome": report.outcome.as_str(),
                                })
                            })
                            .collect();
                        merge_metadata(
                            &mut investigation,
                            json!({
                                "failure_reason": "no_source_succeeded",
                                "error": {
                                    "kind": "source_error",
                                    "reason": "no_source_succeeded",
                                    "per_source": outcomes,
                                },
                            }),
                        );
                        return self.finish_failed(
                            investigation,
                            "source_error",
                            "no_source_succeeded".to_string(),
                        );
                    }
                }
            }

            investigation.total_records_analyzed = records.len() as u64;
            investigation.advance_progress(InvestigationPhase::Collecting.checkpoint());
            merge_metadata(
                &mut investigation,
                json!({
                    "partial": partial,
                    "missing_sources": missing_sources,
                    "duplicates_dropped": duplicates_dropped,
                }),
            );
            let _ = self.store.upsert(&investigation);
            side.send(StreamEvent::Progress {
                phase: InvestigationPhase::Collecting.as_str().to_string(),
                progress: investigation.progress,
            })
            .await;
            for source_id in &missing_sources {
                side.send(StreamEvent::Warning {
                    message: format!("fonte {source_id} fora da análise"),
                })
                .await;
            }
            self.record_episode(
                &investigation.id,
                "collected",
                json!({
                    "records": records.len(),
                    "missing_sources": missing_sources,
                    "duplicates_dropped": duplicates_dropped,
                }),
            );
        }

        // Analyzing.
        if cancel.is_cancelled() {
            return self.finish_cancelled(investigation).await;
        }
        investigation.current_phase = InvestigationPhase::Analyzing;
        let _ = self.store.upsert(&investigation);

        let organization = plan
            .steps
            .first()
            .and_then(|step| step.record_filters.organization.clone());
        let payload = json!({
            "records": records,
            "organization": organization,
            "missing_sources": missing_sources,
            "prompt": Value::Null,
        });
        let response = match self.router.dispatch(intent, payload, context).await {
            Ok(response) => response,
            Err(error) => {
                merge_metadata(
                    &mut investigation,
                    json!({
                        "failure_reason": "agent_exhausted",
                        "error": { "kind": "agent_error", "reason": error.to_string() },
                    }),
                );
                return self.finish_failed(
                    investigation,
                    "agent_error",
                    error.to_string(),
                );
            }
        };

        let anomalies_found = response
            .result
            .as_ref()
            .and_then(|result| result.get("anomalies_found"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        investigation.anomalies_found = anomalies_found;
        investigation.advance_progress(InvestigationPhase::Analyzing.checkpoint());
        let response_meta = serde_json::to_value(&response.metadata).unwrap_or(Value::Null);
        merge_metadata(
            &mut investigation,
            json!({
                "agent": response.agent_name,
                "low_confidence": response.metadata.get("low_confidence").cloned(),
            }),
        );
        let _ = self.store.upsert(&investigation);
        side.send(StreamEvent::Progress {
            phase: InvestigationPhase::Analyzing.as_str().to_string(),
            progress: investigation.progress,
        })
        .await;
        self.record_episode(
            &investigation.id,
            "analyzed",
            json!({
                "agent": response.agent_name,
                "anomalies_found": anomalies_found,
                "confidence": response.confidence(),
            }),
        );

        // Synthesizing (reporter), only for collection-backed runs.
        let message = if plan.requires_collection() {
            if cancel.is_cancelled() {
                return self.finish_cancelled(investigation).await;
            }
            investigation.current_phase = InvestigationPhase::Synthesizing;
            let _ = self.store.upsert(&investigation);
            self.synthesize_summary(
                &investigation,
                intent,
                organization.as_deref(),
                &missing_sources,
                context,
            )
            .await
        } else {
            response
                .result
                .as_ref()
                .and_then(|result| {
                    result
                        .get("message")
                        .or_else(|| result.get("summary"))
                        .and_then(Value::as_str)
                })
                .unwrap_or("Consulta concluída.")
                .to_string()
        };

        investigation.result_blob = response.result.clone();
        self.finish_completed(&mut investigation, &message).await;
        (
            investigation,
            PipelineEnd::Completed { message },
            response_meta,
        )
    }

    async fn dispatch_conversational(
        &self,
        intent: &Intent,
        payload: Value,
        context: &AgentContext,
    ) -> Option<String> {
        let clarify_intent = Intent {
            kind: IntentKind::Unknown,
            entities: intent.entities.clone(),
            confidence: intent.confidence,
            suggested_agent_id: "communicator".to_string(),
        };
        let response = self
            .router
            .dispatch(&clarify_intent, payload, context)
            .await
            .ok()?;
        response
            .result
            .as_ref()
            .and_then(|result| result.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    async fn synthesize_summary(
        &self,
        investigation: &Investigation,
        intent: &Intent,
        organization: Option<&str>,
        missing_sources: &[String],
        context: &AgentContext,
    ) -> String {
        let reporter_intent = Intent {
            kind: IntentKind::ReportRequest,
            entities: intent.entities.clone(),
            confidence: intent.confidence,
            suggested_agent_id: "reporter".to_string(),
        };
        let payload = json!({
            "organization": organization,
            "total_records_analyzed": investigation.total_records_analyzed,
            "anomalies_found": investigation.anomalies_found,
            "missing_sources": missing_sources,
        });
        match self.router.dispatch(&reporter_intent, payload, context).await {
            Ok(response) => response
                .result
                .as_ref()
                .and_then(|result| result.get("summary").and_then(Value::as_str))
                .map(str::to_string)
                .unwrap_or_else(|| fallback_summary(investigation)),
            Err(error) => {
                // The reporter is optional; a synthesis failure degrades to
                // the mechanical summary.
                tracing::warn!(error = %error, "reporter unavailable, using basic summary");
                fallback_summary(investigation)
            }
        }
    }

    async fn finish_completed(&self, investigation: &mut Investigation, message: &str) {
        investigation.status = InvestigationStatus::Completed;
        investigation.current_phase = InvestigationPhase::Done;
        investigation.advance_progress(1.0);
        investigation.completed_at_unix_ms = Some(current_unix_timestamp_ms());
        investigation.summary = Some(message.to_string());
        let _ = self.store.upsert(investigation);
    }

    async fn finish_cancelled(
        &self,
        mut investigation: Investigation,
    ) -> (Investigation, PipelineEnd, Value) {
        investigation.status = InvestigationStatus::Cancelled;
        investigation.completed_at_unix_ms = Some(current_unix_timestamp_ms());
        merge_metadata(&mut investigation, json!({ "failure_reason": "cancelled" }));
        let _ = self.store.upsert(&investigation);
        self.record_episode(&investigation.id, "cancelled", json!({}));
        (investigation, PipelineEnd::Cancelled, Value::Null)
    }

    fn finish_failed(
        &self,
        mut investigation: Investigation,
        kind: &'static str,
        reason: String,
    ) -> (Investigation, PipelineEnd, Value) {
        investigation.status = InvestigationStatus::Failed;
        investigation.completed_at_unix_ms = Some(current_unix_timestamp_ms());
        let _ = self.store.upsert(&investigation);
        self.record_episode(
            &investigation.id,
            "failed",
            json!({ "kind": kind, "reason": reason }),
        );
        (investigation, PipelineEnd::Failed { kind, reason }, Value::Null)
    }

    fn build_outcome(
        &self,
        investigation: &Investigation,
        intent: &Intent,
        end: PipelineEnd,
        response_meta: Value,
        query: &Query,
        processing_time_ms: u64,
    ) -> ChatOutcome {
        let (agent_id, message, metadata) = match end {
            PipelineEnd::Completed { message } => {
                let agent = investigation
                    .metadata
                    .get("agent")
                    .and_then(Value::as_str)
                    .unwrap_or(intent.suggested_agent_id.as_str())
                    .to_string();
                let metadata = json!({
                    "investigation_id": investigation.id,
                    "intent": intent.kind.as_str(),
                    "processing_time_ms": processing_time_ms,
                    "partial": investigation.metadata.get("partial").cloned(),
                    "missing_sources": investigation.metadata.get("missing_sources").cloned(),
                    "low_confidence": investigation.metadata.get("low_confidence").cloned(),
                    "agent_metadata": response_meta,
                });
                (agent, message, metadata)
            }
            PipelineEnd::Failed { kind, reason } => {
                let message = fallback_message_for(intent.kind);
                let metadata = json!({
                    "investigation_id": investigation.id,
                    "intent": intent.kind.as_str(),
                    "processing_time_ms": processing_time_ms,
                    "error": { "kind": kind, "reason": reason },
                });
                ("communicator".to_string(), message, metadata)
            }
            PipelineEnd::Cancelled => (
                "communicator".to_string(),
                "Investigação cancelada a pedido.".to_string(),
                json!({
                    "investigation_id": investigation.id,
                    "intent": intent.kind.as_str(),
                    "cancelled": true,
                }),
            ),
        };

        ChatOutcome {
            session_id: query.session_id.clone(),
            message_id: new_request_id(),
            agent_id: agent_id.clone(),
            agent_name: agent_id,
            message,
            confidence: intent.confidence,
            suggested_actions: Vec::new(),
            follow_up_questions: Vec::new(),
            metadata,
        }
    }

    fn record_episode(&self, investigation_id: &str, kind: &str, payload: Value) {
        if let Err(error) = self.episodic.record(investigation_id, kind, payload) {
            tracing::warn!(error = %error, "episodic write failed");
        }
    }
}

/// Intent-conditioned user-facing failure text. Never empty.
fn fallback_message_for(kind: IntentKind) -> String {
    match kind {
        IntentKind::Investigate | IntentKind::Analyze => {
            "Não consegui consultar as fontes agora; tente em instantes.".to_string()
        }
        IntentKind::ReportRequest => {
            "Não consegui gerar o relatório agora; tente novamente em instantes.".to_string()
        }
        _ => "Algo deu errado por aqui; pode tentar de novo?".to_string(),
    }
}

fn fallback_summary(investigation: &Investigation) -> String {
    format!(
        "Análise concluída: {} registros examinados, {} possíveis anomalias.",
        investigation.total_records_analyzed, investigation.anomalies_found
    )
}

fn merge_metadata(investigation: &mut Investigation, extra: Value) {
    if investigation.metadata.is_null() {
        investigation.metadata = json!({});
    }
    if let (Some(target), Some(source)) =
        (investigation.metadata.as_object_mut(), extra.as_object())
    {
        for (key, value) in source {
            if !value.is_null() {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use async_trait::async_trait;
    use futures_util::StreamExt;

    use lupa_agents::{
        Agent, AgentPool, AgentPoolConfig, AnalystAgent, CommunicatorAgent, DetectiveAgent,
        ReporterAgent,
    };
    use lupa_federation::{
        DemoSourceClient, FederationExecutor, FederationExecutorConfig, FetchError, RecordFilters,
        SourceClient, SourceRecord,
    };
    use lupa_memory::{EpisodicMemory, WorkingContextStore};
    use lupa_planner::{LexiconIntentClassifier, QueryPlanner};
    use lupa_resilience::{CircuitBreakerConfig, RetryPolicy};
    use lupa_router::{Router, RouterConfig};
    use lupa_sources::{CallOutcome, Capability, Source, SourceFamily, SourceRegistry};
    use lupa_store::{InvestigationStatus, InvestigationStore, MemoryRowStore};
    use lupa_stream::{stream_channel, StreamConfig, StreamEvent};

    use super::{CoordinatorConfig, InvestigationCoordinator};
    use crate::outcome::Query;

    struct SlowDemoClient {
        delay_ms: u64,
        inner: DemoSourceClient,
    }

    #[async_trait]
    impl SourceClient for SlowDemoClient {
        async fn fetch(
            &self,
            source: &Source,
            capability: Capability,
            filters: &RecordFilters,
        ) -> Result<Vec<SourceRecord>, FetchError> {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            self.inner.fetch(source, capability, filters).await
        }
    }

    fn contracts_source(id: &str, priority: u32) -> Source {
        Source {
            id: id.to_string(),
            family: SourceFamily::Federal,
            capabilities: BTreeSet::from([Capability::Contracts, Capability::Expenses]),
            base_endpoint: "https://example.gov.br".to_string(),
            priority,
            region: String::new(),
        }
    }

    fn build_coordinator(
        client: Arc<dyn SourceClient>,
    ) -> (Arc<InvestigationCoordinator>, Arc<SourceRegistry>) {
        let registry = Arc::new(SourceRegistry::new(
            vec![
                contracts_source("portal-transparencia", 1),
                contracts_source("pncp", 2),
            ],
            CircuitBreakerConfig {
                failure_threshold: 1,
                window_ms: 60_000,
                cooldown_ms: 60_000,
            },
        ));

        let planner = Arc::new(QueryPlanner::new(
            Arc::new(LexiconIntentClassifier::new()),
            registry.clone(),
        ));
        let executor = Arc::new(FederationExecutor::new(
            registry.clone(),
            client,
            FederationExecutorConfig {
                per_source_timeout_ms: 2_000,
                retry: RetryPolicy::no_retry(),
            },
        ));

        let pool = AgentPool::new(AgentPoolConfig::default());
        pool.register("communicator", || Arc::new(CommunicatorAgent) as Arc<dyn Agent>);
        pool.register("detective", || Arc::new(DetectiveAgent) as Arc<dyn Agent>);
        pool.register("analyst", || Arc::new(AnalystAgent) as Arc<dyn Agent>);
        pool.register("reporter", || Arc::new(ReporterAgent) as Arc<dyn Agent>);
        let router = Arc::new(Router::new(pool, RouterConfig::default()));

        let store = Arc::new(InvestigationStore::open_in_memory().expect("store"));
        let memory_rows = Arc::new(MemoryRowStore::open_in_memory().expect("memory store"));
        let episodic = Arc::new(EpisodicMemory::new(memory_rows, 90));
        let working = Arc::new(WorkingContextStore::new(20));

        let coordinator = Arc::new(InvestigationCoordinator::new(
            planner,
            executor,
            router,
            store,
            episodic,
            working,
            CoordinatorConfig {
                investigation_timeout_ms: 10_000,
                stale_after_ms: 600_000,
            },
        ));
        (coordinator, registry)
    }

    #[tokio::test]
    async fn functional_greeting_fast_path_answers_without_collection() {
        let (coordinator, _) = build_coordinator(Arc::new(DemoSourceClient));
        let outcome = coordinator
            .handle_chat(Query::new("olá", "sess-1"), None)
            .await;

        assert_eq!(outcome.agent_id, "communicator");
        assert!(!outcome.message.is_empty());
        assert_eq!(outcome.metadata["intent"], "greeting");

        let investigation_id = outcome.metadata["investigation_id"]
            .as_str()
            .expect("investigation id");
        let investigation = coordinator
            .get(investigation_id)
            .expect("get")
            .expect("present");
        assert_eq!(investigation.status, InvestigationStatus::Completed);
        assert_eq!(investigation.total_records_analyzed, 0);
        assert!(investigation.completed_at_unix_ms.is_some());
    }

    #[tokio::test]
    async fn functional_investigation_aggregates_and_dedupes_demo_sources() {
        let (coordinator, _) = build_coordinator(Arc::new(DemoSourceClient));
        let outcome = coordinator
            .handle_chat(
                Query::new(
                    "investigar contratos do Ministério da Saúde em 2024",
                    "sess-1",
                ),
                None,
            )
            .await;

        let investigation_id = outcome.metadata["investigation_id"]
            .as_str()
            .expect("investigation id");
        let investigation = coordinator
            .get(investigation_id)
            .expect("get")
            .expect("present");

        // Demo catalog: 8 records from the primary, 6 overlapping from the
        // secondary, so the aggregate keeps N1 + N2 - D = 8.
        assert_eq!(investigation.status, InvestigationStatus::Completed);
        assert_eq!(investigation.total_records_analyzed, 8);
        assert_eq!(investigation.metadata["duplicates_dropped"], 6);
        assert_eq!(investigation.metadata["partial"], false);
        assert!((investigation.progress - 1.0).abs() < 1e-9);
        assert!(investigation.summary.is_some());
        assert!(!outcome.message.is_empty());
    }

    #[tokio::test]
    async fn functional_open_circuited_source_is_annotated_not_fatal() {
        let (coordinator, registry) = build_coordinator(Arc::new(DemoSourceClient));
        registry.report("pncp", CallOutcome::Failure);
        assert!(!registry.is_healthy("pncp"));

        let outcome = coordinator
            .handle_chat(
                Query::new(
                    "investigar contratos do Ministério da Saúde em 2024",
                    "sess-1",
                ),
                None,
            )
            .await;

        let investigation_id = outcome.metadata["investigation_id"]
            .as_str()
            .expect("investigation id");
        let investigation = coordinator
            .get(investigation_id)
            .expect("get")
            .expect("present");
        assert_eq!(investigation.status, InvestigationStatus::Completed);
        assert_eq!(investigation.metadata["partial"], true);
        assert_eq!(
            investigation.metadata["missing_sources"],
            serde_json::json!(["pncp"])
        );
        assert_eq!(investigation.total_records_analyzed, 8);
    }

    #[tokio::test]
    async fn functional_all_sources_open_fails_with_typed_reason() {
        let (coordinator, registry) = build_coordinator(Arc::new(DemoSourceClient));
        registry.report("portal-transparencia", CallOutcome::Failure);
        registry.report("pncp", CallOutcome::Failure);

        let outcome = coordinator
            .handle_chat(
                Query::new(
                    "investigar contratos do Ministério da Saúde em 2024",
                    "sess-1",
                ),
                None,
            )
            .await;

        assert_eq!(
            outcome.metadata["error"]["reason"],
            "all_sources_unavailable"
        );
        assert_eq!(outcome.metadata["error"]["kind"], "source_error");
        // User still gets a friendly, non-empty reply.
        assert!(outcome.message.contains("tente em instantes"));

        let investigation_id = outcome.metadata["investigation_id"]
            .as_str()
            .expect("investigation id");
        let investigation = coordinator
            .get(investigation_id)
            .expect("get")
            .expect("present");
        assert_eq!(investigation.status, InvestigationStatus::Failed);
    }

    #[tokio::test]
    async fn functional_clarification_instead_of_error_for_vague_investigations() {
        let (coordinator, _) = build_coordinator(Arc::new(DemoSourceClient));
        let outcome = coordinator
            .handle_chat(Query::new("investigar o Ministério da Saúde", "sess-1"), None)
            .await;

        assert!(outcome.message.contains("contratos"));
        let investigation_id = outcome.metadata["investigation_id"]
            .as_str()
            .expect("investigation id");
        let investigation = coordinator
            .get(investigation_id)
            .expect("get")
            .expect("present");
        assert_eq!(investigation.status, InvestigationStatus::Completed);
        assert_eq!(investigation.metadata["clarification"], true);
    }

    #[tokio::test]
    async fn functional_cancellation_terminates_promptly() {
        let (coordinator, _) = build_coordinator(Arc::new(SlowDemoClient {
            delay_ms: 1_500,
            inner: DemoSourceClient,
        }));

        let investigation_id = coordinator
            .spawn_investigation(Query::new(
                "investigar contratos do Ministério da Saúde em 2024",
                "sess-1",
            ))
            .expect("spawn");

        // Let the pipeline reach collecting, then cancel.
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        assert!(coordinator.cancel(&investigation_id));

        let cancelled_within_grace = async {
            loop {
                if let Ok(Some(investigation)) = coordinator.get(&investigation_id) {
                    if investigation.status == InvestigationStatus::Cancelled {
                        return investigation;
                    }
                }
                tokio::time::sleep(std::time::Duration::from_millis(25)).await;
            }
        };
        let investigation = tokio::time::timeout(
            std::time::Duration::from_millis(1_000),
            cancelled_within_grace,
        )
        .await
        .expect("cancelled within the one-second grace window");
        assert!(investigation.completed_at_unix_ms.is_some());
        assert_eq!(investigation.metadata["failure_reason"], "cancelled");
    }

    #[tokio::test]
    async fn functional_stream_connection_matches_grammar() {
        let (coordinator, _) = build_coordinator(Arc::new(DemoSourceClient));
        let (emitter, stream) = stream_channel(StreamConfig::default());

        let drain = tokio::spawn(async move {
            stream.collect::<Vec<StreamEvent>>().await
        });

        let _ = coordinator
            .handle_chat(
                Query::new(
                    "investigar contratos do Ministério da Saúde em 2024",
                    "sess-1",
                ),
                Some(&emitter),
            )
            .await;
        drop(emitter);

        let events = drain.await.expect("drain");
        let tags: Vec<&str> = events.iter().map(StreamEvent::tag).collect();
        assert_eq!(tags.first(), Some(&"start"));
        assert_eq!(tags.last(), Some(&"done"));
        let intent_pos = tags.iter().position(|t| *t == "intent").expect("intent");
        let agent_pos = tags
            .iter()
            .position(|t| *t == "agent_selected")
            .expect("agent_selected");
        assert_eq!(agent_pos, intent_pos + 1);
        assert!(tags.iter().filter(|t| **t == "done").count() == 1);

        // Progress values never decrease within the connection.
        let mut last_progress = -1.0f64;
        for event in &events {
            if let StreamEvent::Progress { progress, .. } = event {
                assert!(*progress >= last_progress);
                last_progress = *progress;
            }
        }
    }
}
