//! End-to-end scenarios over an in-process stack with scripted sources.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;

use lupa_agents::{
    Agent, AgentPool, AgentPoolConfig, AnalystAgent, CommunicatorAgent, DetectiveAgent,
    ReporterAgent,
};
use lupa_coordinator::{CoordinatorConfig, InvestigationCoordinator, Query};
use lupa_core::current_unix_timestamp_ms;
use lupa_federation::{
    FederationExecutor, FederationExecutorConfig, FetchError, RecordFilters, SourceClient,
    SourceRecord,
};
use lupa_memory::{EpisodicMemory, WorkingContextStore};
use lupa_planner::{LexiconIntentClassifier, QueryPlanner};
use lupa_resilience::{CircuitBreakerConfig, RetryPolicy};
use lupa_router::{Router, RouterConfig};
use lupa_sources::{CallOutcome, Capability, Source, SourceFamily, SourceRegistry};
use lupa_store::{InvestigationStatus, InvestigationStore, MemoryRowStore};
use lupa_stream::{stream_channel, StreamConfig, StreamEvent};

#[derive(Clone, Default)]
struct ScriptedSourceClient {
    records: Arc<Mutex<BTreeMap<String, Vec<SourceRecord>>>>,
    delays_ms: Arc<Mutex<BTreeMap<String, u64>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedSourceClient {
    fn with_records(self, source_id: &str, records: Vec<SourceRecord>) -> Self {
        self.records
            .lock()
            .expect("records lock")
            .insert(source_id.to_string(), records);
        self
    }

    fn with_delay(self, source_id: &str, delay_ms: u64) -> Self {
        self.delays_ms
            .lock()
            .expect("delays lock")
            .insert(source_id.to_string(), delay_ms);
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl SourceClient for ScriptedSourceClient {
    async fn fetch(
        &self,
        source: &Source,
        _capability: Capability,
        _filters: &RecordFilters,
    ) -> Result<Vec<SourceRecord>, FetchError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(source.id.clone());
        let delay = self
            .delays_ms
            .lock()
            .expect("delays lock")
            .get(&source.id)
            .copied();
        if let Some(delay_ms) = delay {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        }
        Ok(self
            .records
            .lock()
            .expect("records lock")
            .get(&source.id)
            .cloned()
            .unwrap_or_default())
    }
}

fn record(contract_id: &str, value_centavos: i64) -> SourceRecord {
    SourceRecord {
        contract_id: Some(contract_id.to_string()),
        document_number: None,
        organization: "Ministério da Saúde".to_string(),
        date: "2024-03-15".to_string(),
        value_centavos: Some(value_centavos),
        description: "Aquisição de insumos hospitalares".to_string(),
        payload: Value::Null,
        provenance: Vec::new(),
    }
}

fn source(id: &str, priority: u32) -> Source {
    Source {
        id: id.to_string(),
        family: SourceFamily::Federal,
        capabilities: BTreeSet::from([Capability::Contracts, Capability::Expenses]),
        base_endpoint: "https://example.gov.br".to_string(),
        priority,
        region: String::new(),
    }
}

struct Stack {
    coordinator: Arc<InvestigationCoordinator>,
    registry: Arc<SourceRegistry>,
    client: ScriptedSourceClient,
}

fn build_stack(client: ScriptedSourceClient) -> Stack {
    let registry = Arc::new(SourceRegistry::new(
        vec![source("portal-transparencia", 1), source("pncp", 2)],
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
        Arc::new(client.clone()),
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
    let coordinator = Arc::new(InvestigationCoordinator::new(
        planner,
        executor,
        router,
        store,
        Arc::new(EpisodicMemory::new(memory_rows, 90)),
        Arc::new(WorkingContextStore::new(20)),
        CoordinatorConfig {
            investigation_timeout_ms: 15_000,
            stale_after_ms: 600_000,
        },
    ));

    Stack {
        coordinator,
        registry,
        client,
    }
}

#[tokio::test]
async fn scenario_greeting_fast_path() {
    let stack = build_stack(ScriptedSourceClient::default());
    let started = current_unix_timestamp_ms();
    let outcome = stack
        .coordinator
        .handle_chat(Query::new("olá", "sess-greeting"), None)
        .await;
    let elapsed = current_unix_timestamp_ms().saturating_sub(started);

    assert_eq!(outcome.metadata["intent"], "greeting");
    assert_eq!(outcome.agent_id, "communicator");
    assert!(!outcome.message.is_empty());
    assert!(elapsed < 3_000, "greeting took {elapsed}ms");
    // The conversational fast path never touches a data source.
    assert!(stack.client.calls().is_empty());
}

#[tokio::test]
async fn scenario_investigation_aggregate_two_sources_with_duplicates() {
    let client = ScriptedSourceClient::default()
        .with_records(
            "portal-transparencia",
            vec![
                record("CT-1", 10_000_00),
                record("CT-2", 12_000_00),
                record("CT-3", 14_000_00),
            ],
        )
        .with_records(
            "pncp",
            vec![record("CT-3", 14_000_00), record("CT-4", 16_000_00)],
        );
    let stack = build_stack(client);

    let outcome = stack
        .coordinator
        .handle_chat(
            Query::new(
                "investigar contratos do Ministério da Saúde em 2024",
                "sess-agg",
            ),
            None,
        )
        .await;

    let investigation_id = outcome.metadata["investigation_id"].as_str().expect("id");
    let investigation = stack
        .coordinator
        .get(investigation_id)
        .expect("get")
        .expect("present");

    // N1 + N2 - D = 3 + 2 - 1.
    assert_eq!(investigation.status, InvestigationStatus::Completed);
    assert_eq!(investigation.total_records_analyzed, 4);
    assert_eq!(investigation.metadata["duplicates_dropped"], 1);
    // Both sources were dialed concurrently.
    let calls = stack.client.calls();
    assert!(calls.contains(&"portal-transparencia".to_string()));
    assert!(calls.contains(&"pncp".to_string()));
}

#[tokio::test]
async fn scenario_investigation_with_one_source_open_circuited() {
    let client = ScriptedSourceClient::default()
        .with_records(
            "portal-transparencia",
            vec![record("CT-1", 10_000_00), record("CT-2", 12_000_00)],
        )
        .with_records("pncp", vec![record("CT-9", 20_000_00)]);
    let stack = build_stack(client);

    // Trip source A's breaker before the investigation starts.
    stack
        .registry
        .report("portal-transparencia", CallOutcome::Failure);
    assert!(!stack.registry.is_healthy("portal-transparencia"));

    let outcome = stack
        .coordinator
        .handle_chat(
            Query::new(
                "investigar contratos do Ministério da Saúde em 2024",
                "sess-breaker",
            ),
            None,
        )
        .await;

    let investigation_id = outcome.metadata["investigation_id"].as_str().expect("id");
    let investigation = stack
        .coordinator
        .get(investigation_id)
        .expect("get")
        .expect("present");

    assert_eq!(investigation.status, InvestigationStatus::Completed);
    assert_eq!(
        investigation.metadata["missing_sources"],
        serde_json::json!(["portal-transparencia"])
    );
    // The open-circuited source was never dialed.
    assert_eq!(stack.client.calls(), vec!["pncp".to_string()]);
    assert_eq!(investigation.total_records_analyzed, 1);
}

#[tokio::test]
async fn scenario_stream_slow_consumer_terminates_with_typed_error() {
    let stack = build_stack(
        ScriptedSourceClient::default()
            .with_records("portal-transparencia", vec![record("CT-1", 10_000_00)])
            .with_records("pncp", Vec::new()),
    );

    let (emitter, mut stream) = stream_channel(StreamConfig {
        buffer_capacity: 2,
        send_timeout_ms: 100,
        ..StreamConfig::default()
    });

    // Client reads only the first event, then stops draining.
    let first = {
        let run = stack.coordinator.handle_chat(
            Query::new(
                "investigar contratos do Ministério da Saúde em 2024",
                "sess-slow",
            ),
            Some(&emitter),
        );
        let (outcome, first) = tokio::join!(run, stream.next());
        // The investigation itself still completed; only the stream died.
        assert!(!outcome.message.is_empty());
        first
    };
    assert!(matches!(first, Some(StreamEvent::Start { .. })));

    drop(emitter);
    let remaining: Vec<StreamEvent> = stream.collect().await;
    let last = remaining.last().expect("trailing events");
    match last {
        StreamEvent::Error { reason, .. } => assert_eq!(reason, "slow_consumer"),
        other => panic!("expected slow_consumer terminal event, got {other:?}"),
    }
}

#[tokio::test]
async fn scenario_agent_reflection_path() {
    // Few records: the analyst's first pass is low confidence, reflection
    // widens the window and the second pass clears the bar.
    let client = ScriptedSourceClient::default()
        .with_records(
            "portal-transparencia",
            vec![record("CT-1", 10_000_00), record("CT-2", 12_000_00)],
        )
        .with_records("pncp", Vec::new());
    let stack = build_stack(client);

    let outcome = stack
        .coordinator
        .handle_chat(
            Query::new("analisar padrão de gastos da saúde em 2024", "sess-reflect"),
            None,
        )
        .await;

    let agent_metadata = &outcome.metadata["agent_metadata"];
    assert_eq!(agent_metadata["reflection_cycles"], 1);
    assert!(agent_metadata.get("low_confidence").is_none());
    assert!(!outcome.message.is_empty());
}

#[tokio::test]
async fn scenario_cancellation_mid_collecting() {
    let client = ScriptedSourceClient::default()
        .with_records("portal-transparencia", vec![record("CT-1", 10_000_00)])
        .with_delay("portal-transparencia", 1_500)
        .with_records("pncp", vec![record("CT-2", 12_000_00)])
        .with_delay("pncp", 1_500);
    let stack = build_stack(client);

    let investigation_id = stack
        .coordinator
        .spawn_investigation(Query::new(
            "investigar contratos do Ministério da Saúde em 2024",
            "sess-cancel",
        ))
        .expect("spawn");

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let cancel_issued_at = current_unix_timestamp_ms();
    assert!(stack.coordinator.cancel(&investigation_id));

    let investigation = tokio::time::timeout(std::time::Duration::from_millis(1_000), async {
        loop {
            if let Ok(Some(investigation)) = stack.coordinator.get(&investigation_id) {
                if investigation.status.is_terminal() {
                    return investigation;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("terminal within the grace window");

    assert_eq!(investigation.status, InvestigationStatus::Cancelled);
    let completed_at = investigation.completed_at_unix_ms.expect("completed_at");
    assert!(completed_at.saturating_sub(cancel_issued_at) <= 1_000);
    // No synthesis happened after the cancel.
    assert!(investigation.summary.is_none());
}
