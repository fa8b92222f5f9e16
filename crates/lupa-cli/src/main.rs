use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use lupa_agents::{
    Agent, AgentPool, AgentPoolConfig, AnalystAgent, CommunicatorAgent, DetectiveAgent,
    ReporterAgent,
};
use lupa_ai::{CompletionClient, CompletionClientConfig};
use lupa_cache::LayeredCache;
use lupa_cli::Cli;
use lupa_coordinator::{CoordinatorConfig, InvestigationCoordinator};
use lupa_core::current_unix_timestamp_ms;
use lupa_federation::{
    DemoSourceClient, FederationExecutor, FederationExecutorConfig, HttpSourceClient, SourceClient,
};
use lupa_gateway::{run_gateway_server, GatewayState};
use lupa_memory::{EpisodicMemory, WorkingContextStore, DEFAULT_EPISODIC_RETENTION_DAYS};
use lupa_planner::{
    IntentClassifier, LexiconIntentClassifier, LlmIntentClassifier, QueryPlanner,
};
use lupa_resilience::{CircuitBreakerConfig, RetryPolicy};
use lupa_router::{Router, RouterConfig};
use lupa_sources::{builtin_catalog, SourceRegistry};
use lupa_store::{InvestigationStore, MemoryRowStore};
use lupa_stream::StreamConfig;

fn build_classifier(cli: &Cli) -> Arc<dyn IntentClassifier> {
    if cli.llm_classifier_enabled() {
        let config = CompletionClientConfig {
            api_base: cli.llm_api_base.clone(),
            api_key: cli.llm_api_key.clone().unwrap_or_default(),
            ..CompletionClientConfig::default()
        };
        match CompletionClient::new(config) {
            Ok(client) => {
                tracing::info!(
                    provider = cli.llm_provider.as_deref().unwrap_or_default(),
                    model = %cli.llm_model,
                    "LLM-backed intent classifier enabled"
                );
                return Arc::new(LlmIntentClassifier::new(
                    Arc::new(client),
                    cli.llm_model.clone(),
                    cli.llm_timeout_ms,
                ));
            }
            Err(error) => {
                tracing::warn!(error = %error, "classifier backend unusable, using lexicon");
            }
        }
    }
    Arc::new(LexiconIntentClassifier::new())
}

fn build_source_client(cli: &Cli) -> Result<Arc<dyn SourceClient>> {
    if cli.demo_mode() {
        tracing::warn!("TRANSPARENCY_API_KEY ausente: executando em modo demonstração");
        return Ok(Arc::new(DemoSourceClient));
    }
    let client = HttpSourceClient::new(
        cli.transparency_api_key.clone(),
        cli.source_fetch_timeout_ms,
    )
    .context("failed to build transparency HTTP client")?;
    Ok(Arc::new(client))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&cli.log_filter).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let state_dir = PathBuf::from(&cli.state_dir);
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;

    let registry = Arc::new(SourceRegistry::new(
        builtin_catalog(),
        CircuitBreakerConfig {
            failure_threshold: cli.circuit_breaker_failure_threshold,
            window_ms: 60_000,
            cooldown_ms: cli.circuit_breaker_cooldown_seconds.saturating_mul(1_000),
        },
    ));

    let planner = Arc::new(QueryPlanner::new(build_classifier(&cli), registry.clone()));
    let executor = Arc::new(FederationExecutor::new(
        registry.clone(),
        build_source_client(&cli)?,
        FederationExecutorConfig {
            per_source_timeout_ms: cli.source_fetch_timeout_ms,
            retry: RetryPolicy::default(),
        },
    ));

    let pool = AgentPool::new(AgentPoolConfig {
        max_per_type: cli.agent_pool_max_per_type,
    });
    pool.register("communicator", || Arc::new(CommunicatorAgent) as Arc<dyn Agent>);
    pool.register("detective", || Arc::new(DetectiveAgent) as Arc<dyn Agent>);
    pool.register("analyst", || Arc::new(AnalystAgent) as Arc<dyn Agent>);
    pool.register("reporter", || Arc::new(ReporterAgent) as Arc<dyn Agent>);
    let agent_router = Arc::new(Router::new(pool, RouterConfig::default()));

    let store = Arc::new(
        InvestigationStore::open(&state_dir.join("investigations.sqlite"))
            .context("failed to open investigation store")?,
    );
    let memory_rows = Arc::new(
        MemoryRowStore::open(&state_dir.join("memories.sqlite"))
            .context("failed to open memory store")?,
    );

    if cli.cache_backend_url.is_some() {
        tracing::warn!(
            "CACHE_BACKEND_URL definido, mas nenhum adaptador de KV está embutido; \
             usando somente memória"
        );
    }
    let cache = Arc::new(LayeredCache::new(1_024, None));

    let episodic = Arc::new(EpisodicMemory::new(
        memory_rows,
        DEFAULT_EPISODIC_RETENTION_DAYS,
    ));
    match episodic.purge_expired() {
        Ok(purged) if purged > 0 => {
            tracing::info!(purged, "expired episodic memories removed");
        }
        Ok(_) => {}
        Err(error) => tracing::warn!(error = %error, "episodic retention sweep failed"),
    }

    let coordinator = Arc::new(InvestigationCoordinator::new(
        planner,
        executor,
        agent_router.clone(),
        store.clone(),
        episodic,
        Arc::new(WorkingContextStore::new(32)),
        CoordinatorConfig {
            investigation_timeout_ms: cli.investigation_timeout_seconds.saturating_mul(1_000),
            stale_after_ms: 600_000,
        },
    ));

    match coordinator.recover_stale() {
        Ok(stale) if !stale.is_empty() => {
            tracing::warn!(count = stale.len(), "stale running investigations failed on restart");
        }
        Ok(_) => {}
        Err(error) => tracing::warn!(error = %error, "stale recovery sweep failed"),
    }

    let state = Arc::new(GatewayState {
        coordinator,
        agent_router,
        registry,
        store,
        cache,
        stream_config: StreamConfig {
            text_chunk_words: cli.stream_text_chunk_words,
            audio_chunk_bytes: cli.stream_audio_chunk_bytes,
            ..StreamConfig::default()
        },
        started_at_unix_ms: current_unix_timestamp_ms(),
    });

    run_gateway_server(state, &cli.bind).await
}
