use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use lupa_cache::LayeredCache;
use lupa_coordinator::{InvestigationCoordinator, Query};
use lupa_core::{elapsed_ms_since, new_request_id};
use lupa_router::Router as AgentRouter;
use lupa_sources::SourceRegistry;
use lupa_store::InvestigationStore;
use lupa_stream::{stream_channel, StreamConfig};

/// Shared state handed to every handler.
pub struct GatewayState {
    pub coordinator: Arc<InvestigationCoordinator>,
    pub agent_router: Arc<AgentRouter>,
    pub registry: Arc<SourceRegistry>,
    pub store: Arc<InvestigationStore>,
    pub cache: Arc<LayeredCache>,
    pub stream_config: StreamConfig,
    pub started_at_unix_ms: u64,
}

#[derive(Debug, Deserialize)]
struct ChatMessageRequest {
    message: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    options: Value,
}

#[derive(Debug, Deserialize)]
struct CreateInvestigationRequest {
    query: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

fn bad_request(message: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": { "kind": "input_error", "message": message } })),
    )
}

fn internal_error(message: String) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": { "kind": "system_error", "message": message } })),
    )
}

fn query_from_chat(request: ChatMessageRequest) -> Result<Query, (StatusCode, Json<Value>)> {
    if request.message.trim().is_empty() {
        return Err(bad_request("message must not be empty"));
    }
    let session_id = request
        .session_id
        .filter(|session| !session.trim().is_empty())
        .unwrap_or_else(|| format!("sess-{}", new_request_id()));
    Ok(Query {
        text: request.message,
        session_id,
        user_id: request.user_id,
        options: request.options,
    })
}

async fn handle_chat_message(
    State(state): State<Arc<GatewayState>>,
    Json(request): Json<ChatMessageRequest>,
) -> axum::response::Response {
    let query = match query_from_chat(request) {
        Ok(query) => query,
        Err(rejection) => return rejection.into_response(),
    };
    let outcome = state.coordinator.handle_chat(query, None).await;
    Json(outcome).into_response()
}

async fn handle_chat_stream(
    State(state): State<Arc<GatewayState>>,
    Json(request): Json<ChatMessageRequest>,
) -> axum::response::Response {
    let query = match query_from_chat(request) {
        Ok(query) => query,
        Err(rejection) => return rejection.into_response(),
    };

    let (emitter, receiver) = stream_channel(state.stream_config);
    let coordinator = state.coordinator.clone();
    tokio::spawn(async move {
        let _ = coordinator.handle_chat(query, Some(&emitter)).await;
    });

    let events: std::pin::Pin<
        Box<dyn Stream<Item = std::result::Result<Event, Infallible>> + Send>,
    > = Box::pin(receiver.map(|event| {
        let payload = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().event(event.tag()).data(payload))
    }));
    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn handle_create_investigation(
    State(state): State<Arc<GatewayState>>,
    Json(request): Json<CreateInvestigationRequest>,
) -> axum::response::Response {
    if request.query.trim().is_empty() {
        return bad_request("query must not be empty").into_response();
    }
    let session_id = request
        .session_id
        .unwrap_or_else(|| format!("sess-{}", new_request_id()));
    let query = Query {
        text: request.query,
        session_id,
        user_id: request.user_id,
        options: Value::Null,
    };
    match state.coordinator.spawn_investigation(query) {
        Ok(investigation_id) => {
            Json(json!({ "investigation_id": investigation_id })).into_response()
        }
        Err(error) => internal_error(error.to_string()).into_response(),
    }
}

async fn handle_get_investigation(
    State(state): State<Arc<GatewayState>>,
    AxumPath(investigation_id): AxumPath<String>,
) -> axum::response::Response {
    match state.store.get(&investigation_id) {
        Ok(Some(investigation)) => Json(investigation).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": { "kind": "input_error", "message": "unknown investigation" } })),
        )
            .into_response(),
        Err(error) => internal_error(error.to_string()).into_response(),
    }
}

async fn handle_public_results(
    State(state): State<Arc<GatewayState>>,
    AxumPath(investigation_id): AxumPath<String>,
) -> axum::response::Response {
    match state.store.get(&investigation_id) {
        Ok(Some(investigation)) => Json(investigation.public_projection()).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": { "kind": "input_error", "message": "unknown investigation" } })),
        )
            .into_response(),
        Err(error) => internal_error(error.to_string()).into_response(),
    }
}

async fn handle_cancel_investigation(
    State(state): State<Arc<GatewayState>>,
    AxumPath(investigation_id): AxumPath<String>,
) -> axum::response::Response {
    let cancelled = state.coordinator.cancel(&investigation_id);
    Json(json!({ "investigation_id": investigation_id, "cancelled": cancelled })).into_response()
}

async fn handle_list_agents(State(state): State<Arc<GatewayState>>) -> axum::response::Response {
    let agents: Vec<Value> = state
        .agent_router
        .pool()
        .describe()
        .into_iter()
        .map(|(id, capabilities, available)| {
            json!({
                "agent_id": id,
                "capabilities": capabilities,
                "available": available,
            })
        })
        .collect();
    Json(json!({ "agents": agents })).into_response()
}

async fn handle_health(State(state): State<Arc<GatewayState>>) -> axum::response::Response {
    let health = state.registry.health_snapshot();
    let healthy = health
        .iter()
        .filter(|source| state.registry.is_healthy(&source.source_id))
        .count();
    let storage_ok = state.store.count_by_status(lupa_store::InvestigationStatus::Running);
    let status = if storage_ok.is_ok() { "ok" } else { "degraded" };
    let body = json!({
        "status": status,
        "uptime_ms": elapsed_ms_since(state.started_at_unix_ms),
        "sources": { "declared": health.len(), "healthy": healthy },
        "storage": storage_ok.is_ok(),
        "cache_memory_only": state.cache.memory_only(),
    });
    let code = if storage_ok.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body)).into_response()
}

/// Builds the HTTP router over the shared state.
pub fn build_gateway_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/chat/message", post(handle_chat_message))
        .route("/chat/stream", post(handle_chat_stream))
        .route("/investigations", post(handle_create_investigation))
        .route("/investigations/{id}", get(handle_get_investigation))
        .route(
            "/investigations/public/results/{id}",
            get(handle_public_results),
        )
        .route(
            "/investigations/{id}/cancel",
            post(handle_cancel_investigation),
        )
        .route("/agents", get(handle_list_agents))
        .route("/health", get(handle_health))
        .with_state(state)
}

/// Binds and serves until the process ends.
pub async fn run_gateway_server(state: Arc<GatewayState>, bind: &str) -> Result<()> {
    let address: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid gateway socket address '{bind}'"))?;
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("failed to bind gateway on {address}"))?;
    let local = listener.local_addr().context("failed to read bound address")?;
    tracing::info!(%local, "gateway listening");
    axum::serve(listener, build_gateway_router(state))
        .await
        .context("gateway server stopped unexpectedly")
}
