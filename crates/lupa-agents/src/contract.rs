use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use lupa_core::{current_unix_timestamp_ms, new_request_id};

/// Below this confidence the core invokes `reflect` before accepting a
/// response.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Terminal status of one `process` invocation.
pub enum AgentStatus {
    Completed,
    Failed,
}

#[derive(Debug, Error)]
/// Failures of the agent runtime. Routing falls back on all of these; the
/// investigation fails only when every fallback is exhausted.
pub enum AgentError {
    #[error("agent '{agent_id}' failed to process: {reason}")]
    ProcessFailed { agent_id: String, reason: String },
    #[error("agent '{agent_id}' failed to initialize: {reason}")]
    InitializationFailed { agent_id: String, reason: String },
    #[error("agent '{agent_id}' did not respond within {timeout_ms}ms")]
    Unresponsive { agent_id: String, timeout_ms: u64 },
    #[error("no agent registered under id '{agent_id}'")]
    UnknownAgent { agent_id: String },
    #[error("agent pool for '{agent_id}' is exhausted ({in_use}/{max})")]
    PoolExhausted {
        agent_id: String,
        in_use: usize,
        max: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Immutable message addressing one agent by id and naming an action.
pub struct AgentMessage {
    pub sender: String,
    pub recipient: String,
    pub action: String,
    pub payload: Value,
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    pub message_id: String,
    pub timestamp_unix_ms: u64,
}

impl AgentMessage {
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        action: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
            action: action.into(),
            payload,
            context: BTreeMap::new(),
            message_id: new_request_id(),
            timestamp_unix_ms: current_unix_timestamp_ms(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Immutable response from one `process` invocation. Exactly one of
/// `result` (completed) or `error` (failed) is populated.
pub struct AgentResponse {
    pub agent_name: String,
    pub status: AgentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    pub processing_time_ms: u64,
    pub timestamp_unix_ms: u64,
}

impl AgentResponse {
    pub fn completed(agent_name: impl Into<String>, result: Value, confidence: f64) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert(
            "confidence".to_string(),
            Value::from(confidence.clamp(0.0, 1.0)),
        );
        Self {
            agent_name: agent_name.into(),
            status: AgentStatus::Completed,
            result: Some(result),
            error: None,
            metadata,
            processing_time_ms: 0,
            timestamp_unix_ms: current_unix_timestamp_ms(),
        }
    }

    pub fn failed(agent_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            status: AgentStatus::Failed,
            result: None,
            error: Some(error.into()),
            metadata: BTreeMap::new(),
            processing_time_ms: 0,
            timestamp_unix_ms: current_unix_timestamp_ms(),
        }
    }

    pub fn with_processing_time(mut self, processing_time_ms: u64) -> Self {
        self.processing_time_ms = processing_time_ms;
        self
    }

    /// Reported confidence, defaulting to zero when the agent omitted it.
    pub fn confidence(&self) -> f64 {
        self.metadata
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
    }

    /// Structural validity: completed carries a result, failed carries an
    /// error, never both or neither.
    pub fn is_structurally_valid(&self) -> bool {
        match self.status {
            AgentStatus::Completed => self.result.is_some() && self.error.is_none(),
            AgentStatus::Failed => self.error.is_some() && self.result.is_none(),
        }
    }
}

#[derive(Debug, Clone)]
/// Context shared by reference across every agent of one investigation.
/// Metadata writes are append-only with a single writer per key.
pub struct AgentContext {
    pub investigation_id: String,
    pub user_id: Option<String>,
    pub session_id: String,
    pub request_id: String,
    metadata: Arc<Mutex<BTreeMap<String, Value>>>,
}

impl AgentContext {
    pub fn new(
        investigation_id: impl Into<String>,
        session_id: impl Into<String>,
        user_id: Option<String>,
    ) -> Self {
        Self {
            investigation_id: investigation_id.into(),
            user_id,
            session_id: session_id.into(),
            request_id: new_request_id(),
            metadata: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Appends one metadata entry. Overwrites violate the single-writer
    /// contract and are logged, not honored.
    pub fn put_metadata(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let mut metadata = lock_or_recover(&self.metadata);
        if metadata.contains_key(&key) {
            tracing::warn!(key, "metadata key already written, keeping first value");
            return;
        }
        metadata.insert(key, value);
    }

    pub fn metadata_snapshot(&self) -> BTreeMap<String, Value> {
        lock_or_recover(&self.metadata).clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Verdict of a `reflect` pass over a low-quality response.
pub struct QualityScore {
    /// In [0, 1].
    pub score: f64,
    pub needs_retry: bool,
    #[serde(default)]
    pub feedback: String,
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
