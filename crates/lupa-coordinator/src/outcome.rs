use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Immutable user query as received by the HTTP layer.
pub struct Query {
    pub text: String,
    pub session_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub options: Value,
}

impl Query {
    pub fn new(text: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            session_id: session_id.into(),
            user_id: None,
            options: Value::Null,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Synchronous chat reply. `message` is never empty: failures carry an
/// intent-conditioned fallback text instead.
pub struct ChatOutcome {
    pub session_id: String,
    pub message_id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub message: String,
    pub confidence: f64,
    #[serde(default)]
    pub suggested_actions: Vec<String>,
    #[serde(default)]
    pub follow_up_questions: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
}
