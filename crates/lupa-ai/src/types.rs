use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Role attached to a chat message.
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// A single text chat message.
pub struct Message {
    pub role: MessageRole,
    pub text: String,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            text: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// A chat completion request sent to a provider.
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub json_mode: bool,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
/// Token accounting reported by the provider.
pub struct ChatUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// A completed chat turn.
pub struct ChatResponse {
    pub message: Message,
    pub finish_reason: Option<String>,
    pub usage: ChatUsage,
}

#[derive(Debug, Error)]
/// Errors surfaced by completion clients.
pub enum AiError {
    #[error("missing API key")]
    MissingApiKey,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned non-success status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl AiError {
    /// Classified cause, using the same failure classes as source fetches.
    pub fn failure_class(&self) -> lupa_resilience::FailureClass {
        use lupa_resilience::FailureClass;
        match self {
            Self::HttpStatus { status, .. } => FailureClass::from_status(*status),
            Self::Http(inner) => crate::retry::classify_transport_error(inner),
            Self::MissingApiKey => FailureClass::Auth,
            Self::Serde(_) | Self::InvalidResponse(_) => FailureClass::Invalid,
        }
    }
}

#[async_trait]
/// Trait contract for chat completion backends.
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, AiError>;
}

/// Returns true for failures worth a same-route retry.
pub fn is_retryable_ai_error(error: &AiError) -> bool {
    error.failure_class().is_transient()
}
