//! Language-model client port used by the query planner.
//!
//! The planner treats the classifier backend as pluggable: a lexicon matcher
//! is always available, and when `LLM_PROVIDER` is configured the completion
//! client defined here backs the higher-accuracy path. Only chat-style text
//! completion is modeled; tool calling and media blocks are out of scope.
//! Retry semantics come from `lupa_resilience`; this crate adds only the
//! provider-specific pieces (transport classification, `Retry-After`, a
//! wall-clock retry budget).

pub mod client;
pub mod retry;
pub mod types;

pub use client::{CompletionClient, CompletionClientConfig};
pub use retry::{
    classify_transport_error, completion_retry_delay_ms, parse_retry_after_ms, RetryBudget,
};
pub use types::{
    is_retryable_ai_error, AiError, ChatRequest, ChatResponse, ChatUsage, LlmClient, Message,
    MessageRole,
};
