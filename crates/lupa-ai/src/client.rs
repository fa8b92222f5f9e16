use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::sleep;

use lupa_resilience::{FailureClass, RetryPolicy};

use crate::retry::{
    classify_transport_error, completion_retry_delay_ms, parse_retry_after_ms, RetryBudget,
};
use crate::types::{AiError, ChatRequest, ChatResponse, ChatUsage, LlmClient, Message};

#[derive(Debug, Clone)]
/// Connection settings for an OpenAI-compatible completion endpoint.
pub struct CompletionClientConfig {
    pub api_base: String,
    pub api_key: String,
    pub request_timeout_ms: u64,
    pub max_retries: usize,
    pub retry_budget_ms: u64,
    pub retry_jitter: bool,
}

impl Default for CompletionClientConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            request_timeout_ms: 30_000,
            max_retries: 2,
            retry_budget_ms: 20_000,
            retry_jitter: true,
        }
    }
}

#[derive(Debug, Clone)]
/// Chat completion client over the OpenAI-compatible wire shape.
pub struct CompletionClient {
    client: reqwest::Client,
    config: CompletionClientConfig,
}

impl CompletionClient {
    pub fn new(config: CompletionClientConfig) -> Result<Self, AiError> {
        if config.api_key.trim().is_empty() {
            return Err(AiError::MissingApiKey);
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let bearer = format!("Bearer {}", config.api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&bearer)
                .map_err(|e| AiError::InvalidResponse(format!("invalid API key header: {e}")))?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_millis(
                config.request_timeout_ms.max(1),
            ))
            .build()?;

        Ok(Self { client, config })
    }

    fn chat_completions_url(&self) -> String {
        let base = self.config.api_base.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            return base.to_string();
        }

        format!("{base}/chat/completions")
    }

    fn build_payload(&self, request: &ChatRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|message| {
                json!({
                    "role": match message.role {
                        crate::types::MessageRole::System => "system",
                        crate::types::MessageRole::User => "user",
                        crate::types::MessageRole::Assistant => "assistant",
                    },
                    "content": message.text,
                })
            })
            .collect();

        let mut payload = json!({
            "model": request.model,
            "messages": messages,
        });
        if request.json_mode {
            payload["response_format"] = json!({ "type": "json_object" });
        }
        if let Some(max_tokens) = request.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            payload["temperature"] = json!(temperature);
        }
        payload
    }
}

#[derive(Debug, Deserialize)]
struct WireCompletion {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

#[async_trait]
impl LlmClient for CompletionClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, AiError> {
        let url = self.chat_completions_url();
        let payload = self.build_payload(&request);
        let policy = RetryPolicy {
            max_attempts: self.config.max_retries.saturating_add(1),
            jitter: self.config.retry_jitter,
        };
        let budget = RetryBudget::start(self.config.retry_budget_ms);

        let mut attempt = 0usize;
        loop {
            let outcome = self.client.post(&url).json(&payload).send().await;

            let (status, headers, body) = match outcome {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let headers = response.headers().clone();
                    let body = response.text().await.unwrap_or_default();
                    (status, headers, body)
                }
                Err(error) => {
                    let class = classify_transport_error(&error);
                    if policy.allows_retry(attempt, class) {
                        let delay_ms = completion_retry_delay_ms(&policy, attempt, None);
                        if budget.allows_delay(delay_ms) {
                            attempt += 1;
                            sleep(std::time::Duration::from_millis(delay_ms)).await;
                            continue;
                        }
                    }
                    return Err(AiError::Http(error));
                }
            };

            if (200..300).contains(&status) {
                let parsed: WireCompletion = serde_json::from_str(&body)?;
                let choice = parsed.choices.into_iter().next().ok_or_else(|| {
                    AiError::InvalidResponse("completion response had no choices".to_string())
                })?;
                let text = choice.message.content.unwrap_or_default();
                let usage = parsed.usage.unwrap_or_default();
                return Ok(ChatResponse {
                    message: Message::assistant(text),
                    finish_reason: choice.finish_reason,
                    usage: ChatUsage {
                        input_tokens: usage.prompt_tokens,
                        output_tokens: usage.completion_tokens,
                        total_tokens: usage.total_tokens,
                    },
                });
            }

            let class = FailureClass::from_status(status);
            if policy.allows_retry(attempt, class) {
                let retry_after_ms = parse_retry_after_ms(&headers);
                let delay_ms = completion_retry_delay_ms(&policy, attempt, retry_after_ms);
                if budget.allows_delay(delay_ms) {
                    attempt += 1;
                    sleep(std::time::Duration::from_millis(delay_ms)).await;
                    continue;
                }
            }

            return Err(AiError::HttpStatus { status, body });
        }
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::{CompletionClient, CompletionClientConfig};
    use crate::types::{AiError, ChatRequest, LlmClient, Message};

    fn test_request() -> ChatRequest {
        ChatRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![Message::user("classificar: investigar contratos")],
            json_mode: false,
            max_tokens: Some(256),
            temperature: Some(0.0),
        }
    }

    fn client_for(server: &MockServer, max_retries: usize) -> CompletionClient {
        CompletionClient::new(CompletionClientConfig {
            api_base: server.base_url(),
            api_key: "test-key".to_string(),
            request_timeout_ms: 5_000,
            max_retries,
            retry_budget_ms: 0,
            retry_jitter: false,
        })
        .expect("client")
    }

    #[test]
    fn unit_client_requires_api_key() {
        let error = CompletionClient::new(CompletionClientConfig {
            api_key: "   ".to_string(),
            ..CompletionClientConfig::default()
        })
        .expect_err("blank key should fail");
        assert!(matches!(error, AiError::MissingApiKey));
    }

    #[tokio::test]
    async fn functional_complete_parses_first_choice() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).json_body(json!({
                "choices": [{
                    "message": { "role": "assistant", "content": "{\"intent\":\"investigate\"}" },
                    "finish_reason": "stop"
                }],
                "usage": { "prompt_tokens": 12, "completion_tokens": 6, "total_tokens": 18 }
            }));
        });

        let client = client_for(&server, 0);
        let response = client.complete(test_request()).await.expect("completion");
        mock.assert();
        assert_eq!(response.message.text, "{\"intent\":\"investigate\"}");
        assert_eq!(response.usage.total_tokens, 18);
    }

    #[tokio::test]
    async fn functional_complete_retries_retryable_status_then_succeeds() {
        let server = MockServer::start();
        let failing = server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(503).body("unavailable");
        });

        let client = client_for(&server, 1);
        let first = client.complete(test_request()).await;
        assert!(matches!(
            first,
            Err(AiError::HttpStatus { status: 503, .. })
        ));
        // Both the initial attempt and the single retry hit the endpoint.
        assert_eq!(failing.hits(), 2);
    }

    #[tokio::test]
    async fn regression_non_retryable_status_fails_without_retry() {
        let server = MockServer::start();
        let unauthorized = server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(401).body("unauthorized");
        });

        let client = client_for(&server, 3);
        let error = client
            .complete(test_request())
            .await
            .expect_err("401 must not be retried");
        assert!(matches!(error, AiError::HttpStatus { status: 401, .. }));
        assert_eq!(unauthorized.hits(), 1);
    }
}
