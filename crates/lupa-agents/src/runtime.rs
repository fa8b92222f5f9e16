use async_trait::async_trait;
use serde_json::Value;

use crate::contract::{
    AgentContext, AgentError, AgentMessage, AgentResponse, QualityScore,
    DEFAULT_CONFIDENCE_THRESHOLD,
};

#[async_trait]
/// Capability set every specialist implements. `process` is the single entry
/// point; its concrete work is opaque to the core.
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    /// Human-facing capability tags for the `/agents` listing.
    fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }

    async fn process(
        &self,
        message: AgentMessage,
        context: &AgentContext,
    ) -> Result<AgentResponse, AgentError>;

    /// Quality check over a response the core considers weak. The default
    /// verdict accepts the response as-is; specialists override to request a
    /// bounded re-execution.
    async fn reflect(&self, response: &AgentResponse) -> QualityScore {
        QualityScore {
            score: response.confidence(),
            needs_retry: false,
            feedback: String::new(),
        }
    }

    /// Lifecycle hook; failure removes the agent from the active pool.
    async fn initialize(&self) -> Result<(), AgentError> {
        Ok(())
    }

    async fn shutdown(&self) {}
}

#[derive(Debug, Clone, Copy)]
/// Bounds for the reflective re-execution loop.
pub struct ReflectionConfig {
    pub confidence_threshold: f64,
    pub max_cycles: usize,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            max_cycles: 1,
        }
    }
}

/// Drives one `process` call through the reflection contract: a response
/// below the confidence threshold (or structurally invalid) is offered to
/// `reflect`, which may request up to `max_cycles` re-executions. Exhausting
/// the cycles with low confidence is still a completed response, annotated
/// `low_confidence`, never a failure.
pub async fn process_with_reflection(
    agent: &dyn Agent,
    message: AgentMessage,
    context: &AgentContext,
    config: ReflectionConfig,
) -> Result<AgentResponse, AgentError> {
    let started = std::time::Instant::now();
    let mut response = agent.process(message.clone(), context).await?;
    let mut cycles = 0usize;

    while cycles < config.max_cycles
        && (response.confidence() < config.confidence_threshold
            || !response.is_structurally_valid())
    {
        let verdict = agent.reflect(&response).await;
        if !verdict.needs_retry {
            break;
        }
        cycles += 1;
        tracing::debug!(
            agent_id = agent.id(),
            cycle = cycles,
            score = verdict.score,
            "reflection requested re-execution"
        );
        let retry_message = message
            .clone()
            .with_context("reflection_cycle", Value::from(cycles as u64))
            .with_context("reflection_feedback", Value::from(verdict.feedback));
        response = agent.process(retry_message, context).await?;
    }

    response.metadata.insert(
        "reflection_cycles".to_string(),
        Value::from(cycles as u64),
    );
    if response.confidence() < config.confidence_threshold {
        response
            .metadata
            .insert("low_confidence".to_string(), Value::from(true));
    }
    let elapsed_ms = started.elapsed().as_millis().try_into().unwrap_or(u64::MAX);
    Ok(response.with_processing_time(elapsed_ms))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;

    use super::{process_with_reflection, Agent, ReflectionConfig};
    use crate::contract::{
        AgentContext, AgentError, AgentMessage, AgentResponse, QualityScore,
    };

    /// Returns 0.4 confidence on the first attempt, 0.85 on the retry.
    struct SecondTryAnalyst {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Agent for SecondTryAnalyst {
        fn id(&self) -> &str {
            "analyst"
        }

        async fn process(
            &self,
            message: AgentMessage,
            _context: &AgentContext,
        ) -> Result<AgentResponse, AgentError> {
            let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
            if attempt == 0 {
                assert!(message.context.get("reflection_cycle").is_none());
                Ok(AgentResponse::completed("analyst", json!({ "narrow": true }), 0.4))
            } else {
                assert_eq!(
                    message.context.get("reflection_cycle"),
                    Some(&json!(1)),
                    "retry carries its cycle number"
                );
                Ok(AgentResponse::completed("analyst", json!({ "expanded": true }), 0.85))
            }
        }

        async fn reflect(&self, response: &AgentResponse) -> QualityScore {
            QualityScore {
                score: response.confidence(),
                needs_retry: true,
                feedback: "expandir janela de análise".to_string(),
            }
        }
    }

    struct StubbornlyUnsure;

    #[async_trait]
    impl Agent for StubbornlyUnsure {
        fn id(&self) -> &str {
            "detective"
        }

        async fn process(
            &self,
            _message: AgentMessage,
            _context: &AgentContext,
        ) -> Result<AgentResponse, AgentError> {
            Ok(AgentResponse::completed("detective", json!({}), 0.3))
        }

        async fn reflect(&self, response: &AgentResponse) -> QualityScore {
            QualityScore {
                score: response.confidence(),
                needs_retry: true,
                feedback: String::new(),
            }
        }
    }

    fn context() -> AgentContext {
        AgentContext::new("inv-1", "sess-1", None)
    }

    fn message() -> AgentMessage {
        AgentMessage::new("router", "analyst", "analyze", json!({}))
    }

    #[tokio::test]
    async fn functional_reflection_retries_once_and_reports_cycles() {
        let agent = SecondTryAnalyst {
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let response = process_with_reflection(
            &agent,
            message(),
            &context(),
            ReflectionConfig::default(),
        )
        .await
        .expect("reflection run");

        assert!((response.confidence() - 0.85).abs() < 1e-9);
        assert_eq!(response.metadata["reflection_cycles"], json!(1));
        assert!(response.metadata.get("low_confidence").is_none());
        assert_eq!(agent.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn functional_exhausted_reflection_completes_with_low_confidence_flag() {
        let response = process_with_reflection(
            &StubbornlyUnsure,
            message(),
            &context(),
            ReflectionConfig::default(),
        )
        .await
        .expect("reflection run");

        assert_eq!(response.metadata["reflection_cycles"], json!(1));
        assert_eq!(response.metadata["low_confidence"], json!(true));
        assert_eq!(response.status, crate::contract::AgentStatus::Completed);
    }

    #[tokio::test]
    async fn unit_confident_response_skips_reflection() {
        struct Confident;

        #[async_trait]
        impl Agent for Confident {
            fn id(&self) -> &str {
                "reporter"
            }

            async fn process(
                &self,
                _message: AgentMessage,
                _context: &AgentContext,
            ) -> Result<AgentResponse, AgentError> {
                Ok(AgentResponse::completed("reporter", json!({}), 0.95))
            }

            async fn reflect(&self, _response: &AgentResponse) -> QualityScore {
                panic!("reflect must not run for confident responses");
            }
        }

        let response = process_with_reflection(
            &Confident,
            message(),
            &context(),
            ReflectionConfig::default(),
        )
        .await
        .expect("reflection run");
        assert_eq!(response.metadata["reflection_cycles"], json!(0));
    }
}
