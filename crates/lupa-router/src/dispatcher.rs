use serde_json::{json, Value};

use lupa_agents::{
    process_with_reflection, AgentContext, AgentError, AgentMessage, AgentPool, AgentResponse,
    AgentStatus, ReflectionConfig,
};
use lupa_planner::Intent;

use crate::route_table::{agents_for_intent, default_action_for_intent};

#[derive(Debug, Clone, Copy)]
/// Dispatch tunables. `secondary_confidence_threshold` is the floor below
/// which the router keeps trying fallbacks even for completed responses.
pub struct RouterConfig {
    pub secondary_confidence_threshold: f64,
    pub agent_timeout_ms: u64,
    pub reflection: ReflectionConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            secondary_confidence_threshold: 0.5,
            agent_timeout_ms: 60_000,
            reflection: ReflectionConfig::default(),
        }
    }
}

/// Drives one intent through its agent set: primary first, then the static
/// fallback order, re-ranked by pool utilization (ties by lexicographic id).
pub struct Router {
    pool: AgentPool,
    config: RouterConfig,
}

impl Router {
    pub fn new(pool: AgentPool, config: RouterConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &AgentPool {
        &self.pool
    }

    /// Ordered candidate list for an intent. Primary is the suggested agent
    /// when it is healthy, else the table head; the remaining table entries
    /// follow re-ranked by (utilization, lexicographic id).
    pub fn candidates_for(&self, intent: &Intent) -> Vec<String> {
        let table = agents_for_intent(intent.kind);
        let mut candidates = Vec::with_capacity(table.len() + 1);
        if self.pool.is_available(&intent.suggested_agent_id) {
            candidates.push(intent.suggested_agent_id.clone());
        } else if let Some(head) = table.first() {
            candidates.push((*head).to_string());
        }

        let mut fallbacks: Vec<&str> = table
            .iter()
            .copied()
            .filter(|candidate| !candidates.iter().any(|existing| existing == candidate))
            .collect();
        fallbacks.sort_by(|a, b| {
            self.pool
                .utilization(a)
                .partial_cmp(&self.pool.utilization(b))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(b))
        });
        candidates.extend(fallbacks.into_iter().map(str::to_string));
        candidates
    }

    /// Dispatches the intent, returning the first acceptable response.
    /// Completed-but-weak responses are kept as a last resort; the dispatch
    /// fails only when every candidate errored outright.
    pub async fn dispatch(
        &self,
        intent: &Intent,
        payload: Value,
        context: &AgentContext,
    ) -> Result<AgentResponse, AgentError> {
        let action = default_action_for_intent(intent.kind);
        let candidates = self.candidates_for(intent);
        let primary = candidates
            .first()
            .cloned()
            .unwrap_or_else(|| intent.suggested_agent_id.clone());

        let mut attempted: Vec<String> = Vec::new();
        let mut weakest_accepted: Option<AgentResponse> = None;
        let mut last_error: Option<AgentError> = None;

        for candidate in &candidates {
            attempted.push(candidate.clone());
            let handle = match self.pool.acquire(candidate).await {
                Ok(handle) => handle,
                Err(error) => {
                    tracing::warn!(agent_id = %candidate, error = %error, "acquisition failed");
                    last_error = Some(error);
                    continue;
                }
            };

            let message = AgentMessage::new("router", candidate.clone(), action, payload.clone());
            let processed = tokio::time::timeout(
                std::time::Duration::from_millis(self.config.agent_timeout_ms.max(1)),
                process_with_reflection(
                    handle.agent().as_ref(),
                    message,
                    context,
                    self.config.reflection,
                ),
            )
            .await;

            let response = match processed {
                Ok(Ok(response)) => response,
                Ok(Err(error)) => {
                    tracing::warn!(agent_id = %candidate, error = %error, "agent failed");
                    last_error = Some(error);
                    continue;
                }
                Err(_) => {
                    tracing::warn!(
                        agent_id = %candidate,
                        timeout_ms = self.config.agent_timeout_ms,
                        "agent unresponsive, abandoning"
                    );
                    last_error = Some(AgentError::Unresponsive {
                        agent_id: candidate.clone(),
                        timeout_ms: self.config.agent_timeout_ms,
                    });
                    continue;
                }
            };

            if response.status == AgentStatus::Failed {
                last_error = Some(AgentError::ProcessFailed {
                    agent_id: candidate.clone(),
                    reason: response.error.clone().unwrap_or_default(),
                });
                continue;
            }

            if response.confidence() >= self.config.secondary_confidence_threshold {
                return Ok(self.annotate(response, &primary, &attempted, candidate));
            }

            // Completed but weak: remember the best one and keep trying.
            let keep = match &weakest_accepted {
                Some(existing) => response.confidence() > existing.confidence(),
                None => true,
            };
            if keep {
                weakest_accepted = Some(self.annotate(response, &primary, &attempted, candidate));
            }
        }

        if let Some(response) = weakest_accepted {
            return Ok(response);
        }
        Err(last_error.unwrap_or(AgentError::UnknownAgent {
            agent_id: intent.suggested_agent_id.clone(),
        }))
    }

    fn annotate(
        &self,
        mut response: AgentResponse,
        primary: &str,
        attempted: &[String],
        selected: &str,
    ) -> AgentResponse {
        response.metadata.insert(
            "orchestration".to_string(),
            json!({
                "primary": primary,
                "attempted": attempted,
                "selected": selected,
                "fallbacks_used": attempted.len().saturating_sub(1),
            }),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;

    use lupa_agents::{
        Agent, AgentContext, AgentError, AgentMessage, AgentPool, AgentPoolConfig, AgentResponse,
    };
    use lupa_planner::{Intent, IntentKind};

    use super::{Router, RouterConfig};

    struct ScriptedAgent {
        id: String,
        confidence: f64,
        fail: bool,
        delay_ms: u64,
    }

    #[async_trait]
    impl Agent for ScriptedAgent {
        fn id(&self) -> &str {
            &self.id
        }

        async fn process(
            &self,
            _message: AgentMessage,
            _context: &AgentContext,
        ) -> Result<AgentResponse, AgentError> {
            if self.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            }
            if self.fail {
                return Ok(AgentResponse::failed(self.id.clone(), "sem dados"));
            }
            Ok(AgentResponse::completed(
                self.id.clone(),
                json!({ "from": self.id }),
                self.confidence,
            ))
        }
    }

    fn register(pool: &AgentPool, id: &str, confidence: f64, fail: bool, delay_ms: u64) {
        let id_owned = id.to_string();
        pool.register(id, move || {
            Arc::new(ScriptedAgent {
                id: id_owned.clone(),
                confidence,
                fail,
                delay_ms,
            }) as Arc<dyn Agent>
        });
    }

    fn intent(kind: IntentKind, suggested: &str) -> Intent {
        Intent {
            kind,
            entities: BTreeMap::new(),
            confidence: 0.9,
            suggested_agent_id: suggested.to_string(),
        }
    }

    fn context() -> AgentContext {
        AgentContext::new("inv-1", "sess-1", None)
    }

    #[tokio::test]
    async fn functional_primary_agent_answers_when_healthy() {
        let pool = AgentPool::new(AgentPoolConfig::default());
        register(&pool, "detective", 0.9, false, 0);
        register(&pool, "analyst", 0.9, false, 0);
        let router = Router::new(pool, RouterConfig::default());

        let response = router
            .dispatch(
                &intent(IntentKind::Investigate, "detective"),
                json!({}),
                &context(),
            )
            .await
            .expect("dispatch");

        assert_eq!(response.agent_name, "detective");
        assert_eq!(response.metadata["orchestration"]["selected"], "detective");
        assert_eq!(response.metadata["orchestration"]["fallbacks_used"], json!(0));
    }

    #[tokio::test]
    async fn functional_failed_primary_falls_back_in_table_order() {
        let pool = AgentPool::new(AgentPoolConfig::default());
        register(&pool, "detective", 0.9, true, 0);
        register(&pool, "analyst", 0.8, false, 0);
        let router = Router::new(pool, RouterConfig::default());

        let response = router
            .dispatch(
                &intent(IntentKind::Investigate, "detective"),
                json!({}),
                &context(),
            )
            .await
            .expect("dispatch");

        assert_eq!(response.agent_name, "analyst");
        assert_eq!(response.metadata["orchestration"]["primary"], "detective");
        assert_eq!(response.metadata["orchestration"]["fallbacks_used"], json!(1));
    }

    #[tokio::test]
    async fn functional_unknown_suggestion_uses_table_head() {
        let pool = AgentPool::new(AgentPoolConfig::default());
        register(&pool, "detective", 0.9, false, 0);
        register(&pool, "analyst", 0.9, false, 0);
        let router = Router::new(pool, RouterConfig::default());

        let response = router
            .dispatch(
                &intent(IntentKind::Investigate, "tier3-ghost"),
                json!({}),
                &context(),
            )
            .await
            .expect("dispatch");
        assert_eq!(response.agent_name, "detective");
    }

    #[tokio::test]
    async fn functional_weak_responses_are_kept_as_last_resort() {
        let pool = AgentPool::new(AgentPoolConfig::default());
        register(&pool, "detective", 0.3, false, 0);
        register(&pool, "analyst", 0.4, false, 0);
        let router = Router::new(pool, RouterConfig::default());

        let response = router
            .dispatch(
                &intent(IntentKind::Investigate, "detective"),
                json!({}),
                &context(),
            )
            .await
            .expect("dispatch");

        // Both candidates were weak; the stronger one is returned rather
        // than failing the investigation.
        assert_eq!(response.agent_name, "analyst");
        assert_eq!(response.metadata["low_confidence"], json!(true));
    }

    #[tokio::test]
    async fn regression_all_failures_surface_an_agent_error() {
        let pool = AgentPool::new(AgentPoolConfig::default());
        register(&pool, "detective", 0.0, true, 0);
        register(&pool, "analyst", 0.0, true, 0);
        let router = Router::new(pool, RouterConfig::default());

        let error = router
            .dispatch(
                &intent(IntentKind::Investigate, "detective"),
                json!({}),
                &context(),
            )
            .await
            .expect_err("all candidates failed");
        assert!(matches!(error, AgentError::ProcessFailed { .. }));
    }

    #[tokio::test]
    async fn regression_unresponsive_agent_is_abandoned_after_timeout() {
        let pool = AgentPool::new(AgentPoolConfig::default());
        register(&pool, "detective", 0.9, false, 5_000);
        register(&pool, "analyst", 0.9, false, 0);
        let router = Router::new(
            pool,
            RouterConfig {
                agent_timeout_ms: 100,
                ..RouterConfig::default()
            },
        );

        let response = router
            .dispatch(
                &intent(IntentKind::Investigate, "detective"),
                json!({}),
                &context(),
            )
            .await
            .expect("fallback after hang");
        assert_eq!(response.agent_name, "analyst");
    }
}
