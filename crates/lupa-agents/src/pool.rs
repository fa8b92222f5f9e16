use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use crate::contract::AgentError;
use crate::runtime::Agent;

type AgentFactory = Arc<dyn Fn() -> Arc<dyn Agent> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
/// Pool bounds. `max_per_type` caps concurrent handles per agent id.
pub struct AgentPoolConfig {
    pub max_per_type: usize,
}

impl Default for AgentPoolConfig {
    fn default() -> Self {
        Self { max_per_type: 4 }
    }
}

#[derive(Default)]
struct PoolInner {
    idle: BTreeMap<String, Vec<Arc<dyn Agent>>>,
    in_use: BTreeMap<String, usize>,
    initialized: BTreeSet<String>,
    disabled: BTreeSet<String>,
}

struct PoolShared {
    config: AgentPoolConfig,
    factories: Mutex<BTreeMap<String, AgentFactory>>,
    inner: Mutex<PoolInner>,
}

#[derive(Clone)]
/// Bounded, lazily populated agent registry. Acquisition hands out a scoped
/// handle that releases on every exit path; stateless agents are reused,
/// stateful ones are registered as singletons.
pub struct AgentPool {
    shared: Arc<PoolShared>,
}

/// Scoped handle to one pooled agent. Dropping it returns the agent.
pub struct AgentHandle {
    agent: Arc<dyn Agent>,
    agent_id: String,
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("agent_id", &self.agent_id)
            .finish()
    }
}

impl AgentHandle {
    pub fn agent(&self) -> &Arc<dyn Agent> {
        &self.agent
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        let mut inner = lock_or_recover(&self.shared.inner);
        if let Some(in_use) = inner.in_use.get_mut(&self.agent_id) {
            *in_use = in_use.saturating_sub(1);
        }
        let idle = inner.idle.entry(self.agent_id.clone()).or_default();
        if idle.len() < self.shared.config.max_per_type {
            idle.push(self.agent.clone());
        }
    }
}

impl AgentPool {
    pub fn new(config: AgentPoolConfig) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                config,
                factories: Mutex::new(BTreeMap::new()),
                inner: Mutex::new(PoolInner::default()),
            }),
        }
    }

    /// Registers a factory for a stateless agent type.
    pub fn register<F>(&self, agent_id: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Agent> + Send + Sync + 'static,
    {
        lock_or_recover(&self.shared.factories).insert(agent_id.into(), Arc::new(factory));
    }

    /// Registers a stateful agent as a process-wide singleton; every handle
    /// shares the same instance.
    pub fn register_singleton(&self, agent_id: impl Into<String>, agent: Arc<dyn Agent>) {
        let instance = agent.clone();
        self.register(agent_id, move || instance.clone());
    }

    pub fn registered_ids(&self) -> Vec<String> {
        lock_or_recover(&self.shared.factories)
            .keys()
            .cloned()
            .collect()
    }

    /// (agent id, capability tags, available) for every registered agent.
    pub fn describe(&self) -> Vec<(String, Vec<String>, bool)> {
        let factories: Vec<(String, AgentFactory)> = lock_or_recover(&self.shared.factories)
            .iter()
            .map(|(id, factory)| (id.clone(), factory.clone()))
            .collect();
        factories
            .into_iter()
            .map(|(id, factory)| {
                let capabilities = factory().capabilities();
                let available = self.is_available(&id);
                (id, capabilities, available)
            })
            .collect()
    }

    /// True when a handle for `agent_id` could be acquired right now.
    pub fn is_available(&self, agent_id: &str) -> bool {
        let has_factory = lock_or_recover(&self.shared.factories).contains_key(agent_id);
        if !has_factory {
            return false;
        }
        let inner = lock_or_recover(&self.shared.inner);
        if inner.disabled.contains(agent_id) {
            return false;
        }
        inner.in_use.get(agent_id).copied().unwrap_or(0) < self.shared.config.max_per_type
    }

    /// Fraction of the per-type bound currently handed out, in [0, 1].
    pub fn utilization(&self, agent_id: &str) -> f64 {
        let inner = lock_or_recover(&self.shared.inner);
        let in_use = inner.in_use.get(agent_id).copied().unwrap_or(0);
        in_use as f64 / self.shared.config.max_per_type.max(1) as f64
    }

    /// Acquires a scoped handle, lazily creating and initializing the agent.
    /// A failed `initialize` disables the agent id so the router can fall
    /// back instead of retrying a broken specialist.
    pub async fn acquire(&self, agent_id: &str) -> Result<AgentHandle, AgentError> {
        let factory = lock_or_recover(&self.shared.factories)
            .get(agent_id)
            .cloned()
            .ok_or_else(|| AgentError::UnknownAgent {
                agent_id: agent_id.to_string(),
            })?;

        let (agent, needs_initialize) = {
            let mut inner = lock_or_recover(&self.shared.inner);
            if inner.disabled.contains(agent_id) {
                return Err(AgentError::InitializationFailed {
                    agent_id: agent_id.to_string(),
                    reason: "disabled after failed initialization".to_string(),
                });
            }
            let in_use = inner.in_use.get(agent_id).copied().unwrap_or(0);
            if in_use >= self.shared.config.max_per_type {
                return Err(AgentError::PoolExhausted {
                    agent_id: agent_id.to_string(),
                    in_use,
                    max: self.shared.config.max_per_type,
                });
            }
            let agent = inner
                .idle
                .get_mut(agent_id)
                .and_then(Vec::pop)
                .unwrap_or_else(|| factory());
            *inner.in_use.entry(agent_id.to_string()).or_insert(0) += 1;
            let needs_initialize = inner.initialized.insert(agent_id.to_string());
            (agent, needs_initialize)
        };

        if needs_initialize {
            if let Err(error) = agent.initialize().await {
                let mut inner = lock_or_recover(&self.shared.inner);
                if let Some(in_use) = inner.in_use.get_mut(agent_id) {
                    *in_use = in_use.saturating_sub(1);
                }
                inner.initialized.remove(agent_id);
                inner.disabled.insert(agent_id.to_string());
                tracing::warn!(agent_id, error = %error, "agent removed from active pool");
                return Err(AgentError::InitializationFailed {
                    agent_id: agent_id.to_string(),
                    reason: error.to_string(),
                });
            }
        }

        Ok(AgentHandle {
            agent,
            agent_id: agent_id.to_string(),
            shared: self.shared.clone(),
        })
    }

    /// Invokes `shutdown` on every idle instance. Called at process exit.
    pub async fn shutdown_all(&self) {
        let idle: Vec<Arc<dyn Agent>> = {
            let mut inner = lock_or_recover(&self.shared.inner);
            inner.idle.values_mut().flat_map(std::mem::take).collect()
        };
        for agent in idle {
            agent.shutdown().await;
        }
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
