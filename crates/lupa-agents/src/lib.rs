//! Agent runtime: capability contract, reflective re-execution, and the
//! bounded agent pool.
//!
//! An agent's concrete work is specialist and opaque to the core; the
//! contracts here are the single `process` entry point, the quality-gated
//! `reflect` second attempt, and lifecycle hooks whose failure removes the
//! agent from the active pool.

pub mod contract;
pub mod pool;
pub mod runtime;
pub mod specialists;

pub use contract::{
    AgentContext, AgentError, AgentMessage, AgentResponse, AgentStatus, QualityScore,
    DEFAULT_CONFIDENCE_THRESHOLD,
};
pub use pool::{AgentHandle, AgentPool, AgentPoolConfig};
pub use runtime::{process_with_reflection, Agent, ReflectionConfig};
pub use specialists::{AnalystAgent, CommunicatorAgent, DetectiveAgent, ReporterAgent};
