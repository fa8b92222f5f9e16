//! Query planner: intent classification, entity extraction, and execution
//! planning.
//!
//! The classifier backend is pluggable. The lexicon matcher is always
//! available and fully deterministic; an LLM-backed classifier can sit in
//! front of it, bounded in time, falling back to `unknown` with confidence 0
//! on timeout.

pub mod entities;
pub mod intent;
pub mod plan;

pub use entities::{extract_entities, EntityKind};
pub use intent::{
    Intent, IntentClassifier, IntentKind, LexiconIntentClassifier, LlmIntentClassifier,
};
pub use plan::{build_plan, ExecutionPlan, PlanError, PlanStep, QueryPlanner};
