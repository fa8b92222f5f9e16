//! Router / dispatcher: maps a classified intent onto an ordered set of
//! agents and drives dispatch with fallback.
//!
//! The intent-to-agent table here is the single authoritative copy; routing
//! decisions are recorded under `metadata.orchestration` so traces can show
//! why an agent answered.

pub mod dispatcher;
pub mod route_table;

pub use dispatcher::{Router, RouterConfig};
pub use route_table::{agents_for_intent, default_action_for_intent};
