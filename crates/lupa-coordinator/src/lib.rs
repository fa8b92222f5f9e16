//! Investigation coordinator: owns one investigation end to end and is the
//! locus of ordering guarantees.
//!
//! Phase ordering is strict, progress advances at fixed checkpoints,
//! persistence happens at every transition, and cancellation propagates to
//! in-flight fetches, agents, and the stream emitter via a shared token.

pub mod coordinator;
pub mod outcome;

pub use coordinator::{CoordinatorConfig, InvestigationCoordinator};
pub use outcome::{ChatOutcome, Query};
