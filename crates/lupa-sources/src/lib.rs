//! Static catalog of transparency data sources and their dynamic health.
//!
//! Sources are declared at startup and never destroyed; health is a function
//! of each source's circuit-breaker state, owned by the registry.

pub mod catalog;
pub mod registry;
pub mod types;

pub use catalog::builtin_catalog;
pub use registry::{CallOutcome, SourceHealth, SourceRegistry};
pub use types::{Capability, Source, SourceFamily, SourceFilters};
