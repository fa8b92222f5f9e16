//! Persistent state: investigation records and memory rows over SQLite.
//!
//! The coordinator writes at every status transition so a crash between
//! phases is observable; stale `running` rows are failed on restart rather
//! than resumed, avoiding double side-effects.

pub mod investigation_store;
pub mod memory_rows;
pub mod model;

pub use investigation_store::InvestigationStore;
pub use memory_rows::{MemoryRow, MemoryRowStore};
pub use model::{Investigation, InvestigationPhase, InvestigationStatus};
