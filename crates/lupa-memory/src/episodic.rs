use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

use lupa_core::{current_unix_timestamp_ms, new_request_id, retention_expiry_unix_ms};
use lupa_store::{MemoryRow, MemoryRowStore};

pub const DEFAULT_EPISODIC_RETENTION_DAYS: u64 = 90;

/// Durable per-investigation memory, used for reflection and audit. Entries
/// expire after the retention window.
pub struct EpisodicMemory {
    store: Arc<MemoryRowStore>,
    retention_days: u64,
}

impl EpisodicMemory {
    pub fn new(store: Arc<MemoryRowStore>, retention_days: u64) -> Self {
        Self {
            store,
            retention_days: retention_days.max(1),
        }
    }

    fn scope(investigation_id: &str) -> String {
        format!("episodic:{investigation_id}")
    }

    /// Appends one event to the investigation's episode.
    pub fn record(&self, investigation_id: &str, kind: &str, payload: Value) -> Result<()> {
        let now = current_unix_timestamp_ms();
        let row = MemoryRow {
            scope: Self::scope(investigation_id),
            key: format!("{kind}:{}", new_request_id()),
            owner: "system".to_string(),
            payload,
            created_at_unix_ms: now,
            expires_at_unix_ms: Some(retention_expiry_unix_ms(now, self.retention_days)),
        };
        self.store.append(&row)?;
        Ok(())
    }

    /// All retained events for one investigation, oldest first.
    pub fn events(&self, investigation_id: &str) -> Result<Vec<MemoryRow>> {
        self.store.list_scope(&Self::scope(investigation_id))
    }

    /// Retention sweep; returns how many rows aged out.
    pub fn purge_expired(&self) -> Result<u64> {
        self.store.purge_expired()
    }
}
