use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use lupa_core::current_unix_timestamp_ms;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// One durable memory row. `scope` partitions episodic and semantic
/// entries; `owner` gates explicit deletes.
pub struct MemoryRow {
    pub scope: String,
    pub key: String,
    pub owner: String,
    pub payload: Value,
    pub created_at_unix_ms: u64,
    pub expires_at_unix_ms: Option<u64>,
}

/// Memory persistence shared by the episodic and semantic stores. Writes
/// are additive; deletes require the owning identity.
pub struct MemoryRowStore {
    connection: Mutex<Connection>,
}

impl MemoryRowStore {
    pub fn open(path: &Path) -> Result<Self> {
        let connection = Connection::open(path)
            .with_context(|| format!("failed to open memory store {}", path.display()))?;
        Self::from_connection(connection)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory().context("failed to open memory db")?)
    }

    fn from_connection(connection: Connection) -> Result<Self> {
        connection
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS memories (
                    scope TEXT NOT NULL,
                    key TEXT NOT NULL,
                    owner TEXT NOT NULL DEFAULT 'system',
                    payload TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    expires_at INTEGER,
                    PRIMARY KEY (scope, key)
                );
                CREATE INDEX IF NOT EXISTS idx_memories_scope ON memories(scope);",
            )
            .context("failed to create memories schema")?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    /// Appends a row. An existing (scope, key) is kept untouched: memory
    /// writes are additive, not upserts.
    pub fn append(&self, row: &MemoryRow) -> Result<bool> {
        let connection = lock_or_recover(&self.connection);
        let inserted = connection
            .execute(
                "INSERT OR IGNORE INTO memories
                 (scope, key, owner, payload, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    row.scope,
                    row.key,
                    row.owner,
                    row.payload.to_string(),
                    row.created_at_unix_ms as i64,
                    row.expires_at_unix_ms.map(|v| v as i64),
                ],
            )
            .with_context(|| format!("failed to append memory {}/{}", row.scope, row.key))?;
        Ok(inserted > 0)
    }

    pub fn list_scope(&self, scope: &str) -> Result<Vec<MemoryRow>> {
        let now = current_unix_timestamp_ms() as i64;
        let connection = lock_or_recover(&self.connection);
        let mut statement = connection
            .prepare(
                "SELECT scope, key, owner, payload, created_at, expires_at
                 FROM memories
                 WHERE scope = ?1 AND (expires_at IS NULL OR expires_at > ?2)
                 ORDER BY created_at ASC, key ASC",
            )
            .context("failed to prepare scope query")?;
        let rows = statement
            .query_map(params![scope, now], row_to_memory)
            .context("failed to query scope")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to read memory rows")?;
        rows.into_iter().collect()
    }

    pub fn list_scope_prefix(&self, prefix: &str) -> Result<Vec<MemoryRow>> {
        let now = current_unix_timestamp_ms() as i64;
        let pattern = format!("{prefix}%");
        let connection = lock_or_recover(&self.connection);
        let mut statement = connection
            .prepare(
                "SELECT scope, key, owner, payload, created_at, expires_at
                 FROM memories
                 WHERE scope LIKE ?1 AND (expires_at IS NULL OR expires_at > ?2)
                 ORDER BY created_at ASC, key ASC",
            )
            .context("failed to prepare prefix query")?;
        let rows = statement
            .query_map(params![pattern, now], row_to_memory)
            .context("failed to query prefix")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to read memory rows")?;
        rows.into_iter().collect()
    }

    /// Deletes one row, honoring ownership. Returns whether a row went away.
    pub fn delete(&self, scope: &str, key: &str, owner: &str) -> Result<bool> {
        let connection = lock_or_recover(&self.connection);
        let deleted = connection
            .execute(
                "DELETE FROM memories WHERE scope = ?1 AND key = ?2 AND owner = ?3",
                params![scope, key, owner],
            )
            .with_context(|| format!("failed to delete memory {scope}/{key}"))?;
        Ok(deleted > 0)
    }

    /// Drops expired rows; retention enforcement for episodic memory.
    pub fn purge_expired(&self) -> Result<u64> {
        let now = current_unix_timestamp_ms() as i64;
        let connection = lock_or_recover(&self.connection);
        let purged = connection
            .execute(
                "DELETE FROM memories WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now],
            )
            .context("failed to purge expired memories")?;
        Ok(purged as u64)
    }
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<MemoryRow>> {
    let payload_raw: String = row.get(3)?;
    Ok((|| {
        Ok(MemoryRow {
            scope: row.get(0).context("scope column")?,
            key: row.get(1).context("key column")?,
            owner: row.get(2).context("owner column")?,
            payload: serde_json::from_str(&payload_raw).context("payload decode")?,
            created_at_unix_ms: row.get::<_, i64>(4).context("created_at column")? as u64,
            expires_at_unix_ms: row
                .get::<_, Option<i64>>(5)
                .context("expires_at column")?
                .map(|v| v as u64),
        })
    })())
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use lupa_core::current_unix_timestamp_ms;

    use super::{MemoryRow, MemoryRowStore};

    fn row(scope: &str, key: &str, owner: &str) -> MemoryRow {
        MemoryRow {
            scope: scope.to_string(),
            key: key.to_string(),
            owner: owner.to_string(),
            payload: json!({ "summary": "contratos acima da mediana" }),
            created_at_unix_ms: current_unix_timestamp_ms(),
            expires_at_unix_ms: None,
        }
    }

    #[test]
    fn functional_append_is_additive_not_upsert() {
        let store = MemoryRowStore::open_in_memory().expect("store");
        assert!(store.append(&row("episodic:inv-1", "e-1", "system")).expect("first"));
        let mut replacement = row("episodic:inv-1", "e-1", "system");
        replacement.payload = json!({ "summary": "substituído" });
        assert!(!store.append(&replacement).expect("second"));

        let rows = store.list_scope("episodic:inv-1").expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].payload["summary"], "contratos acima da mediana");
    }

    #[test]
    fn functional_delete_requires_owning_identity() {
        let store = MemoryRowStore::open_in_memory().expect("store");
        store.append(&row("semantic", "m-1", "user-42")).expect("append");

        assert!(!store.delete("semantic", "m-1", "user-7").expect("wrong owner"));
        assert_eq!(store.list_scope("semantic").expect("list").len(), 1);

        assert!(store.delete("semantic", "m-1", "user-42").expect("owner"));
        assert!(store.list_scope("semantic").expect("list").is_empty());
    }

    #[test]
    fn functional_expired_rows_are_invisible_and_purgeable() {
        let store = MemoryRowStore::open_in_memory().expect("store");
        let mut expiring = row("episodic:inv-2", "e-1", "system");
        expiring.expires_at_unix_ms = Some(current_unix_timestamp_ms().saturating_sub(1_000));
        store.append(&expiring).expect("append");

        assert!(store.list_scope("episodic:inv-2").expect("list").is_empty());
        assert_eq!(store.purge_expired().expect("purge"), 1);
    }

    #[test]
    fn unit_prefix_listing_spans_scopes() {
        let store = MemoryRowStore::open_in_memory().expect("store");
        store.append(&row("episodic:inv-1", "e-1", "system")).expect("a");
        store.append(&row("episodic:inv-2", "e-1", "system")).expect("b");
        store.append(&row("semantic", "m-1", "system")).expect("c");

        let episodic = store.list_scope_prefix("episodic:").expect("prefix");
        assert_eq!(episodic.len(), 2);
    }
}
