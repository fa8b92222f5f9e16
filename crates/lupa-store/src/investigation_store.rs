use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection};
use serde_json::Value;

use lupa_core::current_unix_timestamp_ms;

use crate::model::{Investigation, InvestigationPhase, InvestigationStatus};

/// SQLite-backed investigation persistence. One write per status/phase
/// transition; readers see snapshot rows.
pub struct InvestigationStore {
    connection: Mutex<Connection>,
}

impl InvestigationStore {
    pub fn open(path: &Path) -> Result<Self> {
        let connection = Connection::open(path)
            .with_context(|| format!("failed to open investigation store {}", path.display()))?;
        Self::from_connection(connection)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(
            Connection::open_in_memory().context("failed to open in-memory store")?,
        )
    }

    fn from_connection(connection: Connection) -> Result<Self> {
        connection
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS investigations (
                    id TEXT PRIMARY KEY,
                    status TEXT NOT NULL,
                    progress REAL NOT NULL,
                    current_phase TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    started_at INTEGER,
                    completed_at INTEGER,
                    total_records_analyzed INTEGER NOT NULL DEFAULT 0,
                    anomalies_found INTEGER NOT NULL DEFAULT 0,
                    summary TEXT,
                    result_blob TEXT,
                    investigation_metadata TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_investigations_status
                    ON investigations(status);",
            )
            .context("failed to create investigations schema")?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    /// Inserts or replaces the full row. Called at every transition.
    pub fn upsert(&self, investigation: &Investigation) -> Result<()> {
        let connection = lock_or_recover(&self.connection);
        connection
            .execute(
                "INSERT OR REPLACE INTO investigations
                 (id, status, progress, current_phase, created_at, started_at, completed_at,
                  total_records_analyzed, anomalies_found, summary, result_blob,
                  investigation_metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    investigation.id,
                    investigation.status.as_str(),
                    investigation.progress,
                    investigation.current_phase.as_str(),
                    investigation.created_at_unix_ms as i64,
                    investigation.started_at_unix_ms.map(|v| v as i64),
                    investigation.completed_at_unix_ms.map(|v| v as i64),
                    investigation.total_records_analyzed as i64,
                    investigation.anomalies_found as i64,
                    investigation.summary,
                    investigation
                        .result_blob
                        .as_ref()
                        .map(|blob| blob.to_string()),
                    if investigation.metadata.is_null() {
                        None
                    } else {
                        Some(investigation.metadata.to_string())
                    },
                ],
            )
            .with_context(|| format!("failed to persist investigation {}", investigation.id))?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Investigation>> {
        let connection = lock_or_recover(&self.connection);
        let mut statement = connection
            .prepare(
                "SELECT id, status, progress, current_phase, created_at, started_at,
                        completed_at, total_records_analyzed, anomalies_found, summary,
                        result_blob, investigation_metadata
                 FROM investigations WHERE id = ?1",
            )
            .context("failed to prepare investigation query")?;
        let mut rows = statement
            .query(params![id])
            .context("failed to query investigation")?;
        let Some(row) = rows.next().context("failed to read investigation row")? else {
            return Ok(None);
        };
        Ok(Some(row_to_investigation(row)?))
    }

    /// Fails any `running` investigation older than `stale_after_ms`.
    /// Called once at startup; resumption is deliberately not attempted.
    pub fn fail_stale_running(&self, stale_after_ms: u64) -> Result<Vec<String>> {
        let now = current_unix_timestamp_ms();
        let cutoff = now.saturating_sub(stale_after_ms) as i64;
        let connection = lock_or_recover(&self.connection);

        let mut statement = connection
            .prepare("SELECT id FROM investigations WHERE status = 'running' AND created_at < ?1")
            .context("failed to prepare stale query")?;
        let stale_ids: Vec<String> = statement
            .query_map(params![cutoff], |row| row.get::<_, String>(0))
            .context("failed to query stale investigations")?
            .collect::<std::result::Result<_, _>>()
            .context("failed to read stale ids")?;
        drop(statement);

        for id in &stale_ids {
            connection
                .execute(
                    "UPDATE investigations
                     SET status = 'failed', completed_at = ?1,
                         investigation_metadata = json_set(
                             COALESCE(investigation_metadata, '{}'),
                             '$.failure_reason', 'stale_after_restart')
                     WHERE id = ?2",
                    params![now as i64, id],
                )
                .with_context(|| format!("failed to fail stale investigation {id}"))?;
            tracing::warn!(investigation_id = %id, "marked stale running investigation failed");
        }
        Ok(stale_ids)
    }

    pub fn count_by_status(&self, status: InvestigationStatus) -> Result<u64> {
        let connection = lock_or_recover(&self.connection);
        let count: i64 = connection
            .query_row(
                "SELECT COUNT(*) FROM investigations WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )
            .context("failed to count investigations")?;
        Ok(count as u64)
    }
}

fn row_to_investigation(row: &rusqlite::Row<'_>) -> Result<Investigation> {
    let status_raw: String = row.get(1).context("status column")?;
    let phase_raw: String = row.get(3).context("phase column")?;
    let result_blob: Option<String> = row.get(10).context("result_blob column")?;
    let metadata_raw: Option<String> = row.get(11).context("metadata column")?;

    Ok(Investigation {
        id: row.get(0).context("id column")?,
        status: InvestigationStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("unknown status '{status_raw}'"))?,
        progress: row.get(2).context("progress column")?,
        current_phase: InvestigationPhase::parse(&phase_raw)
            .ok_or_else(|| anyhow!("unknown phase '{phase_raw}'"))?,
        created_at_unix_ms: row.get::<_, i64>(4).context("created_at column")? as u64,
        started_at_unix_ms: row
            .get::<_, Option<i64>>(5)
            .context("started_at column")?
            .map(|v| v as u64),
        completed_at_unix_ms: row
            .get::<_, Option<i64>>(6)
            .context("completed_at column")?
            .map(|v| v as u64),
        total_records_analyzed: row.get::<_, i64>(7).context("records column")? as u64,
        anomalies_found: row.get::<_, i64>(8).context("anomalies column")? as u64,
        summary: row.get(9).context("summary column")?,
        result_blob: result_blob
            .map(|raw| serde_json::from_str::<Value>(&raw))
            .transpose()
            .context("result_blob decode")?,
        metadata: metadata_raw
            .map(|raw| serde_json::from_str::<Value>(&raw))
            .transpose()
            .context("metadata decode")?
            .unwrap_or(Value::Null),
    })
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
