use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::Serialize;

use crate::scheduler::{EventRecorder, SessionEvent, TerminationReason};
use crate::store::{SqliteCounterStore, StoreResult};

/// A journaled event as read back from the database.
#[derive(Debug, Clone, Serialize)]
pub struct JournalEntry {
    pub id: i64,
    pub session_id: String,
    pub at: DateTime<Utc>,
    pub state: String,
    pub kind: String,
    pub reason: Option<String>,
    pub action_count: i64,
    pub daily_count: i64,
    pub total_count: i64,
    pub detail: Option<String>,
    /// The full event as recorded, when it could be serialized.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl JournalEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let payload: Option<String> = row.get("payload")?;
        Ok(Self {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            at: row.get("ts")?,
            state: row.get("state")?,
            kind: row.get("kind")?,
            reason: row.get("reason")?,
            action_count: row.get("action_count")?,
            daily_count: row.get("daily_count")?,
            total_count: row.get("total_count")?,
            detail: row.get("detail")?,
            payload: payload.and_then(|raw| serde_json::from_str(&raw).ok()),
        })
    }

    /// Termination reason with its fault message, read from the payload.
    pub fn termination_reason(&self) -> Option<TerminationReason> {
        let reason = self.payload.as_ref()?.get("reason")?;
        serde_json::from_value(reason.clone()).ok()
    }
}

/// Append-only event history in the `session_events` table.
#[derive(Debug, Clone)]
pub struct SqliteEventJournal {
    store: SqliteCounterStore,
}

impl SqliteEventJournal {
    pub fn new(store: SqliteCounterStore) -> Self {
        Self { store }
    }

    pub fn initialize(&self) -> StoreResult<()> {
        self.store.initialize()
    }

    /// Most recent entries, oldest first.
    pub fn recent(&self, limit: usize) -> StoreResult<Vec<JournalEntry>> {
        let conn = self.store.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM (
                SELECT * FROM session_events ORDER BY id DESC LIMIT ?1
             ) ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![limit as i64])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(JournalEntry::from_row(row)?);
        }
        Ok(entries)
    }

    /// Drops everything but the newest `keep` entries.
    pub fn trim(&self, keep: usize) -> StoreResult<usize> {
        let conn = self.store.open()?;
        let removed = conn.execute(
            "DELETE FROM session_events WHERE id NOT IN (
                SELECT id FROM session_events ORDER BY id DESC LIMIT ?1
             )",
            params![keep as i64],
        )?;
        Ok(removed)
    }
}

impl EventRecorder for SqliteEventJournal {
    fn record(&self, event: &SessionEvent) -> StoreResult<()> {
        let payload = serde_json::to_string(event)?;
        let conn = self.store.open()?;
        conn.execute(
            "INSERT INTO session_events (
                session_id, ts, state, kind, reason, action_count, daily_count,
                total_count, detail, payload
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                event.session_id.to_string(),
                event.at,
                event.state.as_str(),
                event.kind.as_str(),
                event.reason.as_ref().map(|reason| reason.code()),
                event.action_count as i64,
                event.daily_count as i64,
                event.total_count as i64,
                &event.detail,
                payload
            ],
        )?;
        Ok(())
    }
}
