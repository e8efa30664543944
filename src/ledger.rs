//! SQLite assignment ledger.
//!
//! Append-only record of successful assignments, read back newest first by
//! the dashboard endpoints and `leadroute recent`. Nothing here feeds back
//! into selection or dedup.

use crate::engine::AssignmentResult;
use anyhow::Context;
use chrono::{DateTime, Local, NaiveTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Ledger path: `ledger.path` from config, else `~/.leadroute/ledger.db`.
pub fn default_path() -> anyhow::Result<PathBuf> {
    if let Ok(configured) = crate::config::get("ledger.path") {
        let path = PathBuf::from(configured);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating ledger directory: {}", parent.display()))?;
        }
        return Ok(path);
    }
    crate::home::ledger_path()
}

/// Midnight of `now`'s local calendar day, in UTC.
pub fn start_of_local_day(now: DateTime<Local>) -> DateTime<Utc> {
    now.date_naive()
        .and_time(NaiveTime::MIN)
        .and_local_timezone(Local)
        .earliest()
        .unwrap_or(now)
        .with_timezone(&Utc)
}

/// Stored timestamp form. Fixed width and always `Z`, so text order is time order.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// One persisted assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: i64,
    pub record_id: String,
    pub record_title: String,
    pub agent_id: String,
    pub agent_name: String,
    pub assigned_at: String,
}

pub struct Ledger {
    conn: Arc<Mutex<Connection>>,
}

impl Ledger {
    /// Open (or create) the ledger at the given path.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening ledger: {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub fn open_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA busy_timeout=5000;")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run schema migrations, tracked with `PRAGMA user_version`.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            conn.execute_batch(SCHEMA_V1)?;
            conn.pragma_update(None, "user_version", 1)?;
        }

        Ok(())
    }

    /// Append a successful assignment. Returns the new entry's ID.
    pub async fn append(&self, result: &AssignmentResult) -> anyhow::Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO assignments (record_id, record_title, agent_id, agent_name, assigned_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                result.record_id,
                result.record_title,
                result.agent_id,
                result.agent_name,
                timestamp(result.at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent entries, newest first.
    pub async fn recent(&self, limit: usize) -> anyhow::Result<Vec<LedgerEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, record_id, record_title, agent_id, agent_name, assigned_at
             FROM assignments ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(LedgerEntry {
                id: row.get(0)?,
                record_id: row.get(1)?,
                record_title: row.get(2)?,
                agent_id: row.get(3)?,
                agent_name: row.get(4)?,
                assigned_at: row.get(5)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("reading ledger entries")
    }

    /// Entries assigned at or after `since`.
    pub async fn assigned_since(&self, since: DateTime<Utc>) -> anyhow::Result<u64> {
        let conn = self.conn.lock().await;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM assignments WHERE assigned_at >= ?1",
            params![timestamp(since)],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    #[cfg(test)]
    pub async fn len(&self) -> anyhow::Result<u64> {
        let conn = self.conn.lock().await;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM assignments", [], |row| row.get(0))?;
        Ok(n as u64)
    }
}

/// Schema v1: no uniqueness on record_id; the ledger is an audit trail.
const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS assignments (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id     TEXT NOT NULL,
    record_title  TEXT NOT NULL DEFAULT '',
    agent_id      TEXT NOT NULL,
    agent_name    TEXT NOT NULL DEFAULT '',
    assigned_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_assignments_record ON assignments(record_id);
"#;
