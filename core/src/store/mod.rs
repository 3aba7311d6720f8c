//! SQLite persistence layer.
//!
//! RULE: Only the store module talks to the database. Engine components
//! call store methods — they never execute SQL directly. The store is the
//! single shared mutable state; no component holds authoritative state in
//! memory across calls.

mod audit;
mod cases;
mod escalations;
mod notifications;
mod patterns;
mod rules;

use crate::error::EngineResult;
use chrono::{DateTime, Utc};
use rusqlite::Connection;

pub struct ComplianceStore {
    conn: Connection,
    path: Option<String>, // None for :memory:, Some(path) for file
}

impl ComplianceStore {
    pub fn open(path: &str) -> EngineResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only works for real files (:memory: ignores it). The busy
        // timeout covers concurrent worker connections during breach scans.
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> EngineResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn, path: None })
    }

    /// Open an additional connection to the same database, for worker
    /// threads. For in-memory databases this yields an isolated database —
    /// callers check `is_file_backed()` first.
    pub fn reopen(&self) -> EngineResult<Self> {
        match &self.path {
            Some(p) => Self::open(p),
            None => Self::in_memory(),
        }
    }

    pub fn is_file_backed(&self) -> bool {
        self.path.is_some()
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> EngineResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_risk_rules.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_patterns.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/004_sla_escalation.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/005_notifications.sql"))?;
        Ok(())
    }
}

/// Seconds-since-epoch for TIMESTAMP columns.
pub(crate) fn ts(at: DateTime<Utc>) -> i64 {
    at.timestamp()
}

pub(crate) fn dt(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}
