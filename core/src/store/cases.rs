//! Case and SLA-tracking queries, including the compare-and-swap that
//! guards every escalation-level change.

use super::{dt, ts, ComplianceStore};
use crate::{
    error::EngineResult,
    sla_tracker::{CaseRecord, SlaTracking},
    types::{CaseState, Level, Version},
};
use chrono::{DateTime, Utc};
use rusqlite::params;

impl ComplianceStore {
    pub fn insert_case(&self, case: &CaseRecord) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO compliance_case (case_id, case_type, priority, state, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                case.case_id,
                case.case_type,
                case.priority,
                case.state,
                ts(case.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_case(&self, case_id: &str) -> EngineResult<Option<CaseRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT case_id, case_type, priority, state, created_at
             FROM compliance_case WHERE case_id = ?1",
        )?;
        let case = stmt
            .query_row(params![case_id], |row| {
                Ok(CaseRecord {
                    case_id: row.get(0)?,
                    case_type: row.get(1)?,
                    priority: row.get(2)?,
                    state: row.get(3)?,
                    created_at: dt(row.get(4)?),
                })
            })
            .ok();
        Ok(case)
    }

    pub fn set_case_state(&self, case_id: &str, state: CaseState) -> EngineResult<()> {
        self.conn.execute(
            "UPDATE compliance_case SET state = ?1 WHERE case_id = ?2",
            params![state, case_id],
        )?;
        Ok(())
    }

    pub fn open_case_count(&self) -> EngineResult<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM compliance_case WHERE state != 'closed'",
                [],
                |row| row.get(0),
            )
            .map_err(Into::into)
    }

    // ── SLA tracking ───────────────────────────────────────────

    pub fn insert_sla_tracking(&self, row: &SlaTracking) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO sla_tracking (
                case_id, stage, deadline, breached,
                current_escalation_level, version, active
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                row.case_id,
                row.stage,
                ts(row.deadline),
                row.breached,
                row.current_escalation_level,
                row.version,
                row.active,
            ],
        )?;
        Ok(())
    }

    pub fn get_sla(&self, case_id: &str) -> EngineResult<Option<SlaTracking>> {
        let mut stmt = self.conn.prepare(
            "SELECT case_id, stage, deadline, breached,
                    current_escalation_level, version, active
             FROM sla_tracking WHERE case_id = ?1",
        )?;
        let row = stmt.query_row(params![case_id], sla_row_mapper).ok();
        Ok(row)
    }

    /// Active rows past their deadline at `now`. Read-only by design: the
    /// breach flag is mutated by the escalation coordinator, not here.
    pub fn overdue_slas(&self, now: DateTime<Utc>) -> EngineResult<Vec<SlaTracking>> {
        let mut stmt = self.conn.prepare(
            "SELECT case_id, stage, deadline, breached,
                    current_escalation_level, version, active
             FROM sla_tracking
             WHERE active = 1 AND deadline < ?1
             ORDER BY deadline ASC, case_id ASC",
        )?;
        let rows = stmt.query_map(params![ts(now)], sla_row_mapper)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// The optimistic-concurrency write: level, stage and version move
    /// together, conditioned on the version the writer read. Returns false
    /// when another writer got there first.
    pub fn cas_escalation_update(
        &self,
        case_id: &str,
        new_level: Level,
        mark_breached: bool,
        expected_version: Version,
    ) -> EngineResult<bool> {
        let changed = self.conn.execute(
            "UPDATE sla_tracking SET
                current_escalation_level = ?1,
                stage = 'escalated',
                breached = CASE WHEN ?2 THEN 1 ELSE breached END,
                version = version + 1
             WHERE case_id = ?3 AND version = ?4",
            params![new_level, mark_breached, case_id, expected_version],
        )?;
        Ok(changed == 1)
    }

    pub fn mark_sla_breached(&self, case_id: &str) -> EngineResult<()> {
        self.conn.execute(
            "UPDATE sla_tracking SET breached = 1 WHERE case_id = ?1",
            params![case_id],
        )?;
        Ok(())
    }

    /// Deactivate tracking when the case closes.
    pub fn close_sla(&self, case_id: &str) -> EngineResult<()> {
        self.conn.execute(
            "UPDATE sla_tracking SET active = 0, stage = 'closed' WHERE case_id = ?1",
            params![case_id],
        )?;
        Ok(())
    }

    pub fn breached_sla_count(&self) -> EngineResult<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM sla_tracking WHERE breached = 1",
                [],
                |row| row.get(0),
            )
            .map_err(Into::into)
    }
}

fn sla_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<SlaTracking> {
    Ok(SlaTracking {
        case_id: row.get(0)?,
        stage: row.get(1)?,
        deadline: dt(row.get(2)?),
        breached: row.get::<_, i64>(3)? != 0,
        current_escalation_level: row.get(4)?,
        version: row.get(5)?,
        active: row.get::<_, i64>(6)? != 0,
    })
}
