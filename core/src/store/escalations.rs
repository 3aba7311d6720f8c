//! Escalation rule and history queries.

use super::{dt, ts, ComplianceStore};
use crate::{
    error::EngineResult,
    escalation::EscalationRecord,
    sla_tracker::EscalationRule,
};
use chrono::{DateTime, Utc};
use rusqlite::params;

impl ComplianceStore {
    pub fn upsert_escalation_rule(&self, rule: &EscalationRule) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO escalation_rule (
                rule_id, case_type, priority, sla_secs, target_level, notify_targets
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(rule_id) DO UPDATE SET
                case_type = excluded.case_type,
                priority = excluded.priority,
                sla_secs = excluded.sla_secs,
                target_level = excluded.target_level,
                notify_targets = excluded.notify_targets",
            params![
                rule.rule_id,
                rule.case_type,
                rule.priority,
                rule.sla_secs,
                rule.target_level,
                serde_json::to_string(&rule.notify_targets)?,
            ],
        )?;
        Ok(())
    }

    pub fn escalation_rules(&self) -> EngineResult<Vec<EscalationRule>> {
        let mut stmt = self.conn.prepare(
            "SELECT rule_id, case_type, priority, sla_secs, target_level, notify_targets
             FROM escalation_rule
             ORDER BY rule_id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut rules = Vec::with_capacity(rows.len());
        for (rule_id, case_type, priority, sla_secs, target_level, targets_json) in rows {
            rules.push(EscalationRule {
                rule_id,
                case_type,
                priority,
                sla_secs,
                target_level,
                notify_targets: serde_json::from_str(&targets_json)?,
            });
        }
        Ok(rules)
    }

    // ── History ledger ─────────────────────────────────────────

    pub fn insert_escalation(&self, record: &EscalationRecord) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO escalation_history (
                escalation_id, case_id, level, triggered_by,
                reason, actor, created_at, resolved_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.escalation_id,
                record.case_id,
                record.level,
                record.triggered_by,
                record.reason,
                record.actor,
                ts(record.created_at),
                record.resolved_at.map(ts),
            ],
        )?;
        Ok(())
    }

    pub fn get_escalation(&self, escalation_id: &str) -> EngineResult<Option<EscalationRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT escalation_id, case_id, level, triggered_by,
                    reason, actor, created_at, resolved_at
             FROM escalation_history WHERE escalation_id = ?1",
        )?;
        let record = stmt
            .query_row(params![escalation_id], escalation_row_mapper)
            .ok();
        Ok(record)
    }

    /// Set resolved_at once. Returns false when the row is unknown or was
    /// already resolved.
    pub fn resolve_escalation(
        &self,
        escalation_id: &str,
        resolved_at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let changed = self.conn.execute(
            "UPDATE escalation_history SET resolved_at = ?1
             WHERE escalation_id = ?2 AND resolved_at IS NULL",
            params![ts(resolved_at), escalation_id],
        )?;
        Ok(changed == 1)
    }

    pub fn escalations_for_case(&self, case_id: &str) -> EngineResult<Vec<EscalationRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT escalation_id, case_id, level, triggered_by,
                    reason, actor, created_at, resolved_at
             FROM escalation_history WHERE case_id = ?1
             ORDER BY created_at ASC, escalation_id ASC",
        )?;
        let rows = stmt.query_map(params![case_id], escalation_row_mapper)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// A case's active escalation: the latest row without resolved_at.
    pub fn latest_unresolved_escalation(
        &self,
        case_id: &str,
    ) -> EngineResult<Option<EscalationRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT escalation_id, case_id, level, triggered_by,
                    reason, actor, created_at, resolved_at
             FROM escalation_history
             WHERE case_id = ?1 AND resolved_at IS NULL
             ORDER BY created_at DESC, escalation_id DESC LIMIT 1",
        )?;
        let record = stmt.query_row(params![case_id], escalation_row_mapper).ok();
        Ok(record)
    }

    pub fn unresolved_escalation_count(&self) -> EngineResult<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM escalation_history WHERE resolved_at IS NULL",
                [],
                |row| row.get(0),
            )
            .map_err(Into::into)
    }
}

fn escalation_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<EscalationRecord> {
    Ok(EscalationRecord {
        escalation_id: row.get(0)?,
        case_id: row.get(1)?,
        level: row.get(2)?,
        triggered_by: row.get(3)?,
        reason: row.get(4)?,
        actor: row.get(5)?,
        created_at: dt(row.get(6)?),
        resolved_at: row.get::<_, Option<i64>>(7)?.map(dt),
    })
}
