//! Audit ledger queries. Append plus the count/list helpers reporting uses.

use super::{dt, ts, ComplianceStore};
use crate::{audit::AuditRecord, error::EngineResult};
use rusqlite::params;

impl ComplianceStore {
    pub fn append_audit(&self, record: &AuditRecord) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO audit_log (action, entity, entity_id, actor, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.action,
                record.entity,
                record.entity_id,
                record.actor,
                serde_json::to_string(&record.details)?,
                ts(record.timestamp),
            ],
        )?;
        Ok(())
    }

    pub fn audit_count(&self, action: &str) -> EngineResult<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM audit_log WHERE action = ?1",
                params![action],
                |row| row.get(0),
            )
            .map_err(Into::into)
    }

    pub fn recent_audit(&self, limit: usize) -> EngineResult<Vec<AuditRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT action, entity, entity_id, actor, details, created_at
             FROM audit_log
             ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for (action, entity, entity_id, actor, details, created_at) in rows {
            records.push(AuditRecord {
                action,
                entity,
                entity_id,
                actor,
                details: serde_json::from_str(&details)?,
                timestamp: dt(created_at),
            });
        }
        Ok(records)
    }
}
