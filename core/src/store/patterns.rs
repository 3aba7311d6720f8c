//! Pattern definition and detection queries.

use super::{dt, ts, ComplianceStore};
use crate::{
    error::EngineResult,
    pattern_detector::{PatternDefinition, PatternDetection},
};
use rusqlite::params;

impl ComplianceStore {
    pub fn upsert_pattern_definition(&self, def: &PatternDefinition) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO pattern_definition (pattern_id, category, window_secs, thresholds, active)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(pattern_id) DO UPDATE SET
                category = excluded.category,
                window_secs = excluded.window_secs,
                thresholds = excluded.thresholds,
                active = excluded.active",
            params![
                def.pattern_id,
                def.category,
                def.window_secs,
                serde_json::to_string(&def.thresholds)?,
                def.active,
            ],
        )?;
        Ok(())
    }

    pub fn deactivate_pattern_definition(&self, pattern_id: &str) -> EngineResult<bool> {
        let changed = self.conn.execute(
            "UPDATE pattern_definition SET active = 0 WHERE pattern_id = ?1 AND active = 1",
            params![pattern_id],
        )?;
        Ok(changed == 1)
    }

    pub fn active_pattern_definitions(&self) -> EngineResult<Vec<PatternDefinition>> {
        let mut stmt = self.conn.prepare(
            "SELECT pattern_id, category, window_secs, thresholds, active
             FROM pattern_definition WHERE active = 1
             ORDER BY pattern_id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)? != 0,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut defs = Vec::with_capacity(rows.len());
        for (pattern_id, category, window_secs, thresholds_json, active) in rows {
            match serde_json::from_str(&thresholds_json) {
                Ok(thresholds) => defs.push(PatternDefinition {
                    pattern_id,
                    category,
                    window_secs,
                    thresholds,
                    active,
                }),
                Err(err) => {
                    log::warn!("skipping pattern '{pattern_id}' with unparseable thresholds: {err}")
                }
            }
        }
        Ok(defs)
    }

    // ── Detections ─────────────────────────────────────────────

    /// Insert a detection, or — on fingerprint collision — bump the existing
    /// row's match_count and refresh its last_detected / severity /
    /// confidence. Returns the row as stored.
    pub fn upsert_detection(&self, d: &PatternDetection) -> EngineResult<PatternDetection> {
        self.conn.execute(
            "INSERT INTO pattern_detection (
                pattern_id, entity_id, window_start, window_end,
                severity, confidence, fingerprint, match_count,
                first_detected, last_detected
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(fingerprint) DO UPDATE SET
                match_count = match_count + 1,
                severity = excluded.severity,
                confidence = excluded.confidence,
                last_detected = excluded.last_detected",
            params![
                d.pattern_id,
                d.entity_id,
                ts(d.window_start),
                ts(d.window_end),
                d.severity,
                d.confidence,
                d.fingerprint,
                d.match_count,
                ts(d.first_detected),
                ts(d.last_detected),
            ],
        )?;
        self.get_detection(&d.fingerprint)?.ok_or_else(|| {
            crate::error::EngineError::NotFound {
                kind: "detection",
                id: d.fingerprint.clone(),
            }
        })
    }

    pub fn get_detection(&self, fingerprint: &str) -> EngineResult<Option<PatternDetection>> {
        let mut stmt = self.conn.prepare(
            "SELECT pattern_id, entity_id, window_start, window_end,
                    severity, confidence, fingerprint, match_count,
                    first_detected, last_detected
             FROM pattern_detection WHERE fingerprint = ?1",
        )?;
        let detection = stmt
            .query_row(params![fingerprint], detection_row_mapper)
            .ok();
        Ok(detection)
    }

    pub fn detections_for_entity(&self, entity_id: &str) -> EngineResult<Vec<PatternDetection>> {
        let mut stmt = self.conn.prepare(
            "SELECT pattern_id, entity_id, window_start, window_end,
                    severity, confidence, fingerprint, match_count,
                    first_detected, last_detected
             FROM pattern_detection WHERE entity_id = ?1
             ORDER BY last_detected DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![entity_id], detection_row_mapper)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn detection_count(&self) -> EngineResult<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM pattern_detection", [], |row| row.get(0))
            .map_err(Into::into)
    }
}

fn detection_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<PatternDetection> {
    Ok(PatternDetection {
        pattern_id: row.get(0)?,
        entity_id: row.get(1)?,
        window_start: dt(row.get(2)?),
        window_end: dt(row.get(3)?),
        severity: row.get(4)?,
        confidence: row.get(5)?,
        fingerprint: row.get(6)?,
        match_count: row.get(7)?,
        first_detected: dt(row.get(8)?),
        last_detected: dt(row.get(9)?),
    })
}
