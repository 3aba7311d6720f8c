//! Risk rule and match-ledger queries.

use super::{dt, ts, ComplianceStore};
use crate::{
    error::EngineResult,
    rule_engine::{RiskMatch, RiskRule},
};
use rusqlite::params;

impl ComplianceStore {
    /// Insert or replace a rule definition. Edits overwrite in place;
    /// existing matches keep their own field snapshots, so they stay
    /// explainable regardless.
    pub fn upsert_risk_rule(&self, rule: &RiskRule) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO risk_rule (rule_id, name, category, condition, risk_score, applies_to, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(rule_id) DO UPDATE SET
                name = excluded.name,
                category = excluded.category,
                condition = excluded.condition,
                risk_score = excluded.risk_score,
                applies_to = excluded.applies_to,
                active = excluded.active",
            params![
                rule.rule_id,
                rule.name,
                rule.category,
                serde_json::to_string(&rule.condition)?,
                rule.risk_score,
                rule.applies_to,
                rule.active,
            ],
        )?;
        Ok(())
    }

    /// Rules are deactivated, never deleted.
    pub fn deactivate_risk_rule(&self, rule_id: &str) -> EngineResult<bool> {
        let changed = self.conn.execute(
            "UPDATE risk_rule SET active = 0 WHERE rule_id = ?1 AND active = 1",
            params![rule_id],
        )?;
        Ok(changed == 1)
    }

    pub fn get_risk_rule(&self, rule_id: &str) -> EngineResult<Option<RiskRule>> {
        let mut stmt = self.conn.prepare(
            "SELECT rule_id, name, category, condition, risk_score, applies_to, active
             FROM risk_rule WHERE rule_id = ?1",
        )?;
        let row = stmt
            .query_row(params![rule_id], raw_rule_mapper)
            .ok();
        match row {
            Some(raw) => Ok(Some(parse_rule(raw)?)),
            None => Ok(None),
        }
    }

    /// Active rules in stable (rule_id) order. A rule whose stored
    /// condition no longer parses is skipped with a warning — one bad rule
    /// never takes down assessment.
    pub fn active_risk_rules(&self) -> EngineResult<Vec<RiskRule>> {
        let mut stmt = self.conn.prepare(
            "SELECT rule_id, name, category, condition, risk_score, applies_to, active
             FROM risk_rule WHERE active = 1
             ORDER BY rule_id ASC",
        )?;
        let raw_rows = stmt
            .query_map([], raw_rule_mapper)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut rules = Vec::with_capacity(raw_rows.len());
        for raw in raw_rows {
            match parse_rule(raw) {
                Ok(rule) => rules.push(rule),
                Err(err) => log::warn!("skipping unparseable risk rule: {err}"),
            }
        }
        Ok(rules)
    }

    pub fn risk_rule_count(&self) -> EngineResult<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM risk_rule", [], |row| row.get(0))
            .map_err(Into::into)
    }

    // ── Match ledger ───────────────────────────────────────────

    pub fn insert_risk_match(&self, m: &RiskMatch) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO risk_match (
                assessment_id, rule_id, entity_id, entity_type,
                matched_at, score_contribution, matched_fields
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                m.assessment_id,
                m.rule_id,
                m.entity_id,
                m.entity_type,
                ts(m.matched_at),
                m.score_contribution,
                serde_json::to_string(&m.matched_fields)?,
            ],
        )?;
        Ok(())
    }

    pub fn matches_for_assessment(&self, assessment_id: &str) -> EngineResult<Vec<RiskMatch>> {
        let mut stmt = self.conn.prepare(
            "SELECT assessment_id, rule_id, entity_id, entity_type,
                    matched_at, score_contribution, matched_fields
             FROM risk_match WHERE assessment_id = ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![assessment_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut matches = Vec::with_capacity(rows.len());
        for (assessment_id, rule_id, entity_id, entity_type, matched_at, score, fields) in rows {
            matches.push(RiskMatch {
                assessment_id,
                rule_id,
                entity_id,
                entity_type,
                matched_at: dt(matched_at),
                score_contribution: score,
                matched_fields: serde_json::from_str(&fields)?,
            });
        }
        Ok(matches)
    }

    /// Unsaturated score of the entity's latest assessment. The ledger is
    /// append-only; "current" means the newest run's matches only.
    pub fn latest_assessment_score(&self, entity_id: &str) -> EngineResult<i64> {
        self.conn
            .query_row(
                "SELECT COALESCE(SUM(score_contribution), 0) FROM risk_match
                 WHERE assessment_id = (
                     SELECT assessment_id FROM risk_match
                     WHERE entity_id = ?1
                     ORDER BY matched_at DESC, id DESC LIMIT 1
                 )",
                params![entity_id],
                |row| row.get(0),
            )
            .map_err(Into::into)
    }

    pub fn risk_match_count(&self, entity_id: &str) -> EngineResult<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM risk_match WHERE entity_id = ?1",
                params![entity_id],
                |row| row.get(0),
            )
            .map_err(Into::into)
    }
}

type RawRule = (String, String, crate::types::RuleCategory, String, i64, Option<crate::types::EntityType>, bool);

fn raw_rule_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRule> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get::<_, i64>(6)? != 0,
    ))
}

fn parse_rule(raw: RawRule) -> EngineResult<RiskRule> {
    let (rule_id, name, category, condition_json, risk_score, applies_to, active) = raw;
    Ok(RiskRule {
        rule_id,
        name,
        category,
        condition: serde_json::from_str(&condition_json)?,
        risk_score,
        applies_to,
        active,
    })
}
