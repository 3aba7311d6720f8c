//! Risk rule engine — weighted, saturating risk assessment.
//!
//! Each assessment run:
//!   1. Filters the rule set to active rules applicable to the entity type
//!   2. Evaluates every rule's condition tree against the snapshot
//!   3. Persists one append-only RiskMatch per matching rule
//!   4. Sums score contributions, saturating at 100
//!
//! Determinism: for a fixed snapshot and rule set the matched set, total
//! score, and categories are identical on every call. The only per-run
//! value is the assessment id that keys the ledger rows.

use crate::{
    condition::{self, Condition},
    error::{EngineError, EngineResult},
    snapshot::EntitySnapshot,
    store::ComplianceStore,
    types::{EntityId, EntityType, RuleCategory},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Saturation ceiling: summed contributions never exceed this.
pub const MAX_TOTAL_SCORE: i64 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskRule {
    pub rule_id: String,
    pub name: String,
    pub category: RuleCategory,
    pub condition: Condition,
    /// Weight this rule contributes when it matches, 0..=100.
    pub risk_score: i64,
    /// Restrict the rule to one entity type. `None` applies to any.
    #[serde(default)]
    pub applies_to: Option<EntityType>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl RiskRule {
    /// Configuration sanity: score in range, tree within the depth cap.
    pub fn validate(&self, max_depth: usize) -> EngineResult<()> {
        if !(0..=MAX_TOTAL_SCORE).contains(&self.risk_score) {
            return Err(EngineError::Configuration {
                reason: format!(
                    "rule '{}' risk_score {} outside 0..=100",
                    self.rule_id, self.risk_score
                ),
            });
        }
        if self.condition.depth() > max_depth {
            return Err(EngineError::Configuration {
                reason: format!(
                    "rule '{}' condition tree deeper than {max_depth}",
                    self.rule_id
                ),
            });
        }
        Ok(())
    }

    pub fn applicable_to(&self, entity_type: EntityType) -> bool {
        self.active && self.applies_to.map_or(true, |t| t == entity_type)
    }
}

/// One row of the append-only match ledger. Never mutated after insert.
#[derive(Debug, Clone)]
pub struct RiskMatch {
    pub assessment_id: String,
    pub rule_id: String,
    pub entity_id: EntityId,
    pub entity_type: EntityType,
    pub matched_at: DateTime<Utc>,
    pub score_contribution: i64,
    /// The field values the rule's condition actually read, so the match
    /// stays explainable after the entity changes.
    pub matched_fields: Value,
}

#[derive(Debug, Clone)]
pub struct RiskAssessment {
    pub assessment_id: String,
    pub entity_id: EntityId,
    pub total_score: i64,
    pub matched_rules: Vec<RiskMatch>,
    /// Distinct categories of matched rules, in match order.
    pub categories: Vec<RuleCategory>,
}

pub struct RuleEngine<'a> {
    store: &'a ComplianceStore,
    max_condition_depth: usize,
}

impl<'a> RuleEngine<'a> {
    pub fn new(store: &'a ComplianceStore, max_condition_depth: usize) -> Self {
        Self { store, max_condition_depth }
    }

    /// Assess an entity against the active rule set in the store.
    pub fn assess(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        snapshot: &EntitySnapshot,
        now: DateTime<Utc>,
    ) -> EngineResult<RiskAssessment> {
        let rules = self.store.active_risk_rules()?;
        self.assess_with_rules(entity_type, entity_id, snapshot, &rules, now)
    }

    /// Same contract with an explicit rule set (backfills, what-if scoring).
    pub fn assess_with_rules(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        snapshot: &EntitySnapshot,
        rules: &[RiskRule],
        now: DateTime<Utc>,
    ) -> EngineResult<RiskAssessment> {
        let assessment_id = Uuid::new_v4().to_string();
        let mut matched_rules = Vec::new();
        let mut categories: Vec<RuleCategory> = Vec::new();

        for rule in rules.iter().filter(|r| r.applicable_to(entity_type)) {
            // A malformed rule is skipped, never fatal for the run.
            if let Err(err) = rule.validate(self.max_condition_depth) {
                log::warn!("skipping rule '{}': {err}", rule.rule_id);
                continue;
            }

            if condition::evaluate(&rule.condition, snapshot, self.max_condition_depth) {
                matched_rules.push(RiskMatch {
                    assessment_id: assessment_id.clone(),
                    rule_id: rule.rule_id.clone(),
                    entity_id: entity_id.to_string(),
                    entity_type,
                    matched_at: now,
                    score_contribution: rule.risk_score,
                    matched_fields: field_snapshot(&rule.condition, snapshot),
                });
                if !categories.contains(&rule.category) {
                    categories.push(rule.category);
                }
            }
        }

        for m in &matched_rules {
            self.store.insert_risk_match(m)?;
        }

        let raw: i64 = matched_rules.iter().map(|m| m.score_contribution).sum();
        let total_score = raw.min(MAX_TOTAL_SCORE);

        log::debug!(
            "assessed {entity_id}: score={total_score} matches={}",
            matched_rules.len()
        );

        Ok(RiskAssessment {
            assessment_id,
            entity_id: entity_id.to_string(),
            total_score,
            matched_rules,
            categories,
        })
    }

    /// Current score for an entity: the latest assessment's matches only,
    /// saturated. Earlier assessments stay in the ledger for audit.
    pub fn current_risk_score(&self, entity_id: &str) -> EngineResult<i64> {
        let raw = self.store.latest_assessment_score(entity_id)?;
        Ok(raw.min(MAX_TOTAL_SCORE))
    }
}

/// Capture the values of every field the condition read. Absent fields are
/// recorded as null so the snapshot shows what the rule saw.
fn field_snapshot(condition: &Condition, snapshot: &EntitySnapshot) -> Value {
    let mut map = Map::new();
    for field in condition.leaf_fields() {
        map.insert(
            field.to_string(),
            snapshot.resolve(field).cloned().unwrap_or(Value::Null),
        );
    }
    Value::Object(map)
}
