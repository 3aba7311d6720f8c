//! Audit sink records.
//!
//! RULE: every escalation transition, rule-configuration change, and
//! pattern-detection batch run emits exactly one structured record. The
//! sink is write-only from the engine's point of view; the count/list
//! helpers on the store exist for reporting and tests.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Stable action names for the `audit_log.action` column.
pub mod actions {
    pub const RULE_UPSERTED: &str = "rule_upserted";
    pub const RULE_DEACTIVATED: &str = "rule_deactivated";
    pub const PATTERN_BATCH_RUN: &str = "pattern_batch_run";
    pub const CASE_OPENED: &str = "case_opened";
    pub const CASE_CLOSED: &str = "case_closed";
    pub const ESCALATION_TRIGGERED: &str = "escalation_triggered";
    pub const ESCALATION_RESOLVED: &str = "escalation_resolved";
}

/// Actor recorded for transitions the engine performs on its own.
pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub action: String,
    pub entity: String,
    pub entity_id: String,
    pub actor: String,
    pub details: Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        action: &str,
        entity: &str,
        entity_id: &str,
        actor: &str,
        details: Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            action: action.to_string(),
            entity: entity.to_string(),
            entity_id: entity_id.to_string(),
            actor: actor.to_string(),
            details,
            timestamp,
        }
    }
}
