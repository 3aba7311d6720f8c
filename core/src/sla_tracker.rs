//! SLA tracker — deadline derivation and breach queries.
//!
//! RULES:
//!   - `check_breaches` is a pure read over persisted rows plus the caller's
//!     clock. It never mutates `breached`; that belongs to the escalation
//!     coordinator, so breach detection and transition stay separately
//!     testable and idempotent.
//!   - The deadline comes from the most specific escalation rule for the
//!     case's (type, priority) pair; with none configured, the system
//!     default duration applies and is logged as a configuration fallback.

use crate::{
    error::EngineResult,
    store::ComplianceStore,
    types::{CaseId, CasePriority, CaseState, Level, Version},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct CaseRecord {
    pub case_id: CaseId,
    pub case_type: String,
    pub priority: CasePriority,
    pub state: CaseState,
    pub created_at: DateTime<Utc>,
}

/// The engine's working row per tracked case. One active row per open case.
#[derive(Debug, Clone)]
pub struct SlaTracking {
    pub case_id: CaseId,
    pub stage: CaseState,
    pub deadline: DateTime<Utc>,
    pub breached: bool,
    pub current_escalation_level: Level,
    pub version: Version,
    pub active: bool,
}

/// Escalation policy entry. `case_type`/`priority` of `None` match any case;
/// the matcher prefers the most specific applicable rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRule {
    pub rule_id: String,
    #[serde(default)]
    pub case_type: Option<String>,
    #[serde(default)]
    pub priority: Option<CasePriority>,
    pub sla_secs: i64,
    pub target_level: Level,
    #[serde(default)]
    pub notify_targets: Vec<String>,
}

pub struct SlaTracker<'a> {
    store: &'a ComplianceStore,
    default_sla: Duration,
}

impl<'a> SlaTracker<'a> {
    pub fn new(store: &'a ComplianceStore, default_sla: Duration) -> Self {
        Self { store, default_sla }
    }

    /// Derive the deadline for a new case and persist its tracking row.
    pub fn start_tracking(&self, case: &CaseRecord) -> EngineResult<SlaTracking> {
        let rules = self.store.escalation_rules()?;
        let sla = match matching_rule(&rules, &case.case_type, case.priority) {
            Some(rule) => Duration::seconds(rule.sla_secs),
            None => {
                log::warn!(
                    "no escalation rule for ({}, {}); using default SLA",
                    case.case_type,
                    case.priority
                );
                self.default_sla
            }
        };

        let row = SlaTracking {
            case_id: case.case_id.clone(),
            stage: case.state,
            deadline: case.created_at + sla,
            breached: false,
            current_escalation_level: 0,
            version: 0,
            active: true,
        };
        self.store.insert_sla_tracking(&row)?;
        Ok(row)
    }

    /// All active rows past their deadline at `now` — newly breached or
    /// already breached and still open. Pure read; nothing is mutated.
    pub fn check_breaches(&self, now: DateTime<Utc>) -> EngineResult<Vec<SlaTracking>> {
        self.store.overdue_slas(now)
    }
}

/// Pick the most specific rule applicable to (case_type, priority):
/// an exact pair beats a single-field match beats a generic rule.
/// Ties break on ascending rule id so the choice is deterministic.
pub fn matching_rule<'r>(
    rules: &'r [EscalationRule],
    case_type: &str,
    priority: CasePriority,
) -> Option<&'r EscalationRule> {
    let mut best: Option<(&EscalationRule, u8)> = None;

    for rule in rules {
        if rule.case_type.as_deref().is_some_and(|t| t != case_type) {
            continue;
        }
        if rule.priority.is_some_and(|p| p != priority) {
            continue;
        }
        let specificity = rule.case_type.is_some() as u8 + rule.priority.is_some() as u8;
        let better = match best {
            None => true,
            Some((current, s)) => {
                specificity > s || (specificity == s && rule.rule_id < current.rule_id)
            }
        };
        if better {
            best = Some((rule, specificity));
        }
    }

    best.map(|(rule, _)| rule)
}

/// Notification recipients for an escalation to `level`: the union of
/// applicable rules targeting exactly that level, order preserved.
pub fn notify_targets_for_level(
    rules: &[EscalationRule],
    case_type: &str,
    priority: CasePriority,
    level: Level,
) -> Vec<String> {
    let mut targets: Vec<String> = Vec::new();
    for rule in rules {
        if rule.target_level != level {
            continue;
        }
        if rule.case_type.as_deref().is_some_and(|t| t != case_type) {
            continue;
        }
        if rule.priority.is_some_and(|p| p != priority) {
            continue;
        }
        for t in &rule.notify_targets {
            if !targets.contains(t) {
                targets.push(t.clone());
            }
        }
    }
    targets
}
