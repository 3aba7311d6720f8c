//! Escalation coordinator — the per-case state machine.
//!
//! States: Open → UnderReview → Escalated(level) → {PendingInfo, Closed}.
//! Closed is terminal. `current_escalation_level` is a monotonic high-water
//! mark; resolving an escalation clears its unresolved flag but never
//! lowers the level.
//!
//! Concurrency: manual and automatic triggers may race on the same case.
//! Every level change is a compare-and-swap on the tracking row's version.
//! A CAS miss re-reads once; if the refreshed level already covers the
//! target the write lands as a no-op, otherwise a second miss surfaces
//! `ConcurrencyConflict` to the caller.

use crate::{
    audit::{actions, AuditRecord, SYSTEM_ACTOR},
    error::{EngineError, EngineResult},
    notification::NotificationRecord,
    sla_tracker::{matching_rule, notify_targets_for_level, SlaTracking},
    store::ComplianceStore,
    types::{CaseState, Level, TriggeredBy},
};
use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

/// Initial attempt plus one retry against the refreshed version.
const CAS_ATTEMPTS: usize = 2;

/// Append-only escalation history row.
#[derive(Debug, Clone)]
pub struct EscalationRecord {
    pub escalation_id: String,
    pub case_id: String,
    pub level: Level,
    pub triggered_by: TriggeredBy,
    pub reason: String,
    pub actor: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub enum EscalationOutcome {
    /// The transition landed; one history row was written.
    Escalated(EscalationRecord),
    /// The case already sits at or above the target level. Nothing changed.
    AlreadyAtLevel { current: Level },
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BreachScanStats {
    pub scanned: usize,
    pub escalated: usize,
    pub conflicts: usize,
    pub errors: usize,
}

impl BreachScanStats {
    pub fn merge(&mut self, other: BreachScanStats) {
        self.scanned += other.scanned;
        self.escalated += other.escalated;
        self.conflicts += other.conflicts;
        self.errors += other.errors;
    }
}

pub struct EscalationCoordinator<'a> {
    store: &'a ComplianceStore,
}

impl<'a> EscalationCoordinator<'a> {
    pub fn new(store: &'a ComplianceStore) -> Self {
        Self { store }
    }

    /// Manual escalation. The target level must exceed the current level.
    pub fn escalate(
        &self,
        case_id: &str,
        level: Level,
        reason: &str,
        actor: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<EscalationOutcome> {
        self.transition(case_id, level, TriggeredBy::Manual, reason, actor, now, false)
    }

    /// Automatic escalation for one breached SLA row. Resolves the
    /// applicable rule's target level; already-escalated-far-enough cases
    /// are marked breached and left alone.
    pub fn auto_escalate(
        &self,
        sla: &SlaTracking,
        now: DateTime<Utc>,
    ) -> EngineResult<EscalationOutcome> {
        let case = self
            .store
            .get_case(&sla.case_id)?
            .ok_or_else(|| EngineError::NotFound { kind: "case", id: sla.case_id.clone() })?;

        let rules = self.store.escalation_rules()?;
        let Some(rule) = matching_rule(&rules, &case.case_type, case.priority) else {
            log::warn!(
                "no escalation rule for breached case '{}'; marking breached without escalation",
                sla.case_id
            );
            self.store.mark_sla_breached(&sla.case_id)?;
            return Ok(EscalationOutcome::AlreadyAtLevel {
                current: sla.current_escalation_level,
            });
        };

        let reason = format!(
            "SLA deadline {} exceeded",
            sla.deadline.format("%Y-%m-%dT%H:%M:%SZ")
        );
        match self.transition(
            &sla.case_id,
            rule.target_level,
            TriggeredBy::Automatic,
            &reason,
            SYSTEM_ACTOR,
            now,
            true,
        ) {
            // Breached but already escalated to the target: still record the
            // breach on the row so dashboards see it.
            Ok(EscalationOutcome::AlreadyAtLevel { current }) => {
                self.store.mark_sla_breached(&sla.case_id)?;
                Ok(EscalationOutcome::AlreadyAtLevel { current })
            }
            other => other,
        }
    }

    /// Clear an escalation's unresolved flag. The case's level is untouched.
    pub fn resolve(
        &self,
        escalation_id: &str,
        actor: &str,
        outcome: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let record = self.store.get_escalation(escalation_id)?.ok_or_else(|| {
            EngineError::NotFound { kind: "escalation", id: escalation_id.to_string() }
        })?;
        if !self.store.resolve_escalation(escalation_id, now)? {
            return Err(EngineError::InvalidStateTransition {
                case_id: record.case_id,
                reason: format!("escalation '{escalation_id}' already resolved"),
            });
        }

        self.store.append_audit(&AuditRecord::new(
            actions::ESCALATION_RESOLVED,
            "escalation",
            escalation_id,
            actor,
            json!({ "case_id": record.case_id, "level": record.level, "outcome": outcome }),
            now,
        ))?;
        log::info!("escalation {escalation_id} resolved by {actor}: {outcome}");
        Ok(())
    }

    fn transition(
        &self,
        case_id: &str,
        target_level: Level,
        triggered_by: TriggeredBy,
        reason: &str,
        actor: &str,
        now: DateTime<Utc>,
        mark_breached: bool,
    ) -> EngineResult<EscalationOutcome> {
        for attempt in 0..CAS_ATTEMPTS {
            let case = self
                .store
                .get_case(case_id)?
                .ok_or_else(|| EngineError::NotFound { kind: "case", id: case_id.to_string() })?;
            if !case.state.accepts_transitions() {
                return Err(EngineError::InvalidStateTransition {
                    case_id: case_id.to_string(),
                    reason: "case is closed".into(),
                });
            }

            let sla = self
                .store
                .get_sla(case_id)?
                .ok_or_else(|| EngineError::NotFound { kind: "sla tracking", id: case_id.to_string() })?;

            if target_level <= sla.current_escalation_level {
                // Automatic triggers and raced retries land as no-ops; a
                // first-attempt manual request to a stale level is rejected.
                return if triggered_by == TriggeredBy::Automatic || attempt > 0 {
                    Ok(EscalationOutcome::AlreadyAtLevel {
                        current: sla.current_escalation_level,
                    })
                } else {
                    Err(EngineError::InvalidStateTransition {
                        case_id: case_id.to_string(),
                        reason: format!(
                            "target level {target_level} not greater than current {}",
                            sla.current_escalation_level
                        ),
                    })
                };
            }

            if !self
                .store
                .cas_escalation_update(case_id, target_level, mark_breached, sla.version)?
            {
                log::warn!(
                    "escalation version conflict on case '{case_id}' (attempt {})",
                    attempt + 1
                );
                continue;
            }

            let record = EscalationRecord {
                escalation_id: Uuid::new_v4().to_string(),
                case_id: case_id.to_string(),
                level: target_level,
                triggered_by,
                reason: reason.to_string(),
                actor: actor.to_string(),
                created_at: now,
                resolved_at: None,
            };
            self.store.insert_escalation(&record)?;
            self.store.set_case_state(case_id, CaseState::Escalated)?;
            self.enqueue_notifications(&case.case_type, case.priority, &record, now)?;
            self.store.append_audit(&AuditRecord::new(
                actions::ESCALATION_TRIGGERED,
                "case",
                case_id,
                actor,
                json!({
                    "escalation_id": record.escalation_id,
                    "level": target_level,
                    "triggered_by": triggered_by.as_str(),
                    "reason": reason,
                }),
                now,
            ))?;

            log::info!(
                "case {case_id} escalated to level {target_level} ({})",
                triggered_by
            );
            return Ok(EscalationOutcome::Escalated(record));
        }

        Err(EngineError::ConcurrencyConflict { case_id: case_id.to_string() })
    }

    /// Queue one pending notification per recipient configured for the new
    /// level. Rows are durable before any dispatch attempt happens.
    fn enqueue_notifications(
        &self,
        case_type: &str,
        priority: crate::types::CasePriority,
        record: &EscalationRecord,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let rules = self.store.escalation_rules()?;
        let targets = notify_targets_for_level(&rules, case_type, priority, record.level);
        if targets.is_empty() {
            log::debug!(
                "no notify targets configured for level {} on case '{}'",
                record.level,
                record.case_id
            );
        }
        for recipient in targets {
            let notification = NotificationRecord::pending(&recipient, record, now);
            self.store.insert_notification(&notification)?;
        }
        Ok(())
    }
}
