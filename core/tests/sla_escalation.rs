//! SLA tracking and escalation tests — deadline derivation, pure breach
//! reads, the auto-escalation path, level monotonicity, and terminal state.

use caseops_core::{
    audit::actions,
    clock::ManualClock,
    config::EngineConfig,
    engine::ComplianceEngine,
    error::EngineError,
    escalation::EscalationOutcome,
    notification::{DispatchResult, NotificationDispatcher},
    sla_tracker::{CaseRecord, EscalationRule},
    store::ComplianceStore,
    types::{CasePriority, CaseState, TriggeredBy},
};
use chrono::{Duration, TimeZone, Utc};
use std::sync::Arc;

struct NullDispatcher;

impl NotificationDispatcher for NullDispatcher {
    fn send(&self, _: &str, _: &str, _: &serde_json::Value) -> DispatchResult {
        DispatchResult::Delivered
    }
}

fn build() -> (ComplianceEngine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_at(
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
    ));
    let engine = ComplianceEngine::build(
        ComplianceStore::in_memory().unwrap(),
        EngineConfig::default(),
        Arc::new(NullDispatcher),
        clock.clone(),
    )
    .expect("build engine");
    (engine, clock)
}

fn seed_policy(engine: &ComplianceEngine) {
    let rules = [
        EscalationRule {
            rule_id: "aml-critical".into(),
            case_type: Some("aml_review".into()),
            priority: Some(CasePriority::Critical),
            sla_secs: 4 * 3600,
            target_level: 2,
            notify_targets: vec!["compliance-lead".into(), "mlro".into()],
        },
        EscalationRule {
            rule_id: "any-critical".into(),
            case_type: None,
            priority: Some(CasePriority::Critical),
            sla_secs: 8 * 3600,
            target_level: 1,
            notify_targets: vec!["compliance-lead".into()],
        },
        EscalationRule {
            rule_id: "kyc-any".into(),
            case_type: Some("kyc_review".into()),
            priority: None,
            sla_secs: 48 * 3600,
            target_level: 1,
            notify_targets: vec!["kyc-team".into()],
        },
    ];
    for rule in &rules {
        engine.upsert_escalation_rule(rule, "tester").unwrap();
    }
}

fn open_case(
    engine: &ComplianceEngine,
    case_id: &str,
    case_type: &str,
    priority: CasePriority,
) -> CaseRecord {
    let case = CaseRecord {
        case_id: case_id.into(),
        case_type: case_type.into(),
        priority,
        state: CaseState::Open,
        created_at: Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
    };
    engine.open_case(&case, "tester").unwrap();
    case
}

/// The exact (type, priority) rule wins over the priority-only rule.
#[test]
fn deadline_uses_most_specific_rule() {
    let (engine, _) = build();
    seed_policy(&engine);

    open_case(&engine, "case-1", "aml_review", CasePriority::Critical);
    let sla = engine.store().get_sla("case-1").unwrap().unwrap();
    let expected = Utc.with_ymd_and_hms(2024, 3, 1, 13, 0, 0).unwrap();
    assert_eq!(sla.deadline, expected, "4h SLA from the exact-pair rule");

    // A critical fraud case only matches the priority-only rule: 8h.
    open_case(&engine, "case-2", "fraud_review", CasePriority::Critical);
    let sla = engine.store().get_sla("case-2").unwrap().unwrap();
    assert_eq!(sla.deadline, Utc.with_ymd_and_hms(2024, 3, 1, 17, 0, 0).unwrap());

    // Type-only rule covers any kyc priority: 48h.
    open_case(&engine, "case-3", "kyc_review", CasePriority::Low);
    let sla = engine.store().get_sla("case-3").unwrap().unwrap();
    assert_eq!(sla.deadline, Utc.with_ymd_and_hms(2024, 3, 3, 9, 0, 0).unwrap());
}

/// No applicable rule: the system default duration applies.
#[test]
fn deadline_falls_back_to_default_sla() {
    let (engine, _) = build();
    open_case(&engine, "case-1", "misc", CasePriority::Low);

    let sla = engine.store().get_sla("case-1").unwrap().unwrap();
    let expected = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
        + Duration::seconds(engine.config().default_sla_secs);
    assert_eq!(sla.deadline, expected);
}

/// check_breaches reads; it never flips the breached flag itself.
#[test]
fn breach_check_is_a_pure_read() {
    let (engine, clock) = build();
    seed_policy(&engine);
    open_case(&engine, "case-1", "aml_review", CasePriority::Critical);

    assert!(engine.check_breaches().unwrap().is_empty(), "not overdue yet");

    clock.advance(Duration::hours(5));
    let overdue = engine.check_breaches().unwrap();
    assert_eq!(overdue.len(), 1);
    assert_eq!(overdue[0].case_id, "case-1");

    // Repeated reads return the row and leave persisted state untouched.
    engine.check_breaches().unwrap();
    let sla = engine.store().get_sla("case-1").unwrap().unwrap();
    assert!(!sla.breached);
    assert_eq!(sla.current_escalation_level, 0);
}

/// Critical 4h case breached at T+5h: one automatic escalation to the
/// rule's target level 2, breach flag set, one history row.
#[test]
fn breach_scan_auto_escalates_to_target_level() {
    let (engine, clock) = build();
    seed_policy(&engine);
    open_case(&engine, "case-1", "aml_review", CasePriority::Critical);

    clock.advance(Duration::hours(5));
    let stats = engine.run_breach_scan().unwrap();
    assert_eq!(stats.scanned, 1);
    assert_eq!(stats.escalated, 1);

    let sla = engine.store().get_sla("case-1").unwrap().unwrap();
    assert!(sla.breached);
    assert_eq!(sla.current_escalation_level, 2);
    assert_eq!(sla.stage, CaseState::Escalated);

    let history = engine.store().escalations_for_case("case-1").unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].level, 2);
    assert_eq!(history[0].triggered_by, TriggeredBy::Automatic);

    let case = engine.store().get_case("case-1").unwrap().unwrap();
    assert_eq!(case.state, CaseState::Escalated);
}

/// Repeated scan cycles while already at the target level are no-ops: a
/// single breach produces exactly one history row.
#[test]
fn repeated_scans_do_not_duplicate_escalations() {
    let (engine, clock) = build();
    seed_policy(&engine);
    open_case(&engine, "case-1", "aml_review", CasePriority::Critical);

    clock.advance(Duration::hours(5));
    engine.run_breach_scan().unwrap();
    engine.run_breach_scan().unwrap();
    let stats = engine.run_breach_scan().unwrap();

    assert_eq!(stats.escalated, 0);
    assert_eq!(engine.store().escalations_for_case("case-1").unwrap().len(), 1);
    assert_eq!(
        engine.store().audit_count(actions::ESCALATION_TRIGGERED).unwrap(),
        1
    );
}

/// A breached case with no applicable escalation rule is marked breached
/// but never escalated.
#[test]
fn breach_without_rule_marks_but_does_not_escalate() {
    let (engine, clock) = build();
    open_case(&engine, "case-1", "misc", CasePriority::Low);

    clock.advance(Duration::seconds(engine.config().default_sla_secs + 60));
    let stats = engine.run_breach_scan().unwrap();
    assert_eq!(stats.scanned, 1);
    assert_eq!(stats.escalated, 0);

    let sla = engine.store().get_sla("case-1").unwrap().unwrap();
    assert!(sla.breached);
    assert_eq!(sla.current_escalation_level, 0);
    assert!(engine.store().escalations_for_case("case-1").unwrap().is_empty());
}

#[test]
fn manual_escalation_requires_a_higher_level() {
    let (engine, _) = build();
    seed_policy(&engine);
    open_case(&engine, "case-1", "aml_review", CasePriority::Critical);

    let outcome = engine.escalate("case-1", 1, "analyst review", "alice").unwrap();
    assert!(matches!(outcome, EscalationOutcome::Escalated(_)));

    // Same level again is rejected, not retried.
    let err = engine.escalate("case-1", 1, "again", "alice").unwrap_err();
    assert!(matches!(err, EngineError::InvalidStateTransition { .. }));

    let err = engine.escalate("case-1", 0, "downgrade", "alice").unwrap_err();
    assert!(matches!(err, EngineError::InvalidStateTransition { .. }));

    let sla = engine.store().get_sla("case-1").unwrap().unwrap();
    assert_eq!(sla.current_escalation_level, 1);
}

/// Automatic escalation is a no-op when manual review already escalated
/// past the rule's target.
#[test]
fn auto_escalation_defers_to_higher_manual_level() {
    let (engine, clock) = build();
    seed_policy(&engine);
    open_case(&engine, "case-1", "aml_review", CasePriority::Critical);

    engine.escalate("case-1", 3, "manual override", "alice").unwrap();

    clock.advance(Duration::hours(5));
    let stats = engine.run_breach_scan().unwrap();
    assert_eq!(stats.escalated, 0);

    let sla = engine.store().get_sla("case-1").unwrap().unwrap();
    assert_eq!(sla.current_escalation_level, 3, "level never decreases");
    assert!(sla.breached, "breach still recorded on the row");
    assert_eq!(engine.store().escalations_for_case("case-1").unwrap().len(), 1);
}

/// Resolution clears the unresolved flag only. The level is a high-water
/// mark and survives resolution.
#[test]
fn resolving_keeps_the_level_high_water_mark() {
    let (engine, _) = build();
    seed_policy(&engine);
    open_case(&engine, "case-1", "aml_review", CasePriority::Critical);

    let outcome = engine.escalate("case-1", 2, "needs lead review", "alice").unwrap();
    let EscalationOutcome::Escalated(record) = outcome else {
        panic!("expected escalation");
    };

    assert!(engine.current_escalation("case-1").unwrap().is_some());
    engine
        .resolve_escalation(&record.escalation_id, "bob", "reviewed and cleared")
        .unwrap();

    assert!(engine.current_escalation("case-1").unwrap().is_none());
    let sla = engine.store().get_sla("case-1").unwrap().unwrap();
    assert_eq!(sla.current_escalation_level, 2);

    // Resolving twice is an invalid transition.
    let err = engine
        .resolve_escalation(&record.escalation_id, "bob", "again")
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidStateTransition { .. }));
}

/// Closed is terminal: no escalation, state change, or re-close.
#[test]
fn closed_cases_reject_all_transitions() {
    let (engine, _) = build();
    seed_policy(&engine);
    open_case(&engine, "case-1", "aml_review", CasePriority::Critical);
    engine.close_case("case-1", "alice").unwrap();

    let err = engine.escalate("case-1", 1, "too late", "alice").unwrap_err();
    assert!(matches!(err, EngineError::InvalidStateTransition { .. }));

    let err = engine.set_case_state("case-1", CaseState::UnderReview).unwrap_err();
    assert!(matches!(err, EngineError::InvalidStateTransition { .. }));

    let err = engine.close_case("case-1", "alice").unwrap_err();
    assert!(matches!(err, EngineError::InvalidStateTransition { .. }));

    // Closed tracking rows drop out of breach scans entirely.
    assert!(engine.check_breaches().unwrap().is_empty());
}

#[test]
fn review_states_move_freely_until_close() {
    let (engine, _) = build();
    seed_policy(&engine);
    open_case(&engine, "case-1", "aml_review", CasePriority::High);

    engine.set_case_state("case-1", CaseState::UnderReview).unwrap();
    engine.set_case_state("case-1", CaseState::PendingInfo).unwrap();

    // A pending-info case can still be escalated.
    let outcome = engine.escalate("case-1", 1, "stale info request", "alice").unwrap();
    assert!(matches!(outcome, EscalationOutcome::Escalated(_)));
}

/// Escalation queues one pending notification per configured recipient,
/// durably, before any dispatch happens.
#[test]
fn escalation_enqueues_notifications_for_rule_targets() {
    let (engine, clock) = build();
    seed_policy(&engine);
    open_case(&engine, "case-1", "aml_review", CasePriority::Critical);

    clock.advance(Duration::hours(5));
    engine.run_breach_scan().unwrap();

    let history = engine.store().escalations_for_case("case-1").unwrap();
    let notifications = engine
        .store()
        .notifications_for_escalation(&history[0].escalation_id)
        .unwrap();

    let recipients: Vec<&str> = notifications.iter().map(|n| n.recipient.as_str()).collect();
    assert_eq!(recipients, vec!["compliance-lead", "mlro"]);
    assert!(notifications.iter().all(|n| n.delivered_at.is_none()));
}

#[test]
fn escalating_unknown_case_is_not_found() {
    let (engine, _) = build();
    let err = engine.escalate("ghost", 1, "x", "alice").unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}
