//! Concurrency tests — the optimistic-concurrency guard on escalation,
//! the bounded parallel breach scan, cancellation, and the periodic loop.

use caseops_core::{
    clock::{Clock, ManualClock},
    config::EngineConfig,
    engine::ComplianceEngine,
    escalation::EscalationOutcome,
    error::EngineError,
    notification::{DispatchResult, NotificationDispatcher},
    scheduler::{self, CancellationToken},
    sla_tracker::{CaseRecord, EscalationRule},
    store::ComplianceStore,
    types::{CasePriority, CaseState},
};
use chrono::{Duration, TimeZone, Utc};
use std::sync::{Arc, Barrier};

struct NullDispatcher;

impl NotificationDispatcher for NullDispatcher {
    fn send(&self, _: &str, _: &str, _: &serde_json::Value) -> DispatchResult {
        DispatchResult::Delivered
    }
}

fn start_time() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

fn build_at(path: &str, clock: Arc<ManualClock>) -> ComplianceEngine {
    ComplianceEngine::build(
        ComplianceStore::open(path).unwrap(),
        EngineConfig::default(),
        Arc::new(NullDispatcher),
        clock,
    )
    .expect("build engine")
}

fn critical_rule() -> EscalationRule {
    EscalationRule {
        rule_id: "aml-critical".into(),
        case_type: Some("aml_review".into()),
        priority: Some(CasePriority::Critical),
        sla_secs: 4 * 3600,
        target_level: 2,
        notify_targets: vec!["compliance-lead".into()],
    }
}

fn open_case(engine: &ComplianceEngine, case_id: &str) {
    let case = CaseRecord {
        case_id: case_id.into(),
        case_type: "aml_review".into(),
        priority: CasePriority::Critical,
        state: CaseState::Open,
        created_at: start_time(),
    };
    engine.open_case(&case, "tester").unwrap();
}

/// The store-level compare-and-swap: a stale version writes nothing, the
/// fresh version writes exactly once and bumps itself.
#[test]
fn cas_rejects_stale_versions() {
    let clock = Arc::new(ManualClock::starting_at(start_time()));
    let engine = ComplianceEngine::build(
        ComplianceStore::in_memory().unwrap(),
        EngineConfig::default(),
        Arc::new(NullDispatcher),
        clock,
    )
    .unwrap();
    engine.upsert_escalation_rule(&critical_rule(), "tester").unwrap();
    open_case(&engine, "case-1");

    let store = engine.store();
    assert!(!store.cas_escalation_update("case-1", 1, false, 99).unwrap());
    let sla = store.get_sla("case-1").unwrap().unwrap();
    assert_eq!(sla.current_escalation_level, 0);

    assert!(store.cas_escalation_update("case-1", 1, false, sla.version).unwrap());
    let sla = store.get_sla("case-1").unwrap().unwrap();
    assert_eq!(sla.current_escalation_level, 1);
    assert_eq!(sla.version, 1);

    // The consumed version no longer works.
    assert!(!store.cas_escalation_update("case-1", 2, false, 0).unwrap());
}

/// Two simultaneous escalations of the same case to the same level:
/// exactly one wins; the loser lands as a no-op or a rejected transition,
/// never a second history row.
#[test]
fn racing_escalations_produce_one_history_row() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ops.db");
    let path = path.to_str().unwrap();
    let clock = Arc::new(ManualClock::starting_at(start_time()));

    let setup = build_at(path, clock.clone());
    setup.upsert_escalation_rule(&critical_rule(), "tester").unwrap();
    open_case(&setup, "case-1");

    let engine_a = build_at(path, clock.clone());
    let engine_b = build_at(path, clock.clone());
    let barrier = Arc::new(Barrier::new(2));

    let results = std::thread::scope(|scope| {
        let handles = [engine_a, engine_b].map(|engine| {
            let barrier = Arc::clone(&barrier);
            scope.spawn(move || {
                barrier.wait();
                engine.escalate("case-1", 2, "race", "analyst")
            })
        });
        handles.map(|h| h.join().expect("thread panicked"))
    });

    let wins = results
        .iter()
        .filter(|r| matches!(r, Ok(EscalationOutcome::Escalated(_))))
        .count();
    assert_eq!(wins, 1, "exactly one writer wins the race");

    for result in &results {
        match result {
            Ok(EscalationOutcome::Escalated(_)) => {}
            // Raced retry observed the winner's level: clean no-op.
            Ok(EscalationOutcome::AlreadyAtLevel { current }) => assert_eq!(*current, 2),
            // Read after the winner committed: plain level-validation reject.
            Err(EngineError::InvalidStateTransition { .. }) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    let sla = setup.store().get_sla("case-1").unwrap().unwrap();
    assert_eq!(sla.current_escalation_level, 2);
    assert_eq!(setup.store().escalations_for_case("case-1").unwrap().len(), 1);
}

/// Many breached cases fan out across the worker pool; every case gets
/// exactly one automatic escalation.
#[test]
fn parallel_breach_scan_escalates_each_case_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ops.db");
    let clock = Arc::new(ManualClock::starting_at(start_time()));
    let engine = build_at(path.to_str().unwrap(), clock.clone());

    engine.upsert_escalation_rule(&critical_rule(), "tester").unwrap();
    for i in 0..8 {
        open_case(&engine, &format!("case-{i}"));
    }

    clock.advance(Duration::hours(5));
    let stats = engine.run_breach_scan().unwrap();
    assert_eq!(stats.scanned, 8);
    assert_eq!(stats.escalated, 8);
    assert_eq!(stats.errors, 0);

    for i in 0..8 {
        let case_id = format!("case-{i}");
        let history = engine.store().escalations_for_case(&case_id).unwrap();
        assert_eq!(history.len(), 1, "one row for {case_id}");
        let sla = engine.store().get_sla(&case_id).unwrap().unwrap();
        assert_eq!(sla.current_escalation_level, 2);
        assert!(sla.breached);
    }
}

/// A cancelled token stops the cycle before any case is processed.
#[test]
fn cancelled_cycle_abandons_without_writes() {
    let clock = Arc::new(ManualClock::starting_at(start_time()));
    let engine = ComplianceEngine::build(
        ComplianceStore::in_memory().unwrap(),
        EngineConfig::default(),
        Arc::new(NullDispatcher),
        clock.clone(),
    )
    .unwrap();
    engine.upsert_escalation_rule(&critical_rule(), "tester").unwrap();
    open_case(&engine, "case-1");
    clock.advance(Duration::hours(5));

    let token = CancellationToken::new();
    token.cancel();
    let stats = scheduler::run_breach_cycle(engine.store(), engine.config(), &token, clock.now())
        .unwrap();

    assert_eq!(stats.scanned, 0);
    let sla = engine.store().get_sla("case-1").unwrap().unwrap();
    assert_eq!(sla.current_escalation_level, 0);
    assert!(!sla.breached);
}

/// The periodic loop escalates a breached case and delivers its
/// notifications without any manual driving, then stops cleanly.
#[test]
fn periodic_scheduler_escalates_and_stops() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ops.db");
    let clock = Arc::new(ManualClock::starting_at(start_time()));

    let engine = ComplianceEngine::build(
        ComplianceStore::open(path.to_str().unwrap()).unwrap(),
        EngineConfig {
            scan_interval: std::time::Duration::from_millis(50),
            ..EngineConfig::default()
        },
        Arc::new(NullDispatcher),
        clock.clone(),
    )
    .unwrap();
    engine.upsert_escalation_rule(&critical_rule(), "tester").unwrap();
    open_case(&engine, "case-1");
    clock.advance(Duration::hours(5));

    let handle = engine.start_scheduler().unwrap();

    // Give the loop a few cycles: escalation lands first, delivery follows
    // in the same or the next cycle.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(3);
    loop {
        let delivered = engine
            .store()
            .escalations_for_case("case-1")
            .unwrap()
            .first()
            .map(|e| {
                engine
                    .store()
                    .notifications_for_escalation(&e.escalation_id)
                    .unwrap()
                    .iter()
                    .any(|n| n.delivered_at.is_some())
            })
            .unwrap_or(false);
        if delivered || std::time::Instant::now() > deadline {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    handle.stop();

    let history = engine.store().escalations_for_case("case-1").unwrap();
    assert_eq!(history.len(), 1);
    let notifications = engine
        .store()
        .notifications_for_escalation(&history[0].escalation_id)
        .unwrap();
    assert!(!notifications.is_empty());
    assert!(notifications.iter().all(|n| n.delivered_at.is_some()));
}
