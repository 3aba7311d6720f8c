//! The engine facade — wires store, clock, configuration and the
//! notification dispatcher into one entry point.
//!
//! RULES:
//!   - All shared state lives in the store; the facade holds no
//!     authoritative state in memory across calls.
//!   - Configuration changes (rules, patterns, escalation policy) are
//!     audited here so every write path emits exactly one record.

use crate::{
    audit::{actions, AuditRecord},
    clock::Clock,
    config::EngineConfig,
    error::{EngineError, EngineResult},
    escalation::{BreachScanStats, EscalationCoordinator, EscalationOutcome, EscalationRecord},
    notification::{DeliveryStats, NotificationDispatcher, NotificationService},
    pattern_detector::{DetectionBatchSummary, PatternDetector, TransactionRecord, Window},
    rule_engine::{RiskAssessment, RiskRule, RuleEngine},
    scheduler::{self, CancellationToken, ScanHandle},
    sla_tracker::{CaseRecord, EscalationRule, SlaTracker, SlaTracking},
    snapshot::{EntitySnapshot, SnapshotProvider},
    store::ComplianceStore,
    types::{CaseState, EntityType, Level},
};
use serde_json::json;
use std::sync::Arc;

pub struct ComplianceEngine {
    store: ComplianceStore,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    dispatcher: Arc<dyn NotificationDispatcher>,
    notifications: NotificationService,
}

impl ComplianceEngine {
    /// Build a fully wired engine. Applies migrations on the way in.
    pub fn build(
        store: ComplianceStore,
        config: EngineConfig,
        dispatcher: Arc<dyn NotificationDispatcher>,
        clock: Arc<dyn Clock>,
    ) -> EngineResult<Self> {
        store.migrate()?;
        let notifications = NotificationService::new(
            Arc::clone(&dispatcher),
            config.retry.clone(),
            config.jitter_seed,
        );
        Ok(Self { store, clock, config, dispatcher, notifications })
    }

    pub fn store(&self) -> &ComplianceStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Configuration surface ──────────────────────────────────

    /// Validate and persist a risk rule; one audit record per change.
    pub fn upsert_risk_rule(&self, rule: &RiskRule, actor: &str) -> EngineResult<()> {
        rule.validate(self.config.max_condition_depth)?;
        self.store.upsert_risk_rule(rule)?;
        self.store.append_audit(&AuditRecord::new(
            actions::RULE_UPSERTED,
            "risk_rule",
            &rule.rule_id,
            actor,
            json!({ "category": rule.category.as_str(), "risk_score": rule.risk_score, "active": rule.active }),
            self.clock.now(),
        ))
    }

    pub fn deactivate_risk_rule(&self, rule_id: &str, actor: &str) -> EngineResult<()> {
        if !self.store.deactivate_risk_rule(rule_id)? {
            return Err(EngineError::NotFound { kind: "risk rule", id: rule_id.to_string() });
        }
        self.store.append_audit(&AuditRecord::new(
            actions::RULE_DEACTIVATED,
            "risk_rule",
            rule_id,
            actor,
            json!({}),
            self.clock.now(),
        ))
    }

    pub fn upsert_pattern_definition(
        &self,
        def: &crate::pattern_detector::PatternDefinition,
        actor: &str,
    ) -> EngineResult<()> {
        self.store.upsert_pattern_definition(def)?;
        self.store.append_audit(&AuditRecord::new(
            actions::RULE_UPSERTED,
            "pattern_definition",
            &def.pattern_id,
            actor,
            json!({ "category": def.category.as_str(), "window_secs": def.window_secs }),
            self.clock.now(),
        ))
    }

    pub fn upsert_escalation_rule(&self, rule: &EscalationRule, actor: &str) -> EngineResult<()> {
        self.store.upsert_escalation_rule(rule)?;
        self.store.append_audit(&AuditRecord::new(
            actions::RULE_UPSERTED,
            "escalation_rule",
            &rule.rule_id,
            actor,
            json!({ "sla_secs": rule.sla_secs, "target_level": rule.target_level }),
            self.clock.now(),
        ))
    }

    // ── Risk assessment ────────────────────────────────────────

    pub fn assess(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        snapshot: &EntitySnapshot,
    ) -> EngineResult<RiskAssessment> {
        RuleEngine::new(&self.store, self.config.max_condition_depth).assess(
            entity_type,
            entity_id,
            snapshot,
            self.clock.now(),
        )
    }

    pub fn current_risk_score(&self, entity_id: &str) -> EngineResult<i64> {
        RuleEngine::new(&self.store, self.config.max_condition_depth).current_risk_score(entity_id)
    }

    /// Assess through a snapshot provider — the engine does not care where
    /// the attribute map comes from.
    pub fn assess_from(
        &self,
        provider: &dyn SnapshotProvider,
        entity_type: EntityType,
        entity_id: &str,
    ) -> EngineResult<RiskAssessment> {
        let snapshot = provider.snapshot(entity_type, entity_id)?;
        self.assess(entity_type, entity_id, &snapshot)
    }

    // ── Pattern detection ──────────────────────────────────────

    /// Run the active pattern definitions over a transaction slice.
    pub fn run_detection(
        &self,
        transactions: &[TransactionRecord],
        window: &Window,
    ) -> EngineResult<DetectionBatchSummary> {
        let defs = self.store.active_pattern_definitions()?;
        PatternDetector::new(&self.store).detect(transactions, &defs, window, self.clock.now())
    }

    // ── Case lifecycle ─────────────────────────────────────────

    /// Register a case and derive its SLA deadline.
    pub fn open_case(&self, case: &CaseRecord, actor: &str) -> EngineResult<SlaTracking> {
        self.store.insert_case(case)?;
        let tracking =
            SlaTracker::new(&self.store, self.config.default_sla()).start_tracking(case)?;
        self.store.append_audit(&AuditRecord::new(
            actions::CASE_OPENED,
            "case",
            &case.case_id,
            actor,
            json!({
                "case_type": case.case_type,
                "priority": case.priority.as_str(),
                "deadline": tracking.deadline.timestamp(),
            }),
            self.clock.now(),
        ))?;
        Ok(tracking)
    }

    /// Move a case between review states. `Closed` is reached through
    /// `close_case` only, and never left.
    pub fn set_case_state(&self, case_id: &str, to: CaseState) -> EngineResult<()> {
        let case = self
            .store
            .get_case(case_id)?
            .ok_or_else(|| EngineError::NotFound { kind: "case", id: case_id.to_string() })?;
        if !case.state.accepts_transitions() || to == CaseState::Closed {
            return Err(EngineError::InvalidStateTransition {
                case_id: case_id.to_string(),
                reason: format!("cannot move from {} to {}", case.state, to),
            });
        }
        self.store.set_case_state(case_id, to)
    }

    pub fn close_case(&self, case_id: &str, actor: &str) -> EngineResult<()> {
        let case = self
            .store
            .get_case(case_id)?
            .ok_or_else(|| EngineError::NotFound { kind: "case", id: case_id.to_string() })?;
        if !case.state.accepts_transitions() {
            return Err(EngineError::InvalidStateTransition {
                case_id: case_id.to_string(),
                reason: "case is already closed".into(),
            });
        }
        self.store.set_case_state(case_id, CaseState::Closed)?;
        self.store.close_sla(case_id)?;
        self.store.append_audit(&AuditRecord::new(
            actions::CASE_CLOSED,
            "case",
            case_id,
            actor,
            json!({}),
            self.clock.now(),
        ))
    }

    // ── Escalation ─────────────────────────────────────────────

    pub fn escalate(
        &self,
        case_id: &str,
        level: Level,
        reason: &str,
        actor: &str,
    ) -> EngineResult<EscalationOutcome> {
        EscalationCoordinator::new(&self.store).escalate(
            case_id,
            level,
            reason,
            actor,
            self.clock.now(),
        )
    }

    pub fn resolve_escalation(
        &self,
        escalation_id: &str,
        actor: &str,
        outcome: &str,
    ) -> EngineResult<()> {
        EscalationCoordinator::new(&self.store).resolve(
            escalation_id,
            actor,
            outcome,
            self.clock.now(),
        )
    }

    pub fn current_escalation(&self, case_id: &str) -> EngineResult<Option<EscalationRecord>> {
        self.store.latest_unresolved_escalation(case_id)
    }

    // ── Breach scanning & notifications ────────────────────────

    /// Pure read: which tracked cases are past their deadline right now.
    pub fn check_breaches(&self) -> EngineResult<Vec<SlaTracking>> {
        SlaTracker::new(&self.store, self.config.default_sla()).check_breaches(self.clock.now())
    }

    /// One synchronous breach cycle (the periodic loop calls the same code).
    pub fn run_breach_scan(&self) -> EngineResult<BreachScanStats> {
        scheduler::run_breach_cycle(
            &self.store,
            &self.config,
            &CancellationToken::new(),
            self.clock.now(),
        )
    }

    pub fn deliver_notifications(&self) -> EngineResult<DeliveryStats> {
        self.notifications.deliver_pending(&self.store, self.clock.now())
    }

    pub fn acknowledge_notification(&self, notification_id: &str) -> EngineResult<bool> {
        self.store.mark_notification_read(notification_id, self.clock.now())
    }

    /// Start the periodic breach-scan loop. Requires a file-backed store so
    /// the loop and its workers can open their own connections.
    pub fn start_scheduler(&self) -> EngineResult<ScanHandle> {
        let Some(path) = self.store.path() else {
            return Err(EngineError::Configuration {
                reason: "periodic scanning needs a file-backed store".into(),
            });
        };
        scheduler::start(
            path,
            self.config.clone(),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.clock),
        )
    }
}
