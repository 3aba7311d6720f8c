//! case-runner: headless runner for the caseops engine.
//!
//! Usage:
//!   case-runner --db ops.db --data-dir ./data
//!   case-runner --scan-secs 5 --watch
//!
//! Seeds rule/pattern/escalation catalogs from the data directory, scores
//! the fixture entities, runs one detection batch and one breach scan, and
//! prints a summary. With --watch it leaves the periodic scanner running.

use anyhow::Result;
use caseops_core::{
    clock::SystemClock,
    config::{self, EngineConfig},
    engine::ComplianceEngine,
    notification::{DispatchResult, NotificationDispatcher},
    pattern_detector::{TransactionRecord, Window},
    error::{EngineError, EngineResult},
    sla_tracker::CaseRecord,
    snapshot::{EntitySnapshot, SnapshotProvider},
    store::ComplianceStore,
    types::{CasePriority, CaseState, EntityType},
};
use chrono::{DateTime, Duration, Utc};
use std::env;
use std::path::Path;
use std::sync::Arc;

/// Stand-in transport for headless runs: logs and reports delivery.
struct LogDispatcher;

impl NotificationDispatcher for LogDispatcher {
    fn send(&self, recipient: &str, escalation_id: &str, _payload: &serde_json::Value) -> DispatchResult {
        log::info!("notify {recipient}: escalation {escalation_id}");
        DispatchResult::Delivered
    }
}

#[derive(serde::Deserialize)]
struct EntityFixture {
    entity_id: String,
    entity_type: EntityType,
    attributes: serde_json::Value,
}

#[derive(serde::Deserialize)]
struct TransactionFixture {
    txn_id: String,
    entity_id: String,
    amount: f64,
    #[serde(default)]
    counterparty_country: Option<String>,
    /// Seconds before "now" the transaction occurred.
    age_secs: i64,
}

#[derive(serde::Deserialize)]
struct CaseFixture {
    case_id: String,
    case_type: String,
    priority: CasePriority,
    /// Seconds before "now" the case was opened.
    age_secs: i64,
}

#[derive(serde::Deserialize)]
struct EntitiesFile {
    entities: Vec<EntityFixture>,
}

#[derive(serde::Deserialize)]
struct TransactionsFile {
    transactions: Vec<TransactionFixture>,
}

#[derive(serde::Deserialize)]
struct CasesFile {
    cases: Vec<CaseFixture>,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let db = args
        .windows(2)
        .find(|w| w[0] == "--db")
        .map(|w| w[1].as_str())
        .unwrap_or("caseops.db");
    let data_dir = args
        .windows(2)
        .find(|w| w[0] == "--data-dir")
        .map(|w| w[1].as_str())
        .unwrap_or("./data");
    let scan_secs = parse_arg(&args, "--scan-secs", 30u64);
    let watch = args.iter().any(|a| a == "--watch");

    println!("caseops case-runner");
    println!("  db:        {db}");
    println!("  data_dir:  {data_dir}");
    println!();

    let store = ComplianceStore::open(db)?;
    let config = EngineConfig {
        scan_interval: std::time::Duration::from_secs(scan_secs),
        ..EngineConfig::default()
    };
    let engine = ComplianceEngine::build(
        store,
        config,
        Arc::new(LogDispatcher),
        Arc::new(SystemClock),
    )?;

    let now = Utc::now();
    seed_catalogs(&engine, Path::new(data_dir))?;
    score_entities(&engine, Path::new(data_dir))?;
    run_detection(&engine, Path::new(data_dir), now)?;
    open_cases(&engine, Path::new(data_dir), now)?;

    let stats = engine.run_breach_scan()?;
    println!(
        "breach scan: scanned={} escalated={} conflicts={} errors={}",
        stats.scanned, stats.escalated, stats.conflicts, stats.errors
    );
    let delivery = engine.deliver_notifications()?;
    println!(
        "notifications: delivered={} failed={}",
        delivery.delivered, delivery.failed
    );

    print_summary(&engine)?;

    if watch {
        println!();
        println!("watching (scan every {scan_secs}s, ctrl-c to stop)...");
        let handle = engine.start_scheduler()?;
        loop {
            std::thread::sleep(std::time::Duration::from_secs(60));
            let _ = &handle;
        }
    }

    Ok(())
}

fn seed_catalogs(engine: &ComplianceEngine, data_dir: &Path) -> Result<()> {
    for rule in config::load_risk_rules(&data_dir.join("rules.json"))? {
        engine.upsert_risk_rule(&rule, "case-runner")?;
    }
    for def in config::load_pattern_definitions(&data_dir.join("patterns.json"))? {
        engine.upsert_pattern_definition(&def, "case-runner")?;
    }
    for rule in config::load_escalation_rules(&data_dir.join("escalation_rules.json"))? {
        engine.upsert_escalation_rule(&rule, "case-runner")?;
    }
    println!(
        "seeded catalogs: {} risk rules",
        engine.store().risk_rule_count()?
    );
    Ok(())
}

/// Snapshot provider backed by the fixture file.
struct FixtureSnapshots {
    entities: Vec<EntityFixture>,
}

impl SnapshotProvider for FixtureSnapshots {
    fn snapshot(&self, entity_type: EntityType, entity_id: &str) -> EngineResult<EntitySnapshot> {
        self.entities
            .iter()
            .find(|e| e.entity_type == entity_type && e.entity_id == entity_id)
            .map(|e| EntitySnapshot::new(e.attributes.clone()))
            .ok_or_else(|| EngineError::NotFound { kind: "entity", id: entity_id.to_string() })
    }
}

fn score_entities(engine: &ComplianceEngine, data_dir: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(data_dir.join("entities.json"))?;
    let file: EntitiesFile = serde_json::from_str(&raw)?;
    let provider = FixtureSnapshots { entities: file.entities };

    println!();
    println!("=== RISK SCORES ===");
    for fixture in &provider.entities {
        let assessment =
            engine.assess_from(&provider, fixture.entity_type, &fixture.entity_id)?;
        println!(
            "  {:<12} score={:>3} matches={} categories={:?}",
            fixture.entity_id,
            assessment.total_score,
            assessment.matched_rules.len(),
            assessment
                .categories
                .iter()
                .map(|c| c.as_str())
                .collect::<Vec<_>>(),
        );
    }
    Ok(())
}

fn run_detection(engine: &ComplianceEngine, data_dir: &Path, now: DateTime<Utc>) -> Result<()> {
    let raw = std::fs::read_to_string(data_dir.join("transactions.json"))?;
    let file: TransactionsFile = serde_json::from_str(&raw)?;

    let transactions: Vec<TransactionRecord> = file
        .transactions
        .into_iter()
        .map(|t| TransactionRecord {
            txn_id: t.txn_id,
            entity_id: t.entity_id,
            amount: t.amount,
            counterparty_country: t.counterparty_country,
            occurred_at: now - Duration::seconds(t.age_secs),
        })
        .collect();

    let window = Window { start: now - Duration::days(7), end: now };
    let summary = engine.run_detection(&transactions, &window)?;

    println!();
    println!("=== PATTERN DETECTIONS ===");
    if summary.detections.is_empty() {
        println!("  (none)");
    }
    for d in &summary.detections {
        println!(
            "  {:<24} {:<12} severity={:<8} confidence={:.2} matches={}",
            d.pattern_id, d.entity_id, d.severity, d.confidence, d.match_count
        );
    }
    Ok(())
}

fn open_cases(engine: &ComplianceEngine, data_dir: &Path, now: DateTime<Utc>) -> Result<()> {
    let raw = std::fs::read_to_string(data_dir.join("cases.json"))?;
    let file: CasesFile = serde_json::from_str(&raw)?;

    println!();
    println!("=== CASES ===");
    for fixture in file.cases {
        let case = CaseRecord {
            case_id: fixture.case_id.clone(),
            case_type: fixture.case_type,
            priority: fixture.priority,
            state: CaseState::Open,
            created_at: now - Duration::seconds(fixture.age_secs),
        };
        let tracking = engine.open_case(&case, "case-runner")?;
        println!(
            "  {:<12} priority={:<8} deadline={}",
            fixture.case_id,
            case.priority,
            tracking.deadline.format("%Y-%m-%d %H:%M"),
        );
    }
    Ok(())
}

fn print_summary(engine: &ComplianceEngine) -> Result<()> {
    let store = engine.store();
    println!();
    println!("=== RUN SUMMARY ===");
    println!("  risk rules:        {}", store.risk_rule_count()?);
    println!("  detections:        {}", store.detection_count()?);
    println!("  open cases:        {}", store.open_case_count()?);
    println!("  breached SLAs:     {}", store.breached_sla_count()?);
    println!("  open escalations:  {}", store.unresolved_escalation_count()?);
    println!(
        "  escalation audits: {}",
        store.audit_count(caseops_core::audit::actions::ESCALATION_TRIGGERED)?
    );
    Ok(())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
