//! Engine tuning and catalog loading.
//!
//! Catalogs (risk rules, pattern definitions, escalation rules) are plain
//! JSON files deserialized into the domain structs — configuration is data,
//! not behavior, from the engine's point of view.

use crate::{
    error::{EngineError, EngineResult},
    notification::RetryPolicy,
    pattern_detector::PatternDefinition,
    rule_engine::RiskRule,
    sla_tracker::EscalationRule,
};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration as StdDuration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Depth cap on condition trees; deeper trees fail closed.
    pub max_condition_depth: usize,
    /// Fallback SLA when no escalation rule matches a case.
    pub default_sla_secs: i64,
    /// Period of the breach-scan loop.
    pub scan_interval: StdDuration,
    /// Bounded worker count for per-case escalation during a scan cycle.
    pub escalation_workers: usize,
    pub retry: RetryPolicy,
    /// Seed for retry-jitter; fixed so backoff timing is reproducible.
    pub jitter_seed: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_condition_depth: crate::condition::DEFAULT_MAX_DEPTH,
            default_sla_secs: 72 * 3600,
            scan_interval: StdDuration::from_secs(30),
            escalation_workers: 4,
            retry: RetryPolicy::default(),
            jitter_seed: 0x5EED,
        }
    }
}

impl EngineConfig {
    pub fn default_sla(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.default_sla_secs)
    }
}

#[derive(Debug, Deserialize)]
struct RiskRuleCatalog {
    rules: Vec<RiskRule>,
}

#[derive(Debug, Deserialize)]
struct PatternCatalog {
    patterns: Vec<PatternDefinition>,
}

#[derive(Debug, Deserialize)]
struct EscalationPolicy {
    rules: Vec<EscalationRule>,
}

pub fn load_risk_rules(path: &Path) -> EngineResult<Vec<RiskRule>> {
    let catalog: RiskRuleCatalog = read_catalog(path)?;
    Ok(catalog.rules)
}

pub fn load_pattern_definitions(path: &Path) -> EngineResult<Vec<PatternDefinition>> {
    let catalog: PatternCatalog = read_catalog(path)?;
    Ok(catalog.patterns)
}

pub fn load_escalation_rules(path: &Path) -> EngineResult<Vec<EscalationRule>> {
    let policy: EscalationPolicy = read_catalog(path)?;
    Ok(policy.rules)
}

fn read_catalog<T: serde::de::DeserializeOwned>(path: &Path) -> EngineResult<T> {
    let raw = std::fs::read_to_string(path).map_err(|e| EngineError::Configuration {
        reason: format!("cannot read catalog {}: {e}", path.display()),
    })?;
    Ok(serde_json::from_str(&raw)?)
}
