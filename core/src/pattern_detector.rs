//! Pattern detector — windowed detection of suspicious transaction behavior.
//!
//! One strategy per `PatternCategory`:
//!   - structuring: many sub-threshold transactions summing past the
//!     reporting threshold (classic threshold avoidance)
//!   - high_risk_corridor: volume to/from listed risk countries past limits
//!   - time_pattern: transactions clustering in an unusual-hours band
//!
//! Detections are deduplicated by fingerprint: re-running over overlapping
//! windows increments `match_count` on the existing row instead of
//! multiplying alert volume. A failure scoring one entity's window is
//! logged and isolated; the batch continues.

use crate::{
    audit::{actions, AuditRecord, SYSTEM_ACTOR},
    error::{EngineError, EngineResult},
    store::ComplianceStore,
    types::{EntityId, PatternCategory, Severity},
};
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct TransactionRecord {
    pub txn_id: String,
    pub entity_id: EntityId,
    pub amount: f64,
    pub counterparty_country: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Half-open evaluation window `[start, end)`.
#[derive(Debug, Clone, Copy)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

/// Hour-of-day band, wrapping past midnight when `start_hour > end_hour`
/// (22–4 covers late evening through early morning).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HourBand {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl HourBand {
    pub fn contains(&self, hour: u32) -> bool {
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternThresholds {
    /// Minimum transaction count (structuring) or count limit (corridor,
    /// time clustering).
    #[serde(default)]
    pub count: Option<i64>,
    /// Reporting threshold (structuring) or cumulative amount limit
    /// (corridor).
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub risk_countries: Vec<String>,
    #[serde(default)]
    pub unusual_hours: Option<HourBand>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternDefinition {
    pub pattern_id: String,
    pub category: PatternCategory,
    pub window_secs: i64,
    pub thresholds: PatternThresholds,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// A persisted detection row. `fingerprint` is UNIQUE in storage.
#[derive(Debug, Clone)]
pub struct PatternDetection {
    pub pattern_id: String,
    pub entity_id: EntityId,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub severity: Severity,
    pub confidence: f64,
    pub fingerprint: String,
    pub match_count: i64,
    pub first_detected: DateTime<Utc>,
    pub last_detected: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct DetectionBatchSummary {
    pub detections: Vec<PatternDetection>,
    pub entities_scanned: usize,
    pub entities_failed: usize,
}

pub struct PatternDetector<'a> {
    store: &'a ComplianceStore,
}

impl<'a> PatternDetector<'a> {
    pub fn new(store: &'a ComplianceStore) -> Self {
        Self { store }
    }

    /// Run every active definition over the transactions inside `window`,
    /// grouped per entity. Emits one audit record per batch run.
    pub fn detect(
        &self,
        transactions: &[TransactionRecord],
        defs: &[PatternDefinition],
        window: &Window,
        now: DateTime<Utc>,
    ) -> EngineResult<DetectionBatchSummary> {
        // BTreeMap keeps entity order stable across runs.
        let mut per_entity: BTreeMap<&str, Vec<&TransactionRecord>> = BTreeMap::new();
        for txn in transactions.iter().filter(|t| window.contains(t.occurred_at)) {
            per_entity.entry(txn.entity_id.as_str()).or_default().push(txn);
        }

        let mut summary = DetectionBatchSummary::default();
        for (entity_id, txns) in &per_entity {
            summary.entities_scanned += 1;
            match self.detect_entity(entity_id, txns, defs, window, now) {
                Ok(detections) => summary.detections.extend(detections),
                Err(err) => {
                    summary.entities_failed += 1;
                    log::error!("pattern scan failed for entity '{entity_id}': {err}");
                }
            }
        }

        self.store.append_audit(&AuditRecord::new(
            actions::PATTERN_BATCH_RUN,
            "pattern_detection",
            "batch",
            SYSTEM_ACTOR,
            json!({
                "window_start": window.start.timestamp(),
                "window_end": window.end.timestamp(),
                "entities_scanned": summary.entities_scanned,
                "entities_failed": summary.entities_failed,
                "detections": summary.detections.len(),
            }),
            now,
        ))?;

        Ok(summary)
    }

    fn detect_entity(
        &self,
        entity_id: &str,
        txns: &[&TransactionRecord],
        defs: &[PatternDefinition],
        window: &Window,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<PatternDetection>> {
        let mut out = Vec::new();

        for def in defs.iter().filter(|d| d.active) {
            if def.window_secs <= 0 {
                log::warn!(
                    "pattern '{}' has non-positive window; skipping",
                    def.pattern_id
                );
                continue;
            }

            let signal = match def.category {
                PatternCategory::Structuring => structuring_signal(def, txns),
                PatternCategory::HighRiskCorridor => corridor_signal(def, txns),
                PatternCategory::TimePattern => time_signal(def, txns),
            };
            let signal = match signal {
                Ok(signal) => signal,
                // Misconfigured definitions fail closed per definition, not
                // per entity.
                Err(EngineError::Configuration { reason }) => {
                    log::warn!("skipping pattern '{}': {reason}", def.pattern_id);
                    continue;
                }
                Err(other) => return Err(other),
            };

            let Some(excess_ratio) = signal else { continue };

            let bucket_start = truncate_to_window(window.start, def.window_secs);
            let fingerprint =
                format!("{}:{}:{}", def.pattern_id, entity_id, bucket_start.timestamp());

            let candidate = PatternDetection {
                pattern_id: def.pattern_id.clone(),
                entity_id: entity_id.to_string(),
                window_start: bucket_start,
                window_end: bucket_start + chrono::Duration::seconds(def.window_secs),
                severity: severity_for_excess(excess_ratio),
                confidence: confidence_for(def.category, excess_ratio),
                fingerprint,
                match_count: 1,
                first_detected: now,
                last_detected: now,
            };

            // Fingerprint collision: bump match_count and last_detected on
            // the existing row instead of inserting.
            let stored = self.store.upsert_detection(&candidate)?;
            log::info!(
                "pattern {} on {entity_id}: severity={} matches={}",
                stored.pattern_id,
                stored.severity,
                stored.match_count
            );
            out.push(stored);
        }

        Ok(out)
    }
}

/// Sub-threshold transactions whose sum crosses the reporting threshold.
/// Returns the excess ratio `(sum - threshold) / threshold` when flagged.
fn structuring_signal(
    def: &PatternDefinition,
    txns: &[&TransactionRecord],
) -> EngineResult<Option<f64>> {
    let threshold = def.thresholds.amount.ok_or_else(|| EngineError::Configuration {
        reason: format!("structuring pattern '{}' missing amount threshold", def.pattern_id),
    })?;
    let min_count = def.thresholds.count.unwrap_or(2);

    let below: Vec<&&TransactionRecord> =
        txns.iter().filter(|t| t.amount < threshold).collect();
    if (below.len() as i64) < min_count {
        return Ok(None);
    }

    let sum: f64 = below.iter().map(|t| t.amount).sum();
    if sum > threshold {
        Ok(Some((sum - threshold) / threshold))
    } else {
        Ok(None)
    }
}

/// Count or cumulative amount to/from listed risk countries past limits.
fn corridor_signal(
    def: &PatternDefinition,
    txns: &[&TransactionRecord],
) -> EngineResult<Option<f64>> {
    let th = &def.thresholds;
    if th.risk_countries.is_empty() {
        return Err(EngineError::Configuration {
            reason: format!("corridor pattern '{}' has no risk countries", def.pattern_id),
        });
    }
    if th.count.is_none() && th.amount.is_none() {
        return Err(EngineError::Configuration {
            reason: format!("corridor pattern '{}' has no count or amount limit", def.pattern_id),
        });
    }

    let risky: Vec<&&TransactionRecord> = txns
        .iter()
        .filter(|t| {
            t.counterparty_country
                .as_deref()
                .is_some_and(|c| th.risk_countries.iter().any(|rc| rc == c))
        })
        .collect();

    let mut excess: Option<f64> = None;
    if let Some(count_limit) = th.count {
        if count_limit > 0 && (risky.len() as i64) > count_limit {
            let ratio = risky.len() as f64 / count_limit as f64 - 1.0;
            excess = Some(excess.map_or(ratio, |e: f64| e.max(ratio)));
        }
    }
    if let Some(amount_limit) = th.amount {
        let volume: f64 = risky.iter().map(|t| t.amount.abs()).sum();
        if amount_limit > 0.0 && volume > amount_limit {
            let ratio = volume / amount_limit - 1.0;
            excess = Some(excess.map_or(ratio, |e: f64| e.max(ratio)));
        }
    }
    Ok(excess)
}

/// Transactions clustering inside the unusual-hours band more often than
/// the configured count.
fn time_signal(
    def: &PatternDefinition,
    txns: &[&TransactionRecord],
) -> EngineResult<Option<f64>> {
    let band = def.thresholds.unusual_hours.ok_or_else(|| EngineError::Configuration {
        reason: format!("time pattern '{}' missing unusual_hours band", def.pattern_id),
    })?;
    let count_limit = def.thresholds.count.ok_or_else(|| EngineError::Configuration {
        reason: format!("time pattern '{}' missing count threshold", def.pattern_id),
    })?;

    let in_band = txns
        .iter()
        .filter(|t| band.contains(t.occurred_at.hour()))
        .count() as i64;

    if count_limit > 0 && in_band > count_limit {
        Ok(Some(in_band as f64 / count_limit as f64 - 1.0))
    } else {
        Ok(None)
    }
}

/// Severity scales with how far the window exceeded its threshold.
fn severity_for_excess(excess_ratio: f64) -> Severity {
    if excess_ratio >= 1.0 {
        Severity::Critical
    } else if excess_ratio >= 0.5 {
        Severity::High
    } else if excess_ratio >= 0.2 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Per-strategy base confidence nudged up by the excess ratio.
fn confidence_for(category: PatternCategory, excess_ratio: f64) -> f64 {
    let base = match category {
        PatternCategory::Structuring => 0.85,
        PatternCategory::HighRiskCorridor => 0.70,
        PatternCategory::TimePattern => 0.60,
    };
    (base + excess_ratio * 0.1).min(1.0)
}

/// Truncate an instant down to a multiple of the window size. Keeps the
/// fingerprint stable for overlapping scan windows.
fn truncate_to_window(at: DateTime<Utc>, window_secs: i64) -> DateTime<Utc> {
    let secs = at.timestamp();
    let bucket = secs - secs.rem_euclid(window_secs);
    DateTime::from_timestamp(bucket, 0).unwrap_or_default()
}
