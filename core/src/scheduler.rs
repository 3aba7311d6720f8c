//! Periodic breach scanning — the engine's only background loop.
//!
//! A timer-driven thread runs one breach cycle per interval: consult the
//! SLA tracker, fan the breached cases out over a bounded set of workers
//! (each with its own store connection), then push pending notifications.
//! Cancellation is an atomic token observed between cases; a case's writes
//! are single-row and guarded by the coordinator's CAS, so abandoning
//! mid-cycle leaves no partial state.

use crate::{
    clock::Clock,
    config::EngineConfig,
    error::{EngineError, EngineResult},
    escalation::{BreachScanStats, EscalationCoordinator, EscalationOutcome},
    notification::{NotificationDispatcher, NotificationService},
    sla_tracker::{SlaTracker, SlaTracking},
    store::ComplianceStore,
};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration as StdDuration;

#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Handle to the running scan loop. `stop()` cancels and joins.
pub struct ScanHandle {
    token: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl ScanHandle {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn stop(mut self) {
        self.token.cancel();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ScanHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// One breach cycle: query overdue rows, auto-escalate each. Cases are
/// independent; with a file-backed store and more than one worker they are
/// processed on a bounded pool of threads, each over its own connection.
pub fn run_breach_cycle(
    store: &ComplianceStore,
    config: &EngineConfig,
    token: &CancellationToken,
    now: DateTime<Utc>,
) -> EngineResult<BreachScanStats> {
    let tracker = SlaTracker::new(store, config.default_sla());
    let breaches = tracker.check_breaches(now)?;
    if breaches.is_empty() {
        return Ok(BreachScanStats::default());
    }

    let workers = config.escalation_workers.max(1);
    // An in-memory store has exactly one connection; run in place.
    if workers == 1 || !store.is_file_backed() || breaches.len() == 1 {
        let coordinator = EscalationCoordinator::new(store);
        return Ok(process_rows(&coordinator, &breaches, token, now));
    }

    let buckets = partition(breaches, workers);
    let mut worker_stores = Vec::with_capacity(buckets.len());
    for _ in 0..buckets.len() {
        worker_stores.push(store.reopen()?);
    }

    let mut stats = BreachScanStats::default();
    thread::scope(|scope| {
        let handles: Vec<_> = buckets
            .into_iter()
            .zip(worker_stores)
            .map(|(bucket, worker_store)| {
                let token = token.clone();
                // Each worker owns its connection; the CAS guard isolates
                // per-case writes across them.
                scope.spawn(move || {
                    let coordinator = EscalationCoordinator::new(&worker_store);
                    process_rows(&coordinator, &bucket, &token, now)
                })
            })
            .collect();
        for handle in handles {
            match handle.join() {
                Ok(worker_stats) => stats.merge(worker_stats),
                Err(_) => stats.errors += 1,
            }
        }
    });
    Ok(stats)
}

fn process_rows(
    coordinator: &EscalationCoordinator<'_>,
    rows: &[SlaTracking],
    token: &CancellationToken,
    now: DateTime<Utc>,
) -> BreachScanStats {
    let mut stats = BreachScanStats::default();
    for row in rows {
        if token.is_cancelled() {
            break;
        }
        stats.scanned += 1;
        match coordinator.auto_escalate(row, now) {
            Ok(EscalationOutcome::Escalated(_)) => stats.escalated += 1,
            Ok(EscalationOutcome::AlreadyAtLevel { .. }) => {}
            Err(EngineError::ConcurrencyConflict { case_id }) => {
                // The racing writer escalated for us; the next cycle
                // re-checks this case anyway.
                log::warn!("breach scan lost the race on case '{case_id}'");
                stats.conflicts += 1;
            }
            Err(err) => {
                log::error!("auto-escalation failed for case '{}': {err}", row.case_id);
                stats.errors += 1;
            }
        }
    }
    stats
}

fn partition(rows: Vec<SlaTracking>, buckets: usize) -> Vec<Vec<SlaTracking>> {
    let mut out: Vec<Vec<SlaTracking>> = (0..buckets.min(rows.len())).map(|_| Vec::new()).collect();
    for (i, row) in rows.into_iter().enumerate() {
        let slot = i % out.len();
        out[slot].push(row);
    }
    out
}

/// Spawn the periodic loop against a file-backed database. Each cycle runs
/// a breach scan then drains pending notifications.
pub fn start(
    db_path: &str,
    config: EngineConfig,
    dispatcher: Arc<dyn NotificationDispatcher>,
    clock: Arc<dyn Clock>,
) -> EngineResult<ScanHandle> {
    let token = CancellationToken::new();
    let loop_token = token.clone();
    let path = db_path.to_string();

    let thread = thread::Builder::new()
        .name("breach-scan".into())
        .spawn(move || {
            let store = match ComplianceStore::open(&path) {
                Ok(store) => store,
                Err(err) => {
                    log::error!("breach scanner could not open store at {path}: {err}");
                    return;
                }
            };
            let notifications =
                NotificationService::new(dispatcher, config.retry.clone(), config.jitter_seed);

            while !loop_token.is_cancelled() {
                let now = clock.now();
                match run_breach_cycle(&store, &config, &loop_token, now) {
                    Ok(stats) if stats.escalated > 0 || stats.errors > 0 => {
                        log::info!(
                            "breach cycle: scanned={} escalated={} conflicts={} errors={}",
                            stats.scanned,
                            stats.escalated,
                            stats.conflicts,
                            stats.errors
                        );
                    }
                    Ok(_) => {}
                    Err(err) => log::error!("breach cycle failed: {err}"),
                }

                if let Err(err) = notifications.deliver_pending(&store, clock.now()) {
                    log::error!("notification delivery pass failed: {err}");
                }

                sleep_until_cancelled(&loop_token, config.scan_interval);
            }
        })
        .map_err(|e| EngineError::Other(e.into()))?;

    Ok(ScanHandle { token, thread: Some(thread) })
}

/// Sleep in short slices so cancellation takes effect promptly.
fn sleep_until_cancelled(token: &CancellationToken, total: StdDuration) {
    let slice = StdDuration::from_millis(50);
    let mut remaining = total;
    while !token.is_cancelled() && remaining > StdDuration::ZERO {
        let nap = remaining.min(slice);
        thread::sleep(nap);
        remaining = remaining.saturating_sub(nap);
    }
}
