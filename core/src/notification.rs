//! Escalation notification delivery — fire-and-retry behind a dispatcher
//! trait.
//!
//! The escalation transition is durable before any dispatch attempt; a
//! notification that exhausts its retry budget is marked `failed` and left
//! alone. Delivery never feeds back into case state.

use crate::{
    error::{EngineError, EngineResult},
    escalation::EscalationRecord,
    store::ComplianceStore,
    types::NotificationStatus,
};
use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use serde_json::{json, Value};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration as StdDuration;

/// Outcome of a single dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchResult {
    Delivered,
    Failed(String),
}

/// The external delivery collaborator (email, webhook, queue — not ours).
pub trait NotificationDispatcher: Send + Sync {
    fn send(&self, recipient: &str, escalation_id: &str, payload: &Value) -> DispatchResult;
}

#[derive(Debug, Clone)]
pub struct NotificationRecord {
    pub notification_id: String,
    pub recipient: String,
    pub escalation_id: String,
    pub payload: Value,
    pub status: NotificationStatus,
    pub attempts: i64,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

impl NotificationRecord {
    /// A fresh pending notification for one recipient of an escalation.
    pub fn pending(
        recipient: &str,
        escalation: &EscalationRecord,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            notification_id: uuid::Uuid::new_v4().to_string(),
            recipient: recipient.to_string(),
            escalation_id: escalation.escalation_id.clone(),
            payload: json!({
                "case_id": escalation.case_id,
                "level": escalation.level,
                "triggered_by": escalation.triggered_by.as_str(),
                "reason": escalation.reason,
            }),
            status: NotificationStatus::Pending,
            attempts: 0,
            created_at: now,
            delivered_at: None,
            read_at: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: StdDuration,
    pub max_delay: StdDuration,
    /// Upper bound on a single dispatch attempt.
    pub dispatch_timeout: StdDuration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: StdDuration::from_millis(200),
            max_delay: StdDuration::from_secs(5),
            dispatch_timeout: StdDuration::from_secs(2),
        }
    }
}

#[derive(Debug, Default)]
pub struct DeliveryStats {
    pub delivered: usize,
    pub failed: usize,
}

pub struct NotificationService {
    dispatcher: Arc<dyn NotificationDispatcher>,
    policy: RetryPolicy,
    // Jitter stream is seeded so retry timing stays reproducible; it never
    // touches scoring paths.
    jitter: Mutex<Pcg64Mcg>,
}

impl NotificationService {
    pub fn new(
        dispatcher: Arc<dyn NotificationDispatcher>,
        policy: RetryPolicy,
        jitter_seed: u64,
    ) -> Self {
        Self {
            dispatcher,
            policy,
            jitter: Mutex::new(Pcg64Mcg::seed_from_u64(jitter_seed)),
        }
    }

    /// Attempt delivery for every pending, not-yet-delivered notification.
    /// Exhausted rows are marked `failed`; the scan continues regardless.
    pub fn deliver_pending(
        &self,
        store: &ComplianceStore,
        now: DateTime<Utc>,
    ) -> EngineResult<DeliveryStats> {
        let mut stats = DeliveryStats::default();

        for notification in store.undelivered_notifications()? {
            match self.deliver_one(&notification) {
                Ok(attempts) => {
                    store.mark_notification_delivered(
                        &notification.notification_id,
                        attempts as i64,
                        now,
                    )?;
                    stats.delivered += 1;
                }
                Err(EngineError::DeliveryFailure { recipient, attempts }) => {
                    log::warn!(
                        "notification {} to '{recipient}' failed after {attempts} attempts",
                        notification.notification_id
                    );
                    store.mark_notification_failed(
                        &notification.notification_id,
                        attempts as i64,
                    )?;
                    stats.failed += 1;
                }
                Err(other) => return Err(other),
            }
        }

        Ok(stats)
    }

    /// Returns the attempt count on success.
    fn deliver_one(&self, notification: &NotificationRecord) -> EngineResult<u32> {
        for attempt in 1..=self.policy.max_attempts {
            match self.send_with_timeout(notification) {
                DispatchResult::Delivered => return Ok(attempt),
                DispatchResult::Failed(reason) => {
                    log::debug!(
                        "dispatch attempt {attempt} for {} failed: {reason}",
                        notification.notification_id
                    );
                    if attempt < self.policy.max_attempts {
                        std::thread::sleep(self.backoff_delay(attempt));
                    }
                }
            }
        }
        Err(EngineError::DeliveryFailure {
            recipient: notification.recipient.clone(),
            attempts: self.policy.max_attempts,
        })
    }

    /// One attempt, bounded by the dispatch timeout. The dispatcher runs on
    /// a helper thread; if it outlives the timeout the attempt counts as
    /// failed and the straggler is abandoned.
    fn send_with_timeout(&self, notification: &NotificationRecord) -> DispatchResult {
        let (tx, rx) = mpsc::channel();
        let dispatcher = Arc::clone(&self.dispatcher);
        let recipient = notification.recipient.clone();
        let escalation_id = notification.escalation_id.clone();
        let payload = notification.payload.clone();

        std::thread::spawn(move || {
            let _ = tx.send(dispatcher.send(&recipient, &escalation_id, &payload));
        });

        match rx.recv_timeout(self.policy.dispatch_timeout) {
            Ok(result) => result,
            Err(_) => DispatchResult::Failed("dispatch timed out".into()),
        }
    }

    /// Exponential backoff with up to 25% deterministic jitter, capped.
    fn backoff_delay(&self, attempt: u32) -> StdDuration {
        let base_ms = self.policy.base_delay.as_millis() as u64;
        let exp_ms = base_ms.saturating_mul(1u64 << (attempt - 1).min(16));
        let capped_ms = exp_ms.min(self.policy.max_delay.as_millis() as u64);
        let jitter_frac: f64 = self.jitter.lock().expect("jitter lock poisoned").gen();
        let jitter_ms = (capped_ms as f64 * 0.25 * jitter_frac) as u64;
        StdDuration::from_millis(capped_ms + jitter_ms)
    }
}
