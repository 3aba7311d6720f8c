//! Escalation notification queries. Rows are mutated only by delivery
//! (attempts, delivered_at, failed status) and acknowledgement (read).

use super::{dt, ts, ComplianceStore};
use crate::{error::EngineResult, notification::NotificationRecord, types::NotificationStatus};
use chrono::{DateTime, Utc};
use rusqlite::params;

impl ComplianceStore {
    pub fn insert_notification(&self, n: &NotificationRecord) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO escalation_notification (
                notification_id, recipient, escalation_id, payload,
                status, attempts, created_at, delivered_at, read_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                n.notification_id,
                n.recipient,
                n.escalation_id,
                serde_json::to_string(&n.payload)?,
                n.status,
                n.attempts,
                ts(n.created_at),
                n.delivered_at.map(ts),
                n.read_at.map(ts),
            ],
        )?;
        Ok(())
    }

    /// Pending rows that have never been delivered, oldest first.
    pub fn undelivered_notifications(&self) -> EngineResult<Vec<NotificationRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT notification_id, recipient, escalation_id, payload,
                    status, attempts, created_at, delivered_at, read_at
             FROM escalation_notification
             WHERE status = 'pending' AND delivered_at IS NULL
             ORDER BY created_at ASC, notification_id ASC",
        )?;
        let rows = stmt
            .query_map([], raw_notification_mapper)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(parse_notification).collect()
    }

    pub fn mark_notification_delivered(
        &self,
        notification_id: &str,
        attempts: i64,
        delivered_at: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.conn.execute(
            "UPDATE escalation_notification
             SET attempts = ?1, delivered_at = ?2
             WHERE notification_id = ?3",
            params![attempts, ts(delivered_at), notification_id],
        )?;
        Ok(())
    }

    pub fn mark_notification_failed(
        &self,
        notification_id: &str,
        attempts: i64,
    ) -> EngineResult<()> {
        self.conn.execute(
            "UPDATE escalation_notification
             SET status = 'failed', attempts = ?1
             WHERE notification_id = ?2",
            params![attempts, notification_id],
        )?;
        Ok(())
    }

    /// Acknowledge a notification. Only pending rows can be read.
    pub fn mark_notification_read(
        &self,
        notification_id: &str,
        read_at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let changed = self.conn.execute(
            "UPDATE escalation_notification
             SET status = 'read', read_at = ?1
             WHERE notification_id = ?2 AND status = 'pending'",
            params![ts(read_at), notification_id],
        )?;
        Ok(changed == 1)
    }

    pub fn notifications_for_escalation(
        &self,
        escalation_id: &str,
    ) -> EngineResult<Vec<NotificationRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT notification_id, recipient, escalation_id, payload,
                    status, attempts, created_at, delivered_at, read_at
             FROM escalation_notification
             WHERE escalation_id = ?1
             ORDER BY created_at ASC, notification_id ASC",
        )?;
        let rows = stmt
            .query_map(params![escalation_id], raw_notification_mapper)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(parse_notification).collect()
    }

    pub fn notification_count_by_status(&self, status: NotificationStatus) -> EngineResult<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM escalation_notification WHERE status = ?1",
                params![status],
                |row| row.get(0),
            )
            .map_err(Into::into)
    }
}

type RawNotification = (
    String,
    String,
    String,
    String,
    NotificationStatus,
    i64,
    i64,
    Option<i64>,
    Option<i64>,
);

fn raw_notification_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawNotification> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn parse_notification(raw: RawNotification) -> EngineResult<NotificationRecord> {
    let (notification_id, recipient, escalation_id, payload, status, attempts, created_at, delivered_at, read_at) =
        raw;
    Ok(NotificationRecord {
        notification_id,
        recipient,
        escalation_id,
        payload: serde_json::from_str(&payload)?,
        status,
        attempts,
        created_at: dt(created_at),
        delivered_at: delivered_at.map(dt),
        read_at: read_at.map(dt),
    })
}
