//! Append-only audit trail, retry log reads and the alert lifecycle.

use super::{now_ts, PayoutDb};
use crate::models::{
    ActorType, Alert, AlertKind, AlertSeverity, AuditEvent, RetryLogEntry,
};
use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

const SERVICE_NAME: &str = "payout-engine";

/// Insert one audit row inside a caller-held transaction.
pub(crate) fn insert_audit_row(
    conn: &Connection,
    payout_id: &str,
    event_type: &str,
    old_status: Option<&str>,
    new_status: Option<&str>,
    details: Option<&serde_json::Value>,
    actor_type: ActorType,
    actor_id: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO audit_events (payout_id, event_type, old_status, new_status, details,
                                   actor_type, actor_id, service, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            payout_id,
            event_type,
            old_status,
            new_status,
            details.map(|d| d.to_string()),
            actor_type.as_str(),
            actor_id,
            SERVICE_NAME,
            now_ts(),
        ],
    )?;
    Ok(())
}

fn row_to_audit(row: &rusqlite::Row) -> rusqlite::Result<AuditEvent> {
    let actor: String = row.get(6)?;
    Ok(AuditEvent {
        id: row.get(0)?,
        payout_id: row.get(1)?,
        event_type: row.get(2)?,
        old_status: row.get(3)?,
        new_status: row.get(4)?,
        details: row.get(5)?,
        actor_type: ActorType::from_str(&actor).unwrap_or(ActorType::System),
        actor_id: row.get(7)?,
        service: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn row_to_alert(row: &rusqlite::Row) -> rusqlite::Result<Alert> {
    let kind: String = row.get(3)?;
    let severity: String = row.get(4)?;
    Ok(Alert {
        id: row.get(0)?,
        payout_id: row.get(1)?,
        batch_id: row.get(2)?,
        kind: AlertKind::from_str(&kind).unwrap_or(AlertKind::HighValue),
        severity: AlertSeverity::from_str(&severity).unwrap_or(AlertSeverity::Low),
        message: row.get(5)?,
        details: row.get(6)?,
        notified: row.get::<_, i64>(7)? != 0,
        resolved: row.get::<_, i64>(8)? != 0,
        resolved_by: row.get(9)?,
        resolution_note: row.get(10)?,
        resolved_at: row.get(11)?,
        created_at: row.get(12)?,
    })
}

const ALERT_COLS: &str = "id, payout_id, batch_id, kind, severity, message, details, notified, \
     resolved, resolved_by, resolution_note, resolved_at, created_at";

impl PayoutDb {
    /// Standalone audit insert for events outside a store transaction.
    pub fn record_audit_event(
        &self,
        payout_id: &str,
        event_type: &str,
        details: Option<&serde_json::Value>,
        actor_type: ActorType,
        actor_id: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock();
        insert_audit_row(
            &conn, payout_id, event_type, None, None, details, actor_type, actor_id,
        )
    }

    /// Full trail for one payout, oldest first.
    pub fn audit_trail(&self, payout_id: &str) -> Result<Vec<AuditEvent>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, payout_id, event_type, old_status, new_status, details, actor_type,
                    actor_id, service, created_at
             FROM audit_events WHERE payout_id = ?1 ORDER BY id ASC",
        )?;
        let events = stmt
            .query_map([payout_id], row_to_audit)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(events)
    }

    pub fn retry_log(&self, payout_id: &str) -> Result<Vec<RetryLogEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, payout_id, attempt, outcome, error_code, error_message, next_retry_at,
                    backoff_secs, created_at
             FROM retry_log WHERE payout_id = ?1 ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map([payout_id], |row| {
                Ok(RetryLogEntry {
                    id: row.get(0)?,
                    payout_id: row.get(1)?,
                    attempt: row.get::<_, i64>(2)? as u32,
                    outcome: row.get(3)?,
                    error_code: row.get(4)?,
                    error_message: row.get(5)?,
                    next_retry_at: row.get(6)?,
                    backoff_secs: row.get(7)?,
                    created_at: row.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(entries)
    }

    pub fn insert_alert(
        &self,
        payout_id: Option<&str>,
        batch_id: Option<&str>,
        kind: AlertKind,
        severity: AlertSeverity,
        message: &str,
        details: Option<&serde_json::Value>,
    ) -> Result<Alert> {
        let alert = Alert {
            id: Uuid::new_v4().to_string(),
            payout_id: payout_id.map(str::to_string),
            batch_id: batch_id.map(str::to_string),
            kind,
            severity,
            message: message.to_string(),
            details: details.map(|d| d.to_string()),
            notified: false,
            resolved: false,
            resolved_by: None,
            resolution_note: None,
            resolved_at: None,
            created_at: now_ts(),
        };

        let conn = self.lock();
        conn.execute(
            "INSERT INTO alerts (id, payout_id, batch_id, kind, severity, message, details,
                                 notified, resolved, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 0, ?8)",
            params![
                alert.id,
                alert.payout_id,
                alert.batch_id,
                alert.kind.as_str(),
                alert.severity.as_str(),
                alert.message,
                alert.details,
                alert.created_at,
            ],
        )?;
        Ok(alert)
    }

    pub fn get_alert(&self, alert_id: &str) -> Result<Option<Alert>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {} FROM alerts WHERE id = ?1", ALERT_COLS))?;
        Ok(stmt.query_row([alert_id], row_to_alert).optional()?)
    }

    /// Alerts filtered by resolution state, newest first.
    pub fn list_alerts(&self, resolved: Option<bool>, limit: usize) -> Result<Vec<Alert>> {
        let conn = self.lock();
        let alerts = match resolved {
            Some(flag) => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {} FROM alerts WHERE resolved = ?1
                     ORDER BY created_at DESC, id LIMIT ?2",
                    ALERT_COLS
                ))?;
                let rows = stmt
                    .query_map(params![flag as i64, limit as i64], row_to_alert)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {} FROM alerts ORDER BY created_at DESC, id LIMIT ?1",
                    ALERT_COLS
                ))?;
                let rows = stmt
                    .query_map([limit as i64], row_to_alert)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        Ok(alerts)
    }

    /// Set the resolution fields once. Returns the alert as stored, plus
    /// whether this call performed the resolution (false = already done).
    pub fn resolve_alert(
        &self,
        alert_id: &str,
        note: Option<&str>,
        actor: Option<&str>,
    ) -> Result<Option<(Alert, bool)>> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE alerts SET resolved = 1, resolved_by = ?1, resolution_note = ?2,
                    resolved_at = ?3
             WHERE id = ?4 AND resolved = 0",
            params![actor, note, now_ts(), alert_id],
        )?;

        let mut stmt =
            conn.prepare_cached(&format!("SELECT {} FROM alerts WHERE id = ?1", ALERT_COLS))?;
        let alert = stmt.query_row([alert_id], row_to_alert).optional()?;
        Ok(alert.map(|a| (a, changed > 0)))
    }
}
