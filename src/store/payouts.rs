//! Payout row persistence: creation, status transitions, worker claims.

use super::{audit, now_ts, PayoutDb};
use crate::models::{
    ActorType, Amount, ComplianceStatus, HoldStatus, Payout, PayoutFilter, PayoutHold,
    PayoutMethod, PayoutPriority, PayoutStats, PayoutStatus, PaymentRail, StatusBucket,
};
use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::HashMap;

/// Column list shared by every payout SELECT so the row mapper stays stable.
pub(crate) const PAYOUT_COLS: &str = "id, external_id, origin_module, origin_entity_type, \
     origin_entity_id, beneficiary_type, beneficiary_id, beneficiary_account, amount_cents, \
     fee_cents, bank_fee_cents, total_cost_cents, currency, method, priority_rank, \
     requested_settlement_date, scheduled_at, connector_id, rail, bank_reference, status, \
     retry_count, max_retries, next_retry_at, last_error, last_error_code, \
     sla_target_settlement_date, sla_cutoff_time, sla_violated, sla_violation_reason, \
     routing_score, routing_reason, routing_predicted_hours, tenant_type, tenant_id, country, \
     compliance_status, hold_id, ledger_entry_id, reconciliation_id, metadata, created_by, \
     approved_by, created_at, updated_at, processed_at, sent_at, settled_at, failed_at, \
     reversed_at, cancelled_at";

fn bad_column(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}

fn parse_date(s: Option<String>) -> Option<NaiveDate> {
    s.and_then(|v| v.parse::<NaiveDate>().ok())
}

pub(crate) fn row_to_payout(row: &rusqlite::Row) -> rusqlite::Result<Payout> {
    let method: String = row.get(13)?;
    let status: String = row.get(20)?;
    let compliance: String = row.get(36)?;
    let rail: Option<String> = row.get(18)?;

    Ok(Payout {
        id: row.get(0)?,
        external_id: row.get(1)?,
        origin_module: row.get(2)?,
        origin_entity_type: row.get(3)?,
        origin_entity_id: row.get(4)?,
        beneficiary_type: row.get(5)?,
        beneficiary_id: row.get(6)?,
        beneficiary_account: row.get(7)?,
        amount_cents: row.get(8)?,
        fee_cents: row.get(9)?,
        bank_fee_cents: row.get(10)?,
        total_cost_cents: row.get(11)?,
        currency: row.get(12)?,
        method: PayoutMethod::from_str(&method)
            .ok_or_else(|| bad_column(13, format!("unknown method {}", method)))?,
        priority: PayoutPriority::from_rank(row.get(14)?),
        requested_settlement_date: parse_date(row.get(15)?),
        scheduled_at: row.get(16)?,
        connector_id: row.get(17)?,
        rail: rail.and_then(|r| PaymentRail::from_str(&r)),
        bank_reference: row.get(19)?,
        status: PayoutStatus::from_str(&status)
            .ok_or_else(|| bad_column(20, format!("unknown status {}", status)))?,
        retry_count: row.get::<_, i64>(21)? as u32,
        max_retries: row.get::<_, i64>(22)? as u32,
        next_retry_at: row.get(23)?,
        last_error: row.get(24)?,
        last_error_code: row.get(25)?,
        sla_target_settlement_date: parse_date(row.get(26)?),
        sla_cutoff_time: row.get(27)?,
        sla_violated: row.get::<_, i64>(28)? != 0,
        sla_violation_reason: row.get(29)?,
        routing_score: row.get(30)?,
        routing_reason: row.get(31)?,
        routing_predicted_hours: row.get(32)?,
        tenant_type: row.get(33)?,
        tenant_id: row.get(34)?,
        country: row.get(35)?,
        compliance_status: ComplianceStatus::from_str(&compliance)
            .unwrap_or(ComplianceStatus::Clear),
        hold_id: row.get(37)?,
        ledger_entry_id: row.get(38)?,
        reconciliation_id: row.get(39)?,
        metadata: row.get(40)?,
        created_by: row.get(41)?,
        approved_by: row.get(42)?,
        created_at: row.get(43)?,
        updated_at: row.get(44)?,
        processed_at: row.get(45)?,
        sent_at: row.get(46)?,
        settled_at: row.get(47)?,
        failed_at: row.get(48)?,
        reversed_at: row.get(49)?,
        cancelled_at: row.get(50)?,
    })
}

fn insert_payout_row(conn: &Connection, p: &Payout) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO payouts (
            id, external_id, origin_module, origin_entity_type, origin_entity_id,
            beneficiary_type, beneficiary_id, beneficiary_account, amount_cents, fee_cents,
            bank_fee_cents, total_cost_cents, currency, method, priority_rank,
            requested_settlement_date, scheduled_at, connector_id, rail, bank_reference,
            status, retry_count, max_retries, next_retry_at, last_error, last_error_code,
            sla_target_settlement_date, sla_cutoff_time, sla_violated, sla_violation_reason,
            routing_score, routing_reason, routing_predicted_hours, tenant_type, tenant_id,
            country, compliance_status, hold_id, ledger_entry_id, reconciliation_id, metadata,
            created_by, approved_by, created_at, updated_at
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18,
            ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32, ?33, ?34,
            ?35, ?36, ?37, ?38, ?39, ?40, ?41, ?42, ?43, ?44, ?45
        )",
        params![
            p.id,
            p.external_id,
            p.origin_module,
            p.origin_entity_type,
            p.origin_entity_id,
            p.beneficiary_type,
            p.beneficiary_id,
            p.beneficiary_account,
            p.amount_cents,
            p.fee_cents,
            p.bank_fee_cents,
            p.total_cost_cents,
            p.currency,
            p.method.as_str(),
            p.priority.rank(),
            p.requested_settlement_date.map(|d| d.to_string()),
            p.scheduled_at,
            p.connector_id,
            p.rail.map(|r| r.as_str()),
            p.bank_reference,
            p.status.as_str(),
            p.retry_count as i64,
            p.max_retries as i64,
            p.next_retry_at,
            p.last_error,
            p.last_error_code,
            p.sla_target_settlement_date.map(|d| d.to_string()),
            p.sla_cutoff_time,
            p.sla_violated as i64,
            p.sla_violation_reason,
            p.routing_score,
            p.routing_reason,
            p.routing_predicted_hours,
            p.tenant_type,
            p.tenant_id,
            p.country,
            p.compliance_status.as_str(),
            p.hold_id,
            p.ledger_entry_id,
            p.reconciliation_id,
            p.metadata,
            p.created_by,
            p.approved_by,
            p.created_at,
            p.updated_at,
        ],
    )
}

/// Result of the creation transaction.
#[derive(Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// Another request with the same `external_id` won the insert race.
    DuplicateExternalId,
}

/// Hold disposition applied atomically with a status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldAction {
    Release,
    Reverse,
    Expire,
}

/// Optional side effects attached to a status transition.
#[derive(Debug, Default, Clone)]
pub struct TransitionOpts {
    pub details: Option<serde_json::Value>,
    pub actor_type: Option<ActorType>,
    pub actor_id: Option<String>,
    pub bank_reference: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    /// Actual bank fee from the connector; total cost is recomputed.
    pub bank_fee_cents: Option<Amount>,
    pub clear_next_retry: bool,
    pub hold_action: Option<HoldAction>,
}

impl PayoutDb {
    /// Insert the payout, its hold and the creation audit row in one
    /// transaction. A duplicate `external_id` rolls back and reports
    /// `DuplicateExternalId` so the caller can replay the original.
    pub fn create_payout_with_hold(
        &self,
        payout: &Payout,
        hold: &PayoutHold,
    ) -> Result<CreateOutcome> {
        let conn = self.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;

        let inserted = insert_payout_row(&conn, payout);
        if let Err(e) = inserted {
            conn.execute("ROLLBACK", []).ok();
            if let rusqlite::Error::SqliteFailure(err, _) = &e {
                if err.code == rusqlite::ErrorCode::ConstraintViolation
                    && payout.external_id.is_some()
                {
                    return Ok(CreateOutcome::DuplicateExternalId);
                }
            }
            return Err(e).context("insert payout");
        }

        if let Err(e) = super::holds::insert_hold_row(&conn, hold) {
            conn.execute("ROLLBACK", []).ok();
            return Err(e).context("insert hold");
        }

        if let Err(e) = audit::insert_audit_row(
            &conn,
            &payout.id,
            "created",
            None,
            Some(payout.status.as_str()),
            Some(&serde_json::json!({
                "amount_cents": payout.amount_cents,
                "total_cost_cents": payout.total_cost_cents,
                "currency": payout.currency,
                "hold_id": hold.id,
            })),
            payout
                .created_by
                .as_deref()
                .map(|_| ActorType::User)
                .unwrap_or(ActorType::Service),
            payout.created_by.as_deref(),
        ) {
            conn.execute("ROLLBACK", []).ok();
            return Err(e).context("insert creation audit");
        }

        conn.execute("COMMIT", [])?;
        Ok(CreateOutcome::Created)
    }

    pub fn get_payout(&self, id: &str) -> Result<Option<Payout>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM payouts WHERE id = ?1",
            PAYOUT_COLS
        ))?;
        let payout = stmt.query_row([id], row_to_payout).optional()?;
        Ok(payout)
    }

    pub fn get_payout_by_external_id(&self, external_id: &str) -> Result<Option<Payout>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM payouts WHERE external_id = ?1",
            PAYOUT_COLS
        ))?;
        let payout = stmt.query_row([external_id], row_to_payout).optional()?;
        Ok(payout)
    }

    pub fn get_payout_by_bank_reference(&self, reference: &str) -> Result<Option<Payout>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM payouts WHERE bank_reference = ?1",
            PAYOUT_COLS
        ))?;
        let payout = stmt.query_row([reference], row_to_payout).optional()?;
        Ok(payout)
    }

    /// Apply one status transition atomically: payout row, hold row when the
    /// transition is terminal, and the audit event. `from` is re-checked
    /// inside the transaction; a concurrent change aborts.
    ///
    /// Returns the updated payout and the ledger entry id of the hold that
    /// changed state, for the follow-up ledger call.
    pub fn apply_status_transition(
        &self,
        payout_id: &str,
        from: PayoutStatus,
        to: PayoutStatus,
        opts: &TransitionOpts,
    ) -> Result<(Payout, Option<String>)> {
        let now = now_ts();
        let conn = self.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| -> Result<(Payout, Option<String>)> {
            let changed = conn.execute(
                "UPDATE payouts SET
                    status = ?1,
                    updated_at = ?2,
                    bank_reference = COALESCE(?3, bank_reference),
                    last_error = COALESCE(?4, last_error),
                    last_error_code = COALESCE(?5, last_error_code),
                    bank_fee_cents = COALESCE(?6, bank_fee_cents),
                    total_cost_cents = amount_cents + fee_cents + COALESCE(?6, bank_fee_cents),
                    next_retry_at = CASE WHEN ?7 THEN NULL ELSE next_retry_at END,
                    processed_at = CASE WHEN ?1 = 'processing' THEN ?2 ELSE processed_at END,
                    sent_at = CASE WHEN ?1 = 'sent' THEN ?2 ELSE sent_at END,
                    settled_at = CASE WHEN ?1 = 'settled' THEN ?2 ELSE settled_at END,
                    failed_at = CASE WHEN ?1 = 'failed' THEN ?2 ELSE failed_at END,
                    reversed_at = CASE WHEN ?1 = 'reversed' THEN ?2 ELSE reversed_at END,
                    cancelled_at = CASE WHEN ?1 = 'cancelled' THEN ?2 ELSE cancelled_at END
                 WHERE id = ?8 AND status = ?9",
                params![
                    to.as_str(),
                    now,
                    opts.bank_reference,
                    opts.error_message,
                    opts.error_code,
                    opts.bank_fee_cents,
                    opts.clear_next_retry,
                    payout_id,
                    from.as_str(),
                ],
            )?;
            if changed == 0 {
                bail!(
                    "payout {} no longer in status {} during transition to {}",
                    payout_id,
                    from.as_str(),
                    to.as_str()
                );
            }

            audit::insert_audit_row(
                &conn,
                payout_id,
                "status_changed",
                Some(from.as_str()),
                Some(to.as_str()),
                opts.details.as_ref(),
                opts.actor_type.unwrap_or(ActorType::System),
                opts.actor_id.as_deref(),
            )?;

            // Hold disposition audits after the status change, so the trail
            // reads created, status changes, then the hold event.
            let hold_entry = match opts.hold_action {
                Some(action) => apply_hold_action(&conn, payout_id, action, now)?,
                None => None,
            };

            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM payouts WHERE id = ?1",
                PAYOUT_COLS
            ))?;
            let payout = stmt
                .query_row([payout_id], row_to_payout)
                .context("re-read payout after transition")?;
            Ok((payout, hold_entry))
        })();

        match result {
            Ok(out) => {
                conn.execute("COMMIT", [])?;
                Ok(out)
            }
            Err(e) => {
                conn.execute("ROLLBACK", []).ok();
                Err(e)
            }
        }
    }

    /// Claim ready payouts for dispatch: status pending/scheduled, due, with
    /// an active hold. Claimed rows move to `processing` with their audit
    /// rows in the same transaction, so no other worker sweep can pick them.
    pub fn lease_ready(&self, limit: usize, priority_enabled: bool, now: i64) -> Result<Vec<Payout>> {
        let order = if priority_enabled {
            "p.priority_rank ASC, p.created_at ASC"
        } else {
            "p.created_at ASC"
        };
        let conn = self.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| -> Result<Vec<Payout>> {
            let sql = format!(
                "SELECT {cols} FROM payouts p
                 JOIN payout_holds h ON h.payout_id = p.id AND h.status = 'active'
                 WHERE p.status IN ('pending', 'scheduled')
                   AND (p.scheduled_at IS NULL OR p.scheduled_at <= ?1)
                 ORDER BY {order}
                 LIMIT ?2",
                cols = PAYOUT_COLS
                    .split(", ")
                    .map(|c| format!("p.{}", c))
                    .collect::<Vec<_>>()
                    .join(", "),
                order = order
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let mut leased: Vec<Payout> = stmt
                .query_map(params![now, limit as i64], row_to_payout)?
                .collect::<rusqlite::Result<_>>()?;

            for p in &mut leased {
                conn.execute(
                    "UPDATE payouts SET status = 'processing', processed_at = ?1, updated_at = ?1
                     WHERE id = ?2",
                    params![now, p.id],
                )?;
                audit::insert_audit_row(
                    &conn,
                    &p.id,
                    "status_changed",
                    Some(p.status.as_str()),
                    Some(PayoutStatus::Processing.as_str()),
                    Some(&serde_json::json!({"reason": "leased_for_dispatch"})),
                    ActorType::System,
                    None,
                )?;
                p.status = PayoutStatus::Processing;
                p.processed_at = Some(now);
                p.updated_at = now;
            }
            Ok(leased)
        })();

        match result {
            Ok(rows) => {
                conn.execute("COMMIT", [])?;
                Ok(rows)
            }
            Err(e) => {
                conn.execute("ROLLBACK", []).ok();
                Err(e)
            }
        }
    }

    /// Claim failed payouts whose backoff has elapsed. Each claimed row is
    /// walked failed -> pending -> processing with both audit rows, keeping
    /// the transition graph intact.
    pub fn lease_due_retries(&self, limit: usize, now: i64) -> Result<Vec<Payout>> {
        let conn = self.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| -> Result<Vec<Payout>> {
            let sql = format!(
                "SELECT {} FROM payouts
                 WHERE status = 'failed' AND retry_count < max_retries
                   AND next_retry_at IS NOT NULL AND next_retry_at <= ?1
                 ORDER BY next_retry_at ASC
                 LIMIT ?2",
                PAYOUT_COLS
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let mut leased: Vec<Payout> = stmt
                .query_map(params![now, limit as i64], row_to_payout)?
                .collect::<rusqlite::Result<_>>()?;

            for p in &mut leased {
                conn.execute(
                    "UPDATE payouts SET status = 'processing', processed_at = ?1, updated_at = ?1
                     WHERE id = ?2",
                    params![now, p.id],
                )?;
                audit::insert_audit_row(
                    &conn,
                    &p.id,
                    "status_changed",
                    Some("failed"),
                    Some("pending"),
                    Some(&serde_json::json!({"reason": "retry_due", "attempt": p.retry_count})),
                    ActorType::System,
                    None,
                )?;
                audit::insert_audit_row(
                    &conn,
                    &p.id,
                    "status_changed",
                    Some("pending"),
                    Some("processing"),
                    Some(&serde_json::json!({"reason": "leased_for_dispatch"})),
                    ActorType::System,
                    None,
                )?;
                p.status = PayoutStatus::Processing;
                p.processed_at = Some(now);
                p.updated_at = now;
            }
            Ok(leased)
        })();

        match result {
            Ok(rows) => {
                conn.execute("COMMIT", [])?;
                Ok(rows)
            }
            Err(e) => {
                conn.execute("ROLLBACK", []).ok();
                Err(e)
            }
        }
    }

    /// Startup sweeper: rows a crashed worker left in `processing` go back
    /// to `pending` so the lease query can pick them up again.
    pub fn rescue_stale_processing(&self, threshold_secs: i64, now: i64) -> Result<Vec<String>> {
        let cutoff = now - threshold_secs;
        let conn = self.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| -> Result<Vec<String>> {
            let mut stmt = conn.prepare_cached(
                "SELECT id FROM payouts WHERE status = 'processing' AND updated_at < ?1",
            )?;
            let ids: Vec<String> = stmt
                .query_map([cutoff], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;

            for id in &ids {
                conn.execute(
                    "UPDATE payouts SET status = 'pending', updated_at = ?1 WHERE id = ?2",
                    params![now, id],
                )?;
                audit::insert_audit_row(
                    &conn,
                    id,
                    "status_changed",
                    Some("processing"),
                    Some("pending"),
                    Some(&serde_json::json!({"reason": "stale_processing_rescued"})),
                    ActorType::System,
                    None,
                )?;
            }
            Ok(ids)
        })();

        match result {
            Ok(ids) => {
                conn.execute("COMMIT", [])?;
                Ok(ids)
            }
            Err(e) => {
                conn.execute("ROLLBACK", []).ok();
                Err(e)
            }
        }
    }

    /// Flag overdue, still-open payouts. Returns the rows flagged this pass
    /// so the caller can raise alerts; already-flagged rows never reappear.
    pub fn flag_sla_violations(&self, today: NaiveDate) -> Result<Vec<Payout>> {
        let conn = self.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| -> Result<Vec<Payout>> {
            let sql = format!(
                "SELECT {} FROM payouts
                 WHERE status NOT IN ('settled', 'reversed', 'cancelled', 'dlq')
                   AND sla_violated = 0
                   AND sla_target_settlement_date IS NOT NULL
                   AND sla_target_settlement_date < ?1",
                PAYOUT_COLS
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let mut flagged: Vec<Payout> = stmt
                .query_map([today.to_string()], row_to_payout)?
                .collect::<rusqlite::Result<_>>()?;

            let now = now_ts();
            for p in &mut flagged {
                conn.execute(
                    "UPDATE payouts SET sla_violated = 1,
                            sla_violation_reason = 'target_date_missed', updated_at = ?1
                     WHERE id = ?2",
                    params![now, p.id],
                )?;
                audit::insert_audit_row(
                    &conn,
                    &p.id,
                    "sla_violated",
                    None,
                    None,
                    Some(&serde_json::json!({
                        "reason": "target_date_missed",
                        "target_date": p.sla_target_settlement_date.map(|d| d.to_string()),
                    })),
                    ActorType::System,
                    None,
                )?;
                p.sla_violated = true;
                p.sla_violation_reason = Some("target_date_missed".to_string());
            }
            Ok(flagged)
        })();

        match result {
            Ok(rows) => {
                conn.execute("COMMIT", [])?;
                Ok(rows)
            }
            Err(e) => {
                conn.execute("ROLLBACK", []).ok();
                Err(e)
            }
        }
    }

    /// Record one retry decision: bump the counter, stamp the next attempt,
    /// append the retry log row and its audit event.
    pub fn record_retry_scheduled(
        &self,
        payout_id: &str,
        new_count: u32,
        next_retry_at: i64,
        backoff_secs: i64,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<Payout> {
        let now = now_ts();
        let conn = self.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| -> Result<Payout> {
            conn.execute(
                "UPDATE payouts SET retry_count = ?1, next_retry_at = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![new_count as i64, next_retry_at, now, payout_id],
            )?;
            conn.execute(
                "INSERT INTO retry_log (payout_id, attempt, outcome, error_code, error_message,
                                        next_retry_at, backoff_secs, created_at)
                 VALUES (?1, ?2, 'retry_scheduled', ?3, ?4, ?5, ?6, ?7)",
                params![
                    payout_id,
                    new_count as i64,
                    error_code,
                    error_message,
                    next_retry_at,
                    backoff_secs,
                    now
                ],
            )?;
            audit::insert_audit_row(
                &conn,
                payout_id,
                "retry_scheduled",
                None,
                None,
                Some(&serde_json::json!({
                    "attempt": new_count,
                    "next_retry_at": next_retry_at,
                    "backoff_secs": backoff_secs,
                })),
                ActorType::System,
                None,
            )?;

            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM payouts WHERE id = ?1",
                PAYOUT_COLS
            ))?;
            Ok(stmt.query_row([payout_id], row_to_payout)?)
        })();

        match result {
            Ok(p) => {
                conn.execute("COMMIT", [])?;
                Ok(p)
            }
            Err(e) => {
                conn.execute("ROLLBACK", []).ok();
                Err(e)
            }
        }
    }

    /// Terminal retry bookkeeping: pin the counter at the final attempt,
    /// clear the schedule and append the dead-letter retry-log row.
    pub fn record_retry_exhausted(
        &self,
        payout_id: &str,
        final_attempt: u32,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let now = now_ts();
        let conn = self.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = (|| -> Result<()> {
            conn.execute(
                "UPDATE payouts SET retry_count = ?1, next_retry_at = NULL, updated_at = ?2
                 WHERE id = ?3",
                params![final_attempt as i64, now, payout_id],
            )?;
            conn.execute(
                "INSERT INTO retry_log (payout_id, attempt, outcome, error_code, error_message,
                                        next_retry_at, backoff_secs, created_at)
                 VALUES (?1, ?2, 'dlq', ?3, ?4, NULL, NULL, ?5)",
                params![payout_id, final_attempt as i64, error_code, error_message, now],
            )?;
            Ok(())
        })();
        match result {
            Ok(()) => {
                conn.execute("COMMIT", [])?;
                Ok(())
            }
            Err(e) => {
                conn.execute("ROLLBACK", []).ok();
                Err(e)
            }
        }
    }

    /// Attach the final double-entry posting id once a payout settles.
    pub fn set_final_ledger_entry(&self, payout_id: &str, entry_id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE payouts SET ledger_entry_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![entry_id, now_ts(), payout_id],
        )?;
        Ok(())
    }

    /// Reset a dead-lettered payout for a fresh dispatch cycle (ops retry):
    /// new hold row, zeroed counters, back to `pending`.
    pub fn resurrect_from_dlq(&self, payout_id: &str, hold: &PayoutHold) -> Result<Payout> {
        let now = now_ts();
        let conn = self.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = (|| -> Result<Payout> {
            let changed = conn.execute(
                "UPDATE payouts SET status = 'pending', retry_count = 0, next_retry_at = NULL,
                        hold_id = ?1, last_error = NULL, last_error_code = NULL, updated_at = ?2
                 WHERE id = ?3 AND status = 'dlq'",
                params![hold.id, now, payout_id],
            )?;
            if changed == 0 {
                bail!("payout {} is not in dlq", payout_id);
            }
            super::holds::insert_hold_row(&conn, hold)?;
            audit::insert_audit_row(
                &conn,
                payout_id,
                "status_changed",
                Some("dlq"),
                Some("pending"),
                Some(&serde_json::json!({"reason": "manual_retry", "hold_id": hold.id})),
                ActorType::User,
                None,
            )?;
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM payouts WHERE id = ?1",
                PAYOUT_COLS
            ))?;
            Ok(stmt.query_row([payout_id], row_to_payout)?)
        })();
        match result {
            Ok(p) => {
                conn.execute("COMMIT", [])?;
                Ok(p)
            }
            Err(e) => {
                conn.execute("ROLLBACK", []).ok();
                Err(e)
            }
        }
    }

    pub fn list_payouts(
        &self,
        filter: &PayoutFilter,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Payout>, u64)> {
        let mut where_parts: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(tenant) = &filter.tenant_id {
            where_parts.push("tenant_id = ?");
            values.push(Value::from(tenant.clone()));
        }
        if let Some(status) = filter.status {
            where_parts.push("status = ?");
            values.push(Value::from(status.as_str().to_string()));
        }
        if let Some(beneficiary) = &filter.beneficiary_id {
            where_parts.push("beneficiary_id = ?");
            values.push(Value::from(beneficiary.clone()));
        }
        if let Some(after) = filter.created_after {
            where_parts.push("created_at >= ?");
            values.push(Value::from(after));
        }
        if let Some(before) = filter.created_before {
            where_parts.push("created_at <= ?");
            values.push(Value::from(before));
        }

        let where_sql = if where_parts.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", where_parts.join(" AND "))
        };

        let conn = self.lock();

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM payouts{}", where_sql),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        values.push(Value::from(limit as i64));
        values.push(Value::from(offset as i64));
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM payouts{} ORDER BY created_at DESC, id LIMIT ? OFFSET ?",
            PAYOUT_COLS, where_sql
        ))?;
        let rows: Vec<Payout> = stmt
            .query_map(params_from_iter(values.iter()), row_to_payout)?
            .collect::<rusqlite::Result<_>>()?;

        Ok((rows, total as u64))
    }

    /// Per-tenant rollup: counts and decimal amounts by status plus the
    /// average hours from creation to settlement.
    pub fn payout_stats(&self, tenant_id: &str) -> Result<PayoutStats> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT status, COUNT(*), SUM(amount_cents) FROM payouts
             WHERE tenant_id = ?1 GROUP BY status",
        )?;
        let mut by_status: HashMap<String, StatusBucket> = HashMap::new();
        let rows = stmt.query_map([tenant_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        for row in rows {
            let (status, count, amount_cents) = row?;
            by_status.insert(
                status,
                StatusBucket {
                    count: count as u64,
                    amount: crate::models::from_amount(amount_cents),
                },
            );
        }

        let avg_settlement_hours: Option<f64> = conn.query_row(
            "SELECT AVG((settled_at - created_at) / 3600.0) FROM payouts
             WHERE tenant_id = ?1 AND status = 'settled' AND settled_at IS NOT NULL",
            [tenant_id],
            |row| row.get(0),
        )?;

        Ok(PayoutStats {
            by_status,
            avg_settlement_hours,
        })
    }
}

/// Move the active hold for `payout_id` per the requested action and write
/// the matching `hold_*` audit row. Returns the ledger entry id of the
/// hold that changed, if any. Idempotent: no active hold means nothing to
/// do and no audit.
fn apply_hold_action(
    conn: &Connection,
    payout_id: &str,
    action: HoldAction,
    now: i64,
) -> Result<Option<String>> {
    let existing: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT id, ledger_entry_id FROM payout_holds
             WHERE payout_id = ?1 AND status = 'active'",
            [payout_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let Some((hold_id, ledger_entry_id)) = existing else {
        return Ok(None);
    };

    let (new_status, ts_col, event_type) = match action {
        HoldAction::Release => (HoldStatus::Released, "released_at", "hold_released"),
        HoldAction::Reverse => (HoldStatus::Reversed, "reversed_at", "hold_reversed"),
        HoldAction::Expire => (HoldStatus::Expired, "reversed_at", "hold_expired"),
    };
    conn.execute(
        &format!(
            "UPDATE payout_holds SET status = ?1, {} = ?2 WHERE id = ?3",
            ts_col
        ),
        params![new_status.as_str(), now, hold_id],
    )?;

    audit::insert_audit_row(
        conn,
        payout_id,
        event_type,
        None,
        None,
        Some(&serde_json::json!({
            "hold_id": hold_id,
            "ledger_entry_id": ledger_entry_id,
        })),
        ActorType::System,
        None,
    )?;

    Ok(ledger_entry_id)
}
