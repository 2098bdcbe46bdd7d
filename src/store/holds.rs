//! Hold row persistence and the expiry sweep.

use super::{audit, PayoutDb};
use crate::models::{ActorType, HoldStatus, Payout, PayoutHold, PayoutStatus};
use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};

pub(crate) fn insert_hold_row(conn: &Connection, h: &PayoutHold) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO payout_holds (id, payout_id, amount_cents, currency, debit_account,
                                   credit_account, status, expires_at, ledger_entry_id,
                                   created_at, released_at, reversed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            h.id,
            h.payout_id,
            h.amount_cents,
            h.currency,
            h.debit_account,
            h.credit_account,
            h.status.as_str(),
            h.expires_at,
            h.ledger_entry_id,
            h.created_at,
            h.released_at,
            h.reversed_at,
        ],
    )
}

fn row_to_hold(row: &rusqlite::Row) -> rusqlite::Result<PayoutHold> {
    let status: String = row.get(6)?;
    Ok(PayoutHold {
        id: row.get(0)?,
        payout_id: row.get(1)?,
        amount_cents: row.get(2)?,
        currency: row.get(3)?,
        debit_account: row.get(4)?,
        credit_account: row.get(5)?,
        status: HoldStatus::from_str(&status).unwrap_or(HoldStatus::Active),
        expires_at: row.get(7)?,
        ledger_entry_id: row.get(8)?,
        created_at: row.get(9)?,
        released_at: row.get(10)?,
        reversed_at: row.get(11)?,
    })
}

const HOLD_COLS: &str = "id, payout_id, amount_cents, currency, debit_account, credit_account, \
     status, expires_at, ledger_entry_id, created_at, released_at, reversed_at";

impl PayoutDb {
    pub fn get_hold(&self, hold_id: &str) -> Result<Option<PayoutHold>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM payout_holds WHERE id = ?1",
            HOLD_COLS
        ))?;
        Ok(stmt.query_row([hold_id], row_to_hold).optional()?)
    }

    pub fn get_active_hold(&self, payout_id: &str) -> Result<Option<PayoutHold>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM payout_holds WHERE payout_id = ?1 AND status = 'active'",
            HOLD_COLS
        ))?;
        Ok(stmt.query_row([payout_id], row_to_hold).optional()?)
    }

    /// Latest hold for a payout regardless of state.
    pub fn get_hold_for_payout(&self, payout_id: &str) -> Result<Option<PayoutHold>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM payout_holds WHERE payout_id = ?1
             ORDER BY created_at DESC LIMIT 1",
            HOLD_COLS
        ))?;
        Ok(stmt.query_row([payout_id], row_to_hold).optional()?)
    }

    /// Expire active holds whose TTL elapsed while the payout never went
    /// out. The payout is forced to `failed` with reason `hold_expired` and
    /// parked out of the retry loop (`next_retry_at` stays NULL).
    ///
    /// Returns (hold, payout-after-update) pairs for ledger reversal and
    /// alerting.
    pub fn expire_overdue_holds(&self, now: i64) -> Result<Vec<(PayoutHold, Payout)>> {
        let conn = self.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| -> Result<Vec<(PayoutHold, Payout)>> {
            let sql = format!(
                "SELECT {} FROM payout_holds h
                 WHERE h.status = 'active' AND h.expires_at <= ?1
                   AND EXISTS (
                       SELECT 1 FROM payouts p WHERE p.id = h.payout_id
                         AND p.status IN ('pending', 'scheduled', 'processing', 'on_hold')
                   )",
                HOLD_COLS
                    .split(", ")
                    .map(|c| format!("h.{}", c))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let holds: Vec<PayoutHold> = stmt
                .query_map([now], row_to_hold)?
                .collect::<rusqlite::Result<_>>()?;

            let mut expired = Vec::with_capacity(holds.len());
            for hold in holds {
                conn.execute(
                    "UPDATE payout_holds SET status = 'expired', reversed_at = ?1 WHERE id = ?2",
                    params![now, hold.id],
                )?;
                let old_status: String = conn.query_row(
                    "SELECT status FROM payouts WHERE id = ?1",
                    [hold.payout_id.as_str()],
                    |row| row.get(0),
                )?;
                conn.execute(
                    "UPDATE payouts SET status = 'failed', failed_at = ?1, updated_at = ?1,
                            last_error = 'hold expired before submission',
                            last_error_code = 'hold_expired', next_retry_at = NULL
                     WHERE id = ?2",
                    params![now, hold.payout_id],
                )?;
                audit::insert_audit_row(
                    &conn,
                    &hold.payout_id,
                    "status_changed",
                    Some(old_status.as_str()),
                    Some(PayoutStatus::Failed.as_str()),
                    Some(&serde_json::json!({"reason": "hold_expired", "hold_id": hold.id})),
                    ActorType::System,
                    None,
                )?;
                audit::insert_audit_row(
                    &conn,
                    &hold.payout_id,
                    "hold_expired",
                    None,
                    None,
                    Some(&serde_json::json!({
                        "hold_id": hold.id,
                        "ledger_entry_id": hold.ledger_entry_id,
                    })),
                    ActorType::System,
                    None,
                )?;

                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {} FROM payouts WHERE id = ?1",
                    super::payouts::PAYOUT_COLS
                ))?;
                let payout = stmt.query_row([hold.payout_id.as_str()], super::payouts::row_to_payout)?;
                expired.push((
                    PayoutHold {
                        status: HoldStatus::Expired,
                        reversed_at: Some(now),
                        ..hold
                    },
                    payout,
                ));
            }
            Ok(expired)
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

    /// Count of active holds, used by invariant checks in tests.
    pub fn active_hold_count(&self) -> Result<i64> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM payout_holds WHERE status = 'active'",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
