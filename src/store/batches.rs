//! Batch and batch-item persistence.

use super::{now_ts, PayoutDb};
use crate::models::{Batch, BatchItem, BatchStatus, PaymentRail, PayoutStatus};
use anyhow::{bail, Result};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

fn row_to_batch(row: &rusqlite::Row) -> rusqlite::Result<Batch> {
    let status: String = row.get(5)?;
    let rail: Option<String> = row.get(10)?;
    Ok(Batch {
        id: row.get(0)?,
        name: row.get(1)?,
        batch_type: row.get(2)?,
        cron_expr: row.get(3)?,
        scheduled_at: row.get(4)?,
        status: BatchStatus::from_str(&status).unwrap_or(BatchStatus::Pending),
        total_items: row.get::<_, i64>(6)? as u32,
        completed_items: row.get::<_, i64>(7)? as u32,
        failed_items: row.get::<_, i64>(8)? as u32,
        connector_id: row.get(9)?,
        rail: rail.and_then(|r| PaymentRail::from_str(&r)),
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
        started_at: row.get(13)?,
        completed_at: row.get(14)?,
    })
}

const BATCH_COLS: &str = "id, name, batch_type, cron_expr, scheduled_at, status, total_items, \
     completed_items, failed_items, connector_id, rail, created_at, updated_at, started_at, \
     completed_at";

impl PayoutDb {
    pub fn create_batch(
        &self,
        name: &str,
        batch_type: &str,
        cron_expr: Option<&str>,
        scheduled_at: Option<i64>,
        connector_id: Option<&str>,
        rail: Option<PaymentRail>,
    ) -> Result<Batch> {
        let now = now_ts();
        let batch = Batch {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            batch_type: batch_type.to_string(),
            cron_expr: cron_expr.map(str::to_string),
            scheduled_at,
            status: BatchStatus::Collecting,
            total_items: 0,
            completed_items: 0,
            failed_items: 0,
            connector_id: connector_id.map(str::to_string),
            rail,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };

        let conn = self.lock();
        conn.execute(
            "INSERT INTO batches (id, name, batch_type, cron_expr, scheduled_at, status,
                                  total_items, completed_items, failed_items, connector_id, rail,
                                  created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, 0, ?7, ?8, ?9, ?10)",
            params![
                batch.id,
                batch.name,
                batch.batch_type,
                batch.cron_expr,
                batch.scheduled_at,
                batch.status.as_str(),
                batch.connector_id,
                batch.rail.map(|r| r.as_str()),
                batch.created_at,
                batch.updated_at,
            ],
        )?;
        Ok(batch)
    }

    pub fn get_batch(&self, batch_id: &str) -> Result<Option<Batch>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM batches WHERE id = ?1",
            BATCH_COLS
        ))?;
        Ok(stmt.query_row([batch_id], row_to_batch).optional()?)
    }

    /// Append a payout to a collecting batch; the sequence number is the
    /// next free slot. Locked batches accept no new items.
    pub fn add_batch_item(&self, batch_id: &str, payout_id: &str) -> Result<BatchItem> {
        let conn = self.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| -> Result<BatchItem> {
            let status: Option<String> = conn
                .query_row(
                    "SELECT status FROM batches WHERE id = ?1",
                    [batch_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(status) = status else {
                bail!("batch {} not found", batch_id);
            };
            if !matches!(status.as_str(), "pending" | "collecting") {
                bail!("batch {} is {}, not accepting items", batch_id, status);
            }

            let seq: i64 = conn.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM batch_items WHERE batch_id = ?1",
                [batch_id],
                |row| row.get(0),
            )?;
            conn.execute(
                "INSERT INTO batch_items (batch_id, payout_id, seq, status) VALUES (?1, ?2, ?3, 'pending')",
                params![batch_id, payout_id, seq],
            )?;
            conn.execute(
                "UPDATE batches SET total_items = total_items + 1, updated_at = ?1 WHERE id = ?2",
                params![now_ts(), batch_id],
            )?;

            Ok(BatchItem {
                batch_id: batch_id.to_string(),
                payout_id: payout_id.to_string(),
                seq,
                status: PayoutStatus::Pending,
                error: None,
            })
        })();

        match result {
            Ok(item) => {
                conn.execute("COMMIT", [])?;
                Ok(item)
            }
            Err(e) => {
                conn.execute("ROLLBACK", []).ok();
                Err(e)
            }
        }
    }

    /// Atomic `collecting` -> `locked`. Returns false when the batch was not
    /// in `collecting` (already locked or further along).
    pub fn lock_batch(&self, batch_id: &str) -> Result<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE batches SET status = 'locked', updated_at = ?1
             WHERE id = ?2 AND status = 'collecting'",
            params![now_ts(), batch_id],
        )?;
        Ok(changed > 0)
    }

    /// Guarded status move used by the processor; `expected` must still hold.
    pub fn set_batch_status(
        &self,
        batch_id: &str,
        expected: BatchStatus,
        next: BatchStatus,
    ) -> Result<bool> {
        let now = now_ts();
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE batches SET status = ?1, updated_at = ?2,
                    started_at = CASE WHEN ?1 = 'processing' THEN ?2 ELSE started_at END,
                    completed_at = CASE WHEN ?1 IN ('completed', 'failed') THEN ?2
                                        ELSE completed_at END
             WHERE id = ?3 AND status = ?4",
            params![next.as_str(), now, batch_id, expected.as_str()],
        )?;
        Ok(changed > 0)
    }

    /// Locked batches due to run.
    pub fn due_locked_batches(&self, now: i64) -> Result<Vec<Batch>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM batches
             WHERE status = 'locked' AND (scheduled_at IS NULL OR scheduled_at <= ?1)
             ORDER BY scheduled_at ASC",
            BATCH_COLS
        ))?;
        let batches = stmt
            .query_map([now], row_to_batch)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(batches)
    }

    /// Items of a batch in dispatch order.
    pub fn batch_items(&self, batch_id: &str) -> Result<Vec<BatchItem>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT batch_id, payout_id, seq, status, error FROM batch_items
             WHERE batch_id = ?1 ORDER BY seq ASC",
        )?;
        let items = stmt
            .query_map([batch_id], |row| {
                let status: String = row.get(3)?;
                Ok(BatchItem {
                    batch_id: row.get(0)?,
                    payout_id: row.get(1)?,
                    seq: row.get(2)?,
                    status: PayoutStatus::from_str(&status).unwrap_or(PayoutStatus::Pending),
                    error: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(items)
    }

    pub fn update_batch_item(
        &self,
        batch_id: &str,
        seq: i64,
        status: PayoutStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE batch_items SET status = ?1, error = ?2 WHERE batch_id = ?3 AND seq = ?4",
            params![status.as_str(), error, batch_id, seq],
        )?;
        Ok(())
    }

    /// Recompute aggregate counters from item rows.
    pub fn refresh_batch_counters(&self, batch_id: &str) -> Result<(u32, u32)> {
        let conn = self.lock();
        let (completed, failed): (i64, i64) = conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN status IN ('sent', 'settled') THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status IN ('failed', 'dlq') THEN 1 ELSE 0 END), 0)
             FROM batch_items WHERE batch_id = ?1",
            [batch_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        conn.execute(
            "UPDATE batches SET completed_items = ?1, failed_items = ?2, updated_at = ?3
             WHERE id = ?4",
            params![completed, failed, now_ts(), batch_id],
        )?;
        Ok((completed as u32, failed as u32))
    }

    /// Reset a recurring batch for its next run.
    pub fn reschedule_batch(&self, batch_id: &str, next_run_at: i64) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE batches SET status = 'collecting', scheduled_at = ?1, updated_at = ?2
             WHERE id = ?3",
            params![next_run_at, now_ts(), batch_id],
        )?;
        Ok(())
    }
}
