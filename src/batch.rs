//! Scheduled batch execution.
//!
//! A batch collects payouts, gets locked, and is drained in sequence order
//! through the same dispatch path the worker uses. Recurring batches carry
//! a cron expression and reschedule themselves after every run.

use crate::connectors::ConnectorFactory;
use crate::error::{PayoutError, PayoutResult};
use crate::models::{AlertKind, AlertSeverity, Batch, BatchStatus, PaymentRail};
use crate::service::PayoutService;
use crate::store::now_ts;
use crate::worker::dispatch_payout;
use chrono::{DateTime, Utc};
use croner::Cron;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

pub struct BatchProcessor {
    service: Arc<PayoutService>,
    connectors: Arc<ConnectorFactory>,
}

impl BatchProcessor {
    pub fn new(service: Arc<PayoutService>, connectors: Arc<ConnectorFactory>) -> Self {
        Self {
            service,
            connectors,
        }
    }

    pub fn create_batch(
        &self,
        name: &str,
        batch_type: &str,
        cron_expr: Option<&str>,
        scheduled_at: Option<i64>,
        connector_id: Option<&str>,
        rail: Option<PaymentRail>,
    ) -> PayoutResult<Batch> {
        if let Some(expr) = cron_expr {
            Cron::from_str(expr)
                .map_err(|e| PayoutError::InvalidRequest(format!("bad cron expression: {}", e)))?;
        }
        Ok(self.service.db().create_batch(
            name,
            batch_type,
            cron_expr,
            scheduled_at,
            connector_id,
            rail,
        )?)
    }

    pub fn add_payout(&self, batch_id: &str, payout_id: &str) -> PayoutResult<()> {
        // Make sure both sides exist before wiring them together.
        self.service.get(payout_id)?;
        self.service
            .db()
            .get_batch(batch_id)?
            .ok_or_else(|| PayoutError::BatchNotFound(batch_id.to_string()))?;
        self.service
            .db()
            .add_batch_item(batch_id, payout_id)
            .map_err(|e| PayoutError::BatchState(e.to_string()))?;
        Ok(())
    }

    /// Atomic `collecting` -> `locked`; a locked batch accepts no new items.
    pub fn lock_batch(&self, batch_id: &str) -> PayoutResult<Batch> {
        let locked = self.service.db().lock_batch(batch_id)?;
        if !locked {
            let batch = self
                .service
                .db()
                .get_batch(batch_id)?
                .ok_or_else(|| PayoutError::BatchNotFound(batch_id.to_string()))?;
            return Err(PayoutError::BatchState(format!(
                "batch {} is {}, expected collecting",
                batch_id,
                batch.status.as_str()
            )));
        }
        Ok(self
            .service
            .db()
            .get_batch(batch_id)?
            .ok_or_else(|| PayoutError::BatchNotFound(batch_id.to_string()))?)
    }

    /// Drain a locked batch in sequence order. Per-item status mirrors the
    /// payout outcome; counters are refreshed at the end.
    pub async fn process_batch(&self, batch_id: &str) -> PayoutResult<Batch> {
        let batch = self
            .service
            .db()
            .get_batch(batch_id)?
            .ok_or_else(|| PayoutError::BatchNotFound(batch_id.to_string()))?;
        if batch.status != BatchStatus::Locked {
            return Err(PayoutError::BatchState(format!(
                "batch {} is {}, expected locked",
                batch_id,
                batch.status.as_str()
            )));
        }
        if !self
            .service
            .db()
            .set_batch_status(batch_id, BatchStatus::Locked, BatchStatus::Processing)?
        {
            return Err(PayoutError::BatchState(format!(
                "batch {} was claimed by another processor",
                batch_id
            )));
        }

        info!("📦 Processing batch {} ({})", batch.name, batch_id);
        let items = self.service.db().batch_items(batch_id)?;
        let mut failures = 0usize;

        for item in &items {
            let payout = match self.service.get(&item.payout_id) {
                Ok(p) => p,
                Err(e) => {
                    warn!("batch item {}#{} unreadable: {}", batch_id, item.seq, e);
                    failures += 1;
                    continue;
                }
            };
            let outcome = dispatch_payout(&self.service, &self.connectors, &payout).await;
            if outcome.error_code().is_some() {
                failures += 1;
            }
            self.service.db().update_batch_item(
                batch_id,
                item.seq,
                outcome.payout_status(),
                outcome.error_code(),
            )?;
        }

        self.service.db().refresh_batch_counters(batch_id)?;
        let done = if failures == items.len() && !items.is_empty() {
            BatchStatus::Failed
        } else {
            BatchStatus::Completed
        };
        self.service
            .db()
            .set_batch_status(batch_id, BatchStatus::Processing, done)?;

        if done == BatchStatus::Failed {
            self.service.db().insert_alert(
                None,
                Some(batch_id),
                AlertKind::BatchFailed,
                AlertSeverity::High,
                &format!("batch {} failed on every item", batch.name),
                None,
            )?;
        }

        // Recurring batches queue up their next run.
        if let Some(expr) = batch.cron_expr.as_deref() {
            match next_occurrence(expr, Utc::now()) {
                Some(next) => {
                    self.service
                        .db()
                        .reschedule_batch(batch_id, next.timestamp())?;
                    info!("📅 Batch {} rescheduled for {}", batch.name, next);
                }
                None => warn!(
                    "batch {} has unparseable cron '{}', not rescheduling",
                    batch_id, expr
                ),
            }
        }

        Ok(self
            .service
            .db()
            .get_batch(batch_id)?
            .ok_or_else(|| PayoutError::BatchNotFound(batch_id.to_string()))?)
    }

    /// Run every locked batch whose schedule is due.
    pub async fn tick(&self) -> PayoutResult<usize> {
        let due = self.service.db().due_locked_batches(now_ts())?;
        let count = due.len();
        for batch in due {
            if let Err(e) = self.process_batch(&batch.id).await {
                warn!("batch {} processing failed: {}", batch.id, e);
            }
        }
        Ok(count)
    }
}

fn next_occurrence(cron_expr: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Cron::from_str(cron_expr)
        .ok()?
        .find_next_occurrence(&after, false)
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_occurrence_advances() {
        let after = Utc::now();
        let next = next_occurrence("0 2 * * *", after).unwrap();
        assert!(next > after);
        // Daily schedule never jumps more than a day ahead.
        assert!(next - after <= chrono::Duration::days(1));
    }

    #[test]
    fn bad_cron_yields_none() {
        assert!(next_occurrence("not a cron", Utc::now()).is_none());
    }
}
