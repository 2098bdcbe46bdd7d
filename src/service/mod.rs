//! Payout service: the only writer of payout and hold state.
//!
//! Intake, the status-transition API the worker drives, retry scheduling,
//! cancellation, settlement confirmations and the read surface all live
//! here. Everything else (worker, batch processor, HTTP adapter) calls in.

use crate::config::Config;
use crate::connectors::PROCESSING_ERROR;
use crate::error::{PayoutError, PayoutResult};
use crate::idempotency::IdempotencyCache;
use crate::ledger::{HoldManager, LedgerError};
use crate::models::{
    is_supported_currency, to_amount, ActorType, Alert, AlertKind, AlertSeverity, AuditEvent,
    ComplianceStatus, CreatePayoutRequest, Payout, PayoutFilter, PayoutHold, PayoutStats,
    PayoutStatus, RetryLogEntry,
};
use crate::routing::{RoutingAdvisor, RoutingFeatures};
use crate::sla::{SlaEngine, SlaScope};
use crate::store::{now_ts, CreateOutcome, HoldAction, PayoutDb, TransitionOpts};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Cap on exponential retry backoff.
const MAX_BACKOFF_SECS: i64 = 3600;

pub struct PayoutService {
    db: PayoutDb,
    holds: HoldManager,
    sla: SlaEngine,
    idempotency: IdempotencyCache,
    routing: Arc<dyn RoutingAdvisor>,
    config: Config,
}

impl PayoutService {
    pub fn new(
        db: PayoutDb,
        holds: HoldManager,
        sla: SlaEngine,
        idempotency: IdempotencyCache,
        routing: Arc<dyn RoutingAdvisor>,
        config: Config,
    ) -> Self {
        Self {
            db,
            holds,
            sla,
            idempotency,
            routing,
            config,
        }
    }

    pub fn db(&self) -> &PayoutDb {
        &self.db
    }

    pub fn holds(&self) -> &HoldManager {
        &self.holds
    }

    // ------------------------------------------------------------------
    // Intake
    // ------------------------------------------------------------------

    pub async fn create_payout(&self, request: &CreatePayoutRequest) -> PayoutResult<Payout> {
        // Idempotent replay fast path.
        if let Some(key) = request.idempotency_key.as_deref() {
            if let Some(existing) = self.find_by_key(key)? {
                return self.replay(existing, request);
            }
        }

        self.validate(request)?;
        let now = now_ts();
        let amount_cents = to_amount(request.amount);

        // Routing advisor is consulted but never trusted to block intake.
        let features = RoutingFeatures {
            amount_cents,
            currency: &request.currency,
            method: request.method,
            priority: request.priority,
            country: request.country.as_deref(),
            tenant_id: &request.tenant_id,
            requested_connector: request.connector_id.as_deref(),
            requested_rail: request.rail,
        };
        let recommendation = self.routing.predict(&features).await;

        let (connector_id, rail) = match &recommendation {
            Some(rec) => (Some(rec.connector_id.clone()), rec.rail),
            None => (
                request.connector_id.clone(),
                request.rail.unwrap_or_else(|| request.method.default_rail()),
            ),
        };

        let scope = SlaScope {
            connector_id: connector_id.as_deref(),
            rail: Some(rail),
            country: request.country.as_deref(),
            currency: &request.currency,
            priority: request.priority,
        };
        let rule = self.sla.resolve_rule(&scope)?;
        let fee_cents = self.sla.fee(rule.as_ref(), amount_cents)?;
        let total_cost_cents = amount_cents + fee_cents;
        let created_at = Utc::now();
        let target_date =
            self.sla
                .target_settlement_date(rule.as_ref(), created_at, request.country.as_deref());

        let status = match request.scheduled_at {
            Some(at) if at > now => PayoutStatus::Scheduled,
            _ => PayoutStatus::Pending,
        };

        let mut payout = Payout {
            id: Uuid::new_v4().to_string(),
            external_id: request.idempotency_key.clone(),
            origin_module: request.origin_module.clone(),
            origin_entity_type: request.origin_entity_type.clone(),
            origin_entity_id: request.origin_entity_id.clone(),
            beneficiary_type: request.beneficiary_type.clone(),
            beneficiary_id: request.beneficiary_id.clone(),
            beneficiary_account: request.beneficiary_account.clone(),
            amount_cents,
            fee_cents,
            bank_fee_cents: 0,
            total_cost_cents,
            currency: request.currency.clone(),
            method: request.method,
            priority: request.priority,
            requested_settlement_date: request.requested_settlement_date,
            scheduled_at: request.scheduled_at,
            connector_id,
            rail: Some(rail),
            bank_reference: None,
            status,
            retry_count: 0,
            max_retries: self.config.max_retries,
            next_retry_at: None,
            last_error: None,
            last_error_code: None,
            sla_target_settlement_date: Some(target_date),
            sla_cutoff_time: rule.as_ref().and_then(|r| r.cutoff_time.clone()),
            sla_violated: false,
            sla_violation_reason: None,
            routing_score: recommendation.as_ref().map(|r| r.score),
            routing_reason: recommendation
                .as_ref()
                .and_then(|r| r.explanation.clone()),
            routing_predicted_hours: recommendation
                .as_ref()
                .and_then(|r| r.estimated_settlement_hours),
            tenant_type: request.tenant_type.clone(),
            tenant_id: request.tenant_id.clone(),
            country: request.country.clone(),
            compliance_status: ComplianceStatus::Clear,
            hold_id: None,
            ledger_entry_id: None,
            reconciliation_id: None,
            metadata: request.metadata.as_ref().map(|m| m.to_string()),
            created_by: request.created_by.clone(),
            approved_by: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
            sent_at: None,
            settled_at: None,
            failed_at: None,
            reversed_at: None,
            cancelled_at: None,
        };

        // Balance check before any side effect.
        let available = self
            .holds
            .ledger()
            .available_balance(&payout.tenant_balance_account(), &payout.currency)
            .await
            .map_err(|e| PayoutError::Ledger(e.to_string()))?;
        if available < total_cost_cents {
            return Err(PayoutError::InsufficientBalance {
                required_cents: total_cost_cents,
                available_cents: available,
            });
        }

        // Hold intent against the ledger, then payout + hold + audit in one
        // durable transaction.
        let hold = self.holds.open_hold(&payout, now).await.map_err(|e| match e {
            LedgerError::InsufficientFunds {
                required,
                available,
            } => PayoutError::InsufficientBalance {
                required_cents: required,
                available_cents: available,
            },
            other => PayoutError::Ledger(other.to_string()),
        })?;
        payout.hold_id = Some(hold.id.clone());

        match self.db.create_payout_with_hold(&payout, &hold)? {
            CreateOutcome::Created => {}
            CreateOutcome::DuplicateExternalId => {
                // Lost the insert race to a concurrent request with the same
                // key: undo our ledger hold and serve the winner's row.
                self.holds
                    .ledger_reverse(hold.ledger_entry_id.as_deref(), "duplicate_idempotency_key")
                    .await;
                let key = request.idempotency_key.as_deref().unwrap_or_default();
                let existing = self
                    .db
                    .get_payout_by_external_id(key)?
                    .ok_or_else(|| PayoutError::NotFound(key.to_string()))?;
                return self.replay(existing, request);
            }
        }

        if let Some(key) = request.idempotency_key.as_deref() {
            self.idempotency.remember(key, &payout.id);
        }

        if payout.amount_cents >= self.config.high_value_threshold_cents {
            self.db.insert_alert(
                Some(&payout.id),
                None,
                AlertKind::HighValue,
                AlertSeverity::High,
                &format!(
                    "high value payout of {} {} created",
                    crate::models::from_amount(payout.amount_cents),
                    payout.currency
                ),
                Some(&serde_json::json!({"amount_cents": payout.amount_cents})),
            )?;
        }

        info!(
            "💸 Payout {} created: {} {} ({}) for tenant {}",
            payout.id,
            crate::models::from_amount(payout.amount_cents),
            payout.currency,
            payout.status.as_str(),
            payout.tenant_id
        );
        Ok(payout)
    }

    fn validate(&self, request: &CreatePayoutRequest) -> PayoutResult<()> {
        if !(request.amount.is_finite() && request.amount > 0.0) {
            return Err(PayoutError::InvalidRequest(
                "amount must be positive".to_string(),
            ));
        }
        if to_amount(request.amount) <= 0 {
            return Err(PayoutError::InvalidRequest(
                "amount below smallest representable unit".to_string(),
            ));
        }
        if !is_supported_currency(&request.currency) {
            return Err(PayoutError::InvalidRequest(format!(
                "unknown currency {}",
                request.currency
            )));
        }
        if request.beneficiary_type.trim().is_empty() || request.beneficiary_id.trim().is_empty() {
            return Err(PayoutError::InvalidRequest(
                "beneficiary type and id are required".to_string(),
            ));
        }
        if request.tenant_type.trim().is_empty() || request.tenant_id.trim().is_empty() {
            return Err(PayoutError::NotAuthorized);
        }
        Ok(())
    }

    fn find_by_key(&self, key: &str) -> PayoutResult<Option<Payout>> {
        if let Some(id) = self.idempotency.lookup(key) {
            if let Some(p) = self.db.get_payout(&id)? {
                return Ok(Some(p));
            }
        }
        // Durable fallback; repopulate the cache on a hit.
        let existing = self.db.get_payout_by_external_id(key)?;
        if let Some(p) = &existing {
            self.idempotency.remember(key, &p.id);
        }
        Ok(existing)
    }

    /// Replay policy: return the original unchanged. Strict mode rejects a
    /// replay whose economic payload differs.
    fn replay(&self, existing: Payout, request: &CreatePayoutRequest) -> PayoutResult<Payout> {
        if self.config.idempotency_strict {
            let same_payload = existing.amount_cents == to_amount(request.amount)
                && existing.currency == request.currency
                && existing.beneficiary_id == request.beneficiary_id
                && existing.method == request.method;
            if !same_payload {
                return Err(PayoutError::DuplicateKeyCollision);
            }
        }
        Ok(existing)
    }

    // ------------------------------------------------------------------
    // Status transitions
    // ------------------------------------------------------------------

    /// The transition DAG. `on_hold` is the compliance/balance side band.
    pub fn valid_transition(from: PayoutStatus, to: PayoutStatus) -> bool {
        use PayoutStatus::*;
        matches!(
            (from, to),
            (Pending, Processing)
                | (Processing, Sent)
                | (Sent, Settled)
                | (Scheduled, Pending)
                | (Scheduled, Processing)
                | (Pending | Scheduled | Processing | Sent, Failed)
                | (Failed, Pending)
                | (Failed, Dlq)
                | (Pending | Scheduled, Cancelled)
                | (Pending | Scheduled | Processing, OnHold)
                | (OnHold, Pending)
        ) || (to == Reversed && !from.is_terminal())
    }

    fn hold_action_for(to: PayoutStatus) -> Option<HoldAction> {
        match to {
            PayoutStatus::Settled => Some(HoldAction::Release),
            PayoutStatus::Dlq | PayoutStatus::Reversed | PayoutStatus::Cancelled => {
                Some(HoldAction::Reverse)
            }
            _ => None,
        }
    }

    /// Validated transition with hold handling, audit and the post-commit
    /// ledger call. All worker and ops state changes funnel through here.
    pub async fn update_status(
        &self,
        payout_id: &str,
        to: PayoutStatus,
        mut opts: TransitionOpts,
    ) -> PayoutResult<Payout> {
        let payout = self
            .db
            .get_payout(payout_id)?
            .ok_or_else(|| PayoutError::NotFound(payout_id.to_string()))?;
        let from = payout.status;

        if from == to {
            return Ok(payout); // idempotent no-op
        }
        if !Self::valid_transition(from, to) {
            return Err(PayoutError::InvalidTransition { from, to });
        }

        if opts.hold_action.is_none() {
            opts.hold_action = Self::hold_action_for(to);
        }

        let (updated, hold_entry) = self.db.apply_status_transition(payout_id, from, to, &opts)?;

        match to {
            PayoutStatus::Settled => {
                self.holds.ledger_release(hold_entry.as_deref()).await;
                // Final posting moves the funds out of the pending account.
                match self
                    .holds
                    .ledger()
                    .final_post(
                        &updated.id,
                        crate::ledger::PENDING_PAYOUTS_ACCOUNT,
                        &format!("beneficiary:{}", updated.beneficiary_id),
                        updated.total_cost_cents,
                        &updated.currency,
                    )
                    .await
                {
                    Ok(entry_id) => self.db.set_final_ledger_entry(&updated.id, &entry_id)?,
                    Err(e) => warn!("final posting for {} failed: {}", updated.id, e),
                }
            }
            PayoutStatus::Dlq | PayoutStatus::Reversed | PayoutStatus::Cancelled => {
                self.holds
                    .ledger_reverse(hold_entry.as_deref(), to.as_str())
                    .await;
            }
            _ => {}
        }

        Ok(self.db.get_payout(payout_id)?.unwrap_or(updated))
    }

    // ------------------------------------------------------------------
    // Worker-facing transitions
    // ------------------------------------------------------------------

    pub async fn mark_sent(
        &self,
        payout_id: &str,
        bank_reference: &str,
        bank_fee_cents: Option<i64>,
    ) -> PayoutResult<Payout> {
        self.update_status(
            payout_id,
            PayoutStatus::Sent,
            TransitionOpts {
                bank_reference: Some(bank_reference.to_string()),
                bank_fee_cents,
                ..Default::default()
            },
        )
        .await
    }

    pub async fn settle(&self, payout_id: &str) -> PayoutResult<Payout> {
        self.update_status(payout_id, PayoutStatus::Settled, TransitionOpts::default())
            .await
    }

    pub async fn mark_failed(
        &self,
        payout_id: &str,
        error_code: &str,
        error_message: &str,
    ) -> PayoutResult<Payout> {
        self.update_status(
            payout_id,
            PayoutStatus::Failed,
            TransitionOpts {
                error_code: Some(error_code.to_string()),
                error_message: Some(error_message.to_string()),
                ..Default::default()
            },
        )
        .await
    }

    /// Permanent connector failure: straight to the dead-letter state with
    /// a critical alert; retry counters are left untouched.
    pub async fn force_dlq(
        &self,
        payout_id: &str,
        error_code: &str,
        error_message: &str,
    ) -> PayoutResult<Payout> {
        let updated = self
            .update_status(
                payout_id,
                PayoutStatus::Dlq,
                TransitionOpts {
                    error_code: Some(error_code.to_string()),
                    error_message: Some(error_message.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        self.db.insert_alert(
            Some(payout_id),
            None,
            AlertKind::PermanentFailure,
            AlertSeverity::Critical,
            &format!("payout {} permanently rejected: {}", payout_id, error_code),
            Some(&serde_json::json!({"error_code": error_code, "error_message": error_message})),
        )?;
        Ok(updated)
    }

    /// Bounded-backoff retry scheduling. Exhaustion dead-letters the payout,
    /// reverses its hold and raises a critical alert.
    pub async fn schedule_retry(&self, payout_id: &str) -> PayoutResult<Payout> {
        let payout = self
            .db
            .get_payout(payout_id)?
            .ok_or_else(|| PayoutError::NotFound(payout_id.to_string()))?;

        if payout.status == PayoutStatus::Dlq {
            return Ok(payout); // monotone: once dead-lettered, stays
        }
        if payout.retry_count >= payout.max_retries {
            return self.dead_letter(&payout).await;
        }

        let new_count = payout.retry_count + 1;
        if new_count >= payout.max_retries {
            self.db.record_retry_exhausted(
                payout_id,
                new_count,
                payout.last_error_code.as_deref(),
                payout.last_error.as_deref(),
            )?;
            return self.dead_letter(&payout).await;
        }

        let backoff = (self.config.retry_base_delay_secs << (new_count - 1)).min(MAX_BACKOFF_SECS);
        let next_retry_at = now_ts() + backoff;
        let updated = self.db.record_retry_scheduled(
            payout_id,
            new_count,
            next_retry_at,
            backoff,
            payout.last_error_code.as_deref(),
            payout.last_error.as_deref(),
        )?;
        info!(
            "🔁 Payout {} retry {} scheduled in {}s",
            payout_id, new_count, backoff
        );
        Ok(updated)
    }

    async fn dead_letter(&self, payout: &Payout) -> PayoutResult<Payout> {
        let updated = self
            .update_status(&payout.id, PayoutStatus::Dlq, TransitionOpts::default())
            .await?;
        self.db.insert_alert(
            Some(&payout.id),
            None,
            AlertKind::Dlq,
            AlertSeverity::Critical,
            &format!(
                "payout {} dead-lettered after {} attempts",
                payout.id, updated.retry_count
            ),
            Some(&serde_json::json!({
                "retry_count": updated.retry_count,
                "last_error_code": updated.last_error_code,
            })),
        )?;
        warn!("☠️ Payout {} moved to DLQ", payout.id);
        Ok(updated)
    }

    // ------------------------------------------------------------------
    // Ops surface
    // ------------------------------------------------------------------

    pub async fn cancel(
        &self,
        payout_id: &str,
        reason: &str,
        actor: Option<&str>,
    ) -> PayoutResult<Payout> {
        let payout = self
            .db
            .get_payout(payout_id)?
            .ok_or_else(|| PayoutError::NotFound(payout_id.to_string()))?;
        if !matches!(
            payout.status,
            PayoutStatus::Pending | PayoutStatus::Scheduled
        ) {
            return Err(PayoutError::NotCancellable(payout.status));
        }
        self.update_status(
            payout_id,
            PayoutStatus::Cancelled,
            TransitionOpts {
                details: Some(serde_json::json!({"reason": reason})),
                actor_type: Some(ActorType::User),
                actor_id: actor.map(str::to_string),
                ..Default::default()
            },
        )
        .await
    }

    /// Manual ops retry. A `failed` payout re-enters the queue directly; a
    /// dead-lettered one needs a fresh hold since its old one was reversed.
    pub async fn retry(&self, payout_id: &str, actor: Option<&str>) -> PayoutResult<Payout> {
        let payout = self
            .db
            .get_payout(payout_id)?
            .ok_or_else(|| PayoutError::NotFound(payout_id.to_string()))?;

        match payout.status {
            PayoutStatus::Failed => {
                self.update_status(
                    payout_id,
                    PayoutStatus::Pending,
                    TransitionOpts {
                        details: Some(serde_json::json!({"reason": "manual_retry"})),
                        actor_type: Some(ActorType::User),
                        actor_id: actor.map(str::to_string),
                        clear_next_retry: true,
                        ..Default::default()
                    },
                )
                .await
            }
            PayoutStatus::Dlq => {
                let now = now_ts();
                let hold = self
                    .holds
                    .open_hold(&payout, now)
                    .await
                    .map_err(|e| match e {
                        LedgerError::InsufficientFunds {
                            required,
                            available,
                        } => PayoutError::InsufficientBalance {
                            required_cents: required,
                            available_cents: available,
                        },
                        other => PayoutError::Ledger(other.to_string()),
                    })?;
                Ok(self.db.resurrect_from_dlq(payout_id, &hold)?)
            }
            other => Err(PayoutError::NotRetryable(other)),
        }
    }

    /// Bank-originated settlement confirmation, matched on bank reference.
    pub async fn confirm_settlement(
        &self,
        bank_reference: &str,
        success: bool,
        details: Option<serde_json::Value>,
    ) -> PayoutResult<Payout> {
        let payout = self
            .db
            .get_payout_by_bank_reference(bank_reference)?
            .ok_or_else(|| PayoutError::NotFound(bank_reference.to_string()))?;

        if payout.status == PayoutStatus::Settled {
            return Ok(payout); // duplicate confirmation
        }

        if success {
            self.update_status(
                &payout.id,
                PayoutStatus::Settled,
                TransitionOpts {
                    details,
                    ..Default::default()
                },
            )
            .await
        } else {
            // The bank says funds did not move. Park it for ops rather than
            // resubmitting money that may be in flight.
            let updated = self
                .update_status(
                    &payout.id,
                    PayoutStatus::Failed,
                    TransitionOpts {
                        details,
                        error_code: Some("SETTLEMENT_FAILED".to_string()),
                        error_message: Some("bank reported settlement failure".to_string()),
                        clear_next_retry: true,
                        ..Default::default()
                    },
                )
                .await?;
            self.db.insert_alert(
                Some(&payout.id),
                None,
                AlertKind::PermanentFailure,
                AlertSeverity::Critical,
                &format!(
                    "settlement failure reported for payout {} ({})",
                    payout.id, bank_reference
                ),
                None,
            )?;
            Ok(updated)
        }
    }

    /// Park a payout on the compliance/balance side band. The hold stays
    /// active; the row simply leaves the dispatch queue until cleared.
    pub async fn place_on_hold(&self, payout_id: &str, reason: &str) -> PayoutResult<Payout> {
        self.update_status(
            payout_id,
            PayoutStatus::OnHold,
            TransitionOpts {
                details: Some(serde_json::json!({"reason": reason})),
                ..Default::default()
            },
        )
        .await
    }

    /// Clear the compliance side band once review passes.
    pub async fn release_compliance_hold(&self, payout_id: &str) -> PayoutResult<Payout> {
        self.update_status(
            payout_id,
            PayoutStatus::Pending,
            TransitionOpts {
                details: Some(serde_json::json!({"reason": "compliance_cleared"})),
                ..Default::default()
            },
        )
        .await
    }

    // ------------------------------------------------------------------
    // Worker claims and sweeps (delegated to the store)
    // ------------------------------------------------------------------

    pub fn lease_for_dispatch(
        &self,
        limit: usize,
        priority_enabled: bool,
    ) -> PayoutResult<Vec<Payout>> {
        Ok(self.db.lease_ready(limit, priority_enabled, now_ts())?)
    }

    pub fn lease_due_retries(&self, limit: usize) -> PayoutResult<Vec<Payout>> {
        Ok(self.db.lease_due_retries(limit, now_ts())?)
    }

    pub fn rescue_stale_processing(&self, threshold_secs: i64) -> PayoutResult<Vec<String>> {
        Ok(self.db.rescue_stale_processing(threshold_secs, now_ts())?)
    }

    /// SLA monitor pass: flag overdue payouts and raise one high alert each.
    pub fn sweep_sla_violations(&self) -> PayoutResult<usize> {
        let flagged = self.db.flag_sla_violations(Utc::now().date_naive())?;
        for payout in &flagged {
            self.db.insert_alert(
                Some(&payout.id),
                None,
                AlertKind::SlaViolation,
                AlertSeverity::High,
                &format!(
                    "payout {} missed its target settlement date {}",
                    payout.id,
                    payout
                        .sla_target_settlement_date
                        .map(|d| d.to_string())
                        .unwrap_or_default()
                ),
                Some(&serde_json::json!({"reason": "target_date_missed"})),
            )?;
            warn!(
                "⚠️ SLA violation on payout {} (target {:?})",
                payout.id, payout.sla_target_settlement_date
            );
        }
        Ok(flagged.len())
    }

    /// Hold-expiry sweep: expire stale holds and alert on each.
    pub async fn sweep_expired_holds(&self) -> PayoutResult<usize> {
        let expired = self.holds.sweep_expired(now_ts()).await?;
        for (hold, payout) in &expired {
            self.db.insert_alert(
                Some(&payout.id),
                None,
                AlertKind::HoldExpired,
                AlertSeverity::Medium,
                &format!("hold {} expired before payout {} went out", hold.id, payout.id),
                None,
            )?;
        }
        Ok(expired.len())
    }

    pub fn prune_idempotency_cache(&self) -> usize {
        self.idempotency.prune()
    }

    // ------------------------------------------------------------------
    // Read surface
    // ------------------------------------------------------------------

    pub fn get(&self, payout_id: &str) -> PayoutResult<Payout> {
        self.db
            .get_payout(payout_id)?
            .ok_or_else(|| PayoutError::NotFound(payout_id.to_string()))
    }

    pub fn get_by_idempotency_key(&self, key: &str) -> PayoutResult<Payout> {
        self.find_by_key(key)?
            .ok_or_else(|| PayoutError::NotFound(key.to_string()))
    }

    pub fn list(
        &self,
        filter: &PayoutFilter,
        limit: usize,
        offset: usize,
    ) -> PayoutResult<(Vec<Payout>, u64)> {
        Ok(self.db.list_payouts(filter, limit.clamp(1, 500), offset)?)
    }

    pub fn stats(&self, tenant_id: &str) -> PayoutResult<PayoutStats> {
        Ok(self.db.payout_stats(tenant_id)?)
    }

    pub fn audit_trail(&self, payout_id: &str) -> PayoutResult<Vec<AuditEvent>> {
        Ok(self.db.audit_trail(payout_id)?)
    }

    pub fn retry_log(&self, payout_id: &str) -> PayoutResult<Vec<RetryLogEntry>> {
        Ok(self.db.retry_log(payout_id)?)
    }

    pub fn get_hold(&self, payout_id: &str) -> PayoutResult<Option<PayoutHold>> {
        Ok(self.db.get_hold_for_payout(payout_id)?)
    }

    pub fn list_alerts(&self, resolved: Option<bool>, limit: usize) -> PayoutResult<Vec<Alert>> {
        Ok(self.db.list_alerts(resolved, limit.clamp(1, 500))?)
    }

    pub fn resolve_alert(
        &self,
        alert_id: &str,
        note: Option<&str>,
        actor: Option<&str>,
    ) -> PayoutResult<Alert> {
        match self.db.resolve_alert(alert_id, note, actor)? {
            None => Err(PayoutError::AlertNotFound(alert_id.to_string())),
            Some((_, false)) => Err(PayoutError::AlreadyResolved),
            Some((alert, true)) => Ok(alert),
        }
    }
}

// Re-exported for worker error classification.
pub use crate::connectors::is_permanent_code;

/// Error code recorded when the dispatch path itself blew up.
pub const PROCESSING_ERROR_CODE: &str = PROCESSING_ERROR;

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ledger::{InMemoryLedger, LedgerClient};
    use crate::models::{HoldStatus, PayoutMethod, PayoutPriority, PaymentRail};
    use crate::routing::NoopRoutingAdvisor;
    use crate::sla::{SlaEngine, WeekdayCalendar};
    use std::time::Duration;

    pub(crate) const TENANT_ACCOUNT: &str = "merchant:t1:available_balance";

    pub(crate) fn test_service(
        balance_cents: i64,
        config: Config,
    ) -> (Arc<PayoutService>, Arc<InMemoryLedger>) {
        let db = PayoutDb::open_in_memory().unwrap();
        db.seed_default_sla_rules().unwrap();
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.deposit(TENANT_ACCOUNT, "USD", balance_cents);

        let holds = HoldManager::new(
            db.clone(),
            Arc::clone(&ledger) as Arc<dyn LedgerClient>,
            config.hold_ttl_secs,
        );
        let sla = SlaEngine::new(db.clone(), Arc::new(WeekdayCalendar));
        let idempotency = IdempotencyCache::new(Duration::from_secs(config.idempotency_ttl_secs));
        let service = Arc::new(PayoutService::new(
            db,
            holds,
            sla,
            idempotency,
            Arc::new(NoopRoutingAdvisor),
            config,
        ));
        (service, ledger)
    }

    pub(crate) fn ach_request(amount: f64, key: Option<&str>) -> CreatePayoutRequest {
        CreatePayoutRequest {
            idempotency_key: key.map(str::to_string),
            origin_module: Some("settlements".to_string()),
            origin_entity_type: None,
            origin_entity_id: None,
            beneficiary_type: "vendor".to_string(),
            beneficiary_id: "ben-1".to_string(),
            beneficiary_account: Some("acct-001".to_string()),
            amount,
            currency: "USD".to_string(),
            method: PayoutMethod::BankTransfer,
            priority: PayoutPriority::Standard,
            requested_settlement_date: None,
            scheduled_at: None,
            connector_id: None,
            rail: Some(PaymentRail::Ach),
            tenant_type: "merchant".to_string(),
            tenant_id: "t1".to_string(),
            country: Some("US".to_string()),
            metadata: None,
            created_by: Some("ops@example.com".to_string()),
        }
    }

    #[tokio::test]
    async fn create_reserves_full_cost_and_audits() {
        let (service, ledger) = test_service(1_000_000, Config::default());
        let payout = service.create_payout(&ach_request(1000.0, None)).await.unwrap();

        assert_eq!(payout.status, PayoutStatus::Pending);
        assert_eq!(payout.amount_cents, 100_000);
        // ACH default rule: $0.25 base + 10 bps = $1.25.
        assert_eq!(payout.fee_cents, 125);
        assert_eq!(payout.total_cost_cents, 100_125);
        assert_eq!(
            payout.total_cost_cents,
            payout.amount_cents + payout.fee_cents + payout.bank_fee_cents
        );
        assert!(payout.sla_target_settlement_date.is_some());

        let hold = service.get_hold(&payout.id).unwrap().unwrap();
        assert_eq!(hold.status, HoldStatus::Active);
        assert_eq!(hold.amount_cents, payout.total_cost_cents);
        assert_eq!(hold.currency, payout.currency);
        assert_eq!(ledger.balance(TENANT_ACCOUNT, "USD"), 1_000_000 - 100_125);

        let trail = service.audit_trail(&payout.id).unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].event_type, "created");
    }

    #[tokio::test]
    async fn idempotent_replay_returns_original_once() {
        let (service, _ledger) = test_service(1_000_000, Config::default());
        let first = service
            .create_payout(&ach_request(100.0, Some("K2")))
            .await
            .unwrap();
        let second = service
            .create_payout(&ach_request(100.0, Some("K2")))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(service.db().payout_count().unwrap(), 1);
        assert_eq!(service.db().active_hold_count().unwrap(), 1);
        assert_eq!(service.audit_trail(&first.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn strict_mode_rejects_diverging_replay() {
        let config = Config {
            idempotency_strict: true,
            ..Config::default()
        };
        let (service, _ledger) = test_service(1_000_000, config);
        service
            .create_payout(&ach_request(100.0, Some("K3")))
            .await
            .unwrap();

        let err = service
            .create_payout(&ach_request(250.0, Some("K3")))
            .await
            .unwrap_err();
        assert!(matches!(err, PayoutError::DuplicateKeyCollision));
    }

    #[tokio::test]
    async fn insufficient_balance_aborts_creation() {
        let (service, _ledger) = test_service(5_000, Config::default());
        let err = service
            .create_payout(&ach_request(1000.0, None))
            .await
            .unwrap_err();
        assert!(matches!(err, PayoutError::InsufficientBalance { .. }));
        assert_eq!(service.db().payout_count().unwrap(), 0);
        assert_eq!(service.db().active_hold_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn rejects_unknown_currency_and_bad_amounts() {
        let (service, _ledger) = test_service(1_000_000, Config::default());

        let mut bad_currency = ach_request(10.0, None);
        bad_currency.currency = "ZZZ".to_string();
        assert!(matches!(
            service.create_payout(&bad_currency).await.unwrap_err(),
            PayoutError::InvalidRequest(_)
        ));

        let mut negative = ach_request(-5.0, None);
        negative.currency = "USD".to_string();
        assert!(matches!(
            service.create_payout(&negative).await.unwrap_err(),
            PayoutError::InvalidRequest(_)
        ));
    }

    #[tokio::test]
    async fn future_schedule_creates_scheduled_payout() {
        let (service, _ledger) = test_service(1_000_000, Config::default());
        let mut request = ach_request(50.0, None);
        request.scheduled_at = Some(now_ts() + 3600);

        let payout = service.create_payout(&request).await.unwrap();
        assert_eq!(payout.status, PayoutStatus::Scheduled);

        // Not leased while its schedule is in the future.
        let leased = service.lease_for_dispatch(10, true).unwrap();
        assert!(leased.is_empty());
    }

    #[tokio::test]
    async fn cancel_reverses_hold_and_refunds() {
        let (service, ledger) = test_service(1_000_000, Config::default());
        let payout = service.create_payout(&ach_request(100.0, None)).await.unwrap();
        let reserved = ledger.balance(TENANT_ACCOUNT, "USD");

        let cancelled = service
            .cancel(&payout.id, "duplicate request", Some("ops"))
            .await
            .unwrap();
        assert_eq!(cancelled.status, PayoutStatus::Cancelled);

        let hold = service.get_hold(&payout.id).unwrap().unwrap();
        assert_eq!(hold.status, HoldStatus::Reversed);
        assert!(ledger.balance(TENANT_ACCOUNT, "USD") > reserved);

        // Terminal: cancelling again is rejected.
        let err = service.cancel(&payout.id, "again", None).await.unwrap_err();
        assert!(matches!(err, PayoutError::NotCancellable(_)));
    }

    #[tokio::test]
    async fn transition_dag_is_enforced() {
        let (service, _ledger) = test_service(1_000_000, Config::default());
        let payout = service.create_payout(&ach_request(10.0, None)).await.unwrap();

        // pending -> settled skips sent and is rejected.
        let err = service
            .update_status(&payout.id, PayoutStatus::Settled, Default::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PayoutError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn retry_schedule_backs_off_and_dead_letters() {
        let (service, _ledger) = test_service(1_000_000, Config::default());
        let payout = service.create_payout(&ach_request(10.0, None)).await.unwrap();

        // First failure.
        let leased = service.lease_for_dispatch(1, true).unwrap();
        assert_eq!(leased.len(), 1);
        service
            .mark_failed(&payout.id, "TRANSIENT_TIMEOUT", "gateway timeout")
            .await
            .unwrap();

        let after_first = service.schedule_retry(&payout.id).await.unwrap();
        assert_eq!(after_first.retry_count, 1);
        assert_eq!(after_first.status, PayoutStatus::Failed);
        let next = after_first.next_retry_at.unwrap();
        let delta = next - now_ts();
        assert!((55..=65).contains(&delta), "first backoff ≈ 60s, got {}", delta);

        // Second failure doubles the backoff.
        let after_second = service.schedule_retry(&payout.id).await.unwrap();
        assert_eq!(after_second.retry_count, 2);
        assert!(after_second.next_retry_at.unwrap() >= next);

        // Third failure exhausts max_retries = 3.
        let after_third = service.schedule_retry(&payout.id).await.unwrap();
        assert_eq!(after_third.status, PayoutStatus::Dlq);
        assert_eq!(after_third.retry_count, after_third.max_retries);

        let log = service.retry_log(&payout.id).unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[2].outcome, "dlq");

        let hold = service.get_hold(&payout.id).unwrap().unwrap();
        assert_eq!(hold.status, HoldStatus::Reversed);

        let alerts = service.list_alerts(Some(false), 10).unwrap();
        assert!(alerts.iter().any(|a| a.kind == AlertKind::Dlq));

        // Monotone: once dead-lettered, scheduling again is a no-op.
        let still_dlq = service.schedule_retry(&payout.id).await.unwrap();
        assert_eq!(still_dlq.status, PayoutStatus::Dlq);
    }

    #[tokio::test]
    async fn manual_retry_resurrects_dlq_with_fresh_hold() {
        let (service, _ledger) = test_service(1_000_000, Config::default());
        let payout = service.create_payout(&ach_request(10.0, None)).await.unwrap();

        service.lease_for_dispatch(1, true).unwrap();
        service
            .mark_failed(&payout.id, "TRANSIENT_TIMEOUT", "timeout")
            .await
            .unwrap();
        service.force_dlq(&payout.id, "PERMANENT_INVALID_ACCOUNT", "bad account")
            .await
            .unwrap();

        let revived = service.retry(&payout.id, Some("ops")).await.unwrap();
        assert_eq!(revived.status, PayoutStatus::Pending);
        assert_eq!(revived.retry_count, 0);
        let hold = service.get_hold(&payout.id).unwrap().unwrap();
        assert_eq!(hold.status, HoldStatus::Active);
    }

    #[tokio::test]
    async fn high_value_payouts_raise_an_alert() {
        let config = Config {
            high_value_threshold_cents: 50_000,
            ..Config::default()
        };
        let (service, _ledger) = test_service(10_000_000, config);
        service.create_payout(&ach_request(1000.0, None)).await.unwrap();

        let alerts = service.list_alerts(Some(false), 10).unwrap();
        assert!(alerts.iter().any(|a| a.kind == AlertKind::HighValue));
    }

    #[tokio::test]
    async fn alert_resolution_is_single_shot() {
        let config = Config {
            high_value_threshold_cents: 1,
            ..Config::default()
        };
        let (service, _ledger) = test_service(1_000_000, config);
        service.create_payout(&ach_request(10.0, None)).await.unwrap();

        let alert = &service.list_alerts(Some(false), 1).unwrap()[0];
        let resolved = service
            .resolve_alert(&alert.id, Some("reviewed"), Some("ops"))
            .unwrap();
        assert!(resolved.resolved);

        let err = service.resolve_alert(&alert.id, None, None).unwrap_err();
        assert!(matches!(err, PayoutError::AlreadyResolved));
    }

    #[tokio::test]
    async fn hold_expiry_fails_the_payout_and_refunds() {
        let config = Config {
            hold_ttl_secs: 0,
            ..Config::default()
        };
        let (service, ledger) = test_service(1_000_000, config);
        let payout = service.create_payout(&ach_request(100.0, None)).await.unwrap();
        let reserved = ledger.balance(TENANT_ACCOUNT, "USD");

        let expired = service.sweep_expired_holds().await.unwrap();
        assert_eq!(expired, 1);

        let after = service.get(&payout.id).unwrap();
        assert_eq!(after.status, PayoutStatus::Failed);
        assert_eq!(after.last_error_code.as_deref(), Some("hold_expired"));
        assert!(after.next_retry_at.is_none());

        let hold = service.get_hold(&payout.id).unwrap().unwrap();
        assert_eq!(hold.status, HoldStatus::Expired);
        assert!(ledger.balance(TENANT_ACCOUNT, "USD") > reserved);

        let trail = service.audit_trail(&payout.id).unwrap();
        assert_eq!(trail.last().unwrap().event_type, "hold_expired");

        // The retry loop must not pick up a hold-expired failure.
        assert!(service.lease_due_retries(10).unwrap().is_empty());
    }
}
