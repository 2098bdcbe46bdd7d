//! Dispatch worker: drives payouts from the queue through connectors.
//!
//! Three cooperative loops (main, retry, SLA monitor) plus maintenance and
//! batch ticks, all sharing nothing but the store. Connector calls run on
//! a bounded semaphore; a watch channel drains everything on shutdown.

use crate::config::env_flag;
use crate::connectors::{is_permanent_code, ConnectorFactory, SubmitRequest, TRANSIENT_TIMEOUT};
use crate::models::{Payout, PayoutStatus};
use crate::service::{PayoutService, PROCESSING_ERROR_CODE};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub concurrency: usize,
    pub priority_enabled: bool,
    pub sla_monitor_enabled: bool,

    pub retry_poll_secs: u64,
    pub sla_poll_secs: u64,
    pub maintenance_poll_secs: u64,
    pub batch_poll_secs: u64,

    /// `processing` rows older than this are presumed orphaned by a crash.
    /// Must sit above the longest connector timeout.
    pub stale_processing_secs: i64,
    pub shutdown_grace_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            batch_size: 10,
            concurrency: 5,
            priority_enabled: true,
            sla_monitor_enabled: true,
            retry_poll_secs: 60,
            sla_poll_secs: 300,
            maintenance_poll_secs: 3_600,
            batch_poll_secs: 60,
            stale_processing_secs: 300,
            shutdown_grace_secs: 30,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("WORKER_POLL_MS") {
            if let Ok(ms) = v.parse() {
                config.poll_interval_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("WORKER_BATCH_SIZE") {
            if let Ok(n) = v.parse() {
                config.batch_size = n;
            }
        }
        if let Ok(v) = std::env::var("WORKER_CONCURRENCY") {
            if let Ok(n) = v.parse::<usize>() {
                config.concurrency = n.max(1);
            }
        }
        config.priority_enabled = env_flag("WORKER_PRIORITY_ENABLED", config.priority_enabled);
        config.sla_monitor_enabled =
            env_flag("WORKER_SLA_MONITOR_ENABLED", config.sla_monitor_enabled);
        if let Ok(v) = std::env::var("WORKER_STALE_PROCESSING_SECS") {
            if let Ok(n) = v.parse() {
                config.stale_processing_secs = n;
            }
        }
        config
    }
}

/// Outcome of one dispatch attempt, also used for batch item status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent,
    Settled,
    /// Transient failure; a retry is on the schedule (or exhaustion just
    /// dead-lettered it; the payout row knows which).
    Failed(String),
    /// Permanent failure, dead-lettered immediately.
    DeadLettered(String),
}

impl DispatchOutcome {
    pub fn payout_status(&self) -> PayoutStatus {
        match self {
            DispatchOutcome::Sent => PayoutStatus::Sent,
            DispatchOutcome::Settled => PayoutStatus::Settled,
            DispatchOutcome::Failed(_) => PayoutStatus::Failed,
            DispatchOutcome::DeadLettered(_) => PayoutStatus::Dlq,
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        match self {
            DispatchOutcome::Failed(code) | DispatchOutcome::DeadLettered(code) => Some(code),
            _ => None,
        }
    }
}

/// Drive one payout through its connector. Shared by the worker loops and
/// the batch processor; the caller may hand over a row already leased into
/// `processing` or a fresh `pending`/`scheduled` one.
pub async fn dispatch_payout(
    service: &PayoutService,
    connectors: &ConnectorFactory,
    payout: &Payout,
) -> DispatchOutcome {
    let mut payout = payout.clone();

    if matches!(
        payout.status,
        PayoutStatus::Pending | PayoutStatus::Scheduled
    ) {
        payout = match service
            .update_status(
                &payout.id,
                PayoutStatus::Processing,
                Default::default(),
            )
            .await
        {
            Ok(p) => p,
            Err(e) => {
                warn!("payout {} could not enter processing: {}", payout.id, e);
                return DispatchOutcome::Failed(PROCESSING_ERROR_CODE.to_string());
            }
        };
    }

    let rail = payout.rail.unwrap_or_else(|| payout.method.default_rail());
    let Some(connector) = connectors.resolve(payout.connector_id.as_deref(), rail) else {
        return fail_and_reschedule(
            service,
            &payout,
            PROCESSING_ERROR_CODE,
            &format!("no connector registered for rail {}", rail.as_str()),
        )
        .await;
    };

    let request = SubmitRequest {
        payout_id: payout.id.clone(),
        amount_cents: payout.amount_cents,
        currency: payout.currency.clone(),
        beneficiary_type: payout.beneficiary_type.clone(),
        beneficiary_id: payout.beneficiary_id.clone(),
        beneficiary_account: payout.beneficiary_account.clone(),
        rail,
        country: payout.country.clone(),
        reference: payout.id.clone(),
    };

    // The connector client carries its own timeout; this outer guard also
    // bounds connectors that ignore it.
    let submit_budget = Duration::from_secs(rail.submit_timeout_secs() + 5);
    let result = match timeout(submit_budget, connector.submit(&request)).await {
        Err(_) => {
            return fail_and_reschedule(
                service,
                &payout,
                TRANSIENT_TIMEOUT,
                "connector call exceeded its submit budget",
            )
            .await;
        }
        Ok(Err(e)) => {
            // An error escaping the connector is a bug at dispatch time.
            error!("connector {} blew up on {}: {}", connector.id(), payout.id, e);
            return fail_and_reschedule(
                service,
                &payout,
                PROCESSING_ERROR_CODE,
                &format!("connector error: {}", e),
            )
            .await;
        }
        Ok(Ok(result)) => result,
    };

    if result.success {
        let reference = result
            .bank_reference
            .unwrap_or_else(|| payout.id.clone());
        match service
            .mark_sent(&payout.id, &reference, result.bank_fee_cents)
            .await
        {
            Ok(_) => {}
            Err(e) => {
                error!("payout {} accepted but not marked sent: {}", payout.id, e);
                return DispatchOutcome::Failed(PROCESSING_ERROR_CODE.to_string());
            }
        }
        debug!("✅ Payout {} sent ({})", payout.id, reference);

        if result.instant_settlement {
            match service.settle(&payout.id).await {
                Ok(_) => return DispatchOutcome::Settled,
                Err(e) => {
                    error!("payout {} instant settlement failed: {}", payout.id, e);
                    return DispatchOutcome::Sent;
                }
            }
        }
        return DispatchOutcome::Sent;
    }

    let code = result
        .error_code
        .unwrap_or_else(|| PROCESSING_ERROR_CODE.to_string());
    let message = result
        .error_message
        .unwrap_or_else(|| "connector rejected the payout".to_string());

    if is_permanent_code(&code) {
        if let Err(e) = service.mark_failed(&payout.id, &code, &message).await {
            error!("payout {} failure transition lost: {}", payout.id, e);
        }
        match service.force_dlq(&payout.id, &code, &message).await {
            Ok(_) => DispatchOutcome::DeadLettered(code),
            Err(e) => {
                error!("payout {} could not be dead-lettered: {}", payout.id, e);
                DispatchOutcome::Failed(code)
            }
        }
    } else {
        fail_and_reschedule(service, &payout, &code, &message).await
    }
}

async fn fail_and_reschedule(
    service: &PayoutService,
    payout: &Payout,
    code: &str,
    message: &str,
) -> DispatchOutcome {
    if let Err(e) = service.mark_failed(&payout.id, code, message).await {
        error!("payout {} failure transition lost: {}", payout.id, e);
        return DispatchOutcome::Failed(code.to_string());
    }
    match service.schedule_retry(&payout.id).await {
        Ok(updated) if updated.status == PayoutStatus::Dlq => {
            DispatchOutcome::DeadLettered(code.to_string())
        }
        Ok(_) => DispatchOutcome::Failed(code.to_string()),
        Err(e) => {
            error!("payout {} retry scheduling failed: {}", payout.id, e);
            DispatchOutcome::Failed(code.to_string())
        }
    }
}

pub struct DispatchWorker {
    service: Arc<PayoutService>,
    connectors: Arc<ConnectorFactory>,
    batches: Arc<crate::batch::BatchProcessor>,
    config: WorkerConfig,
    slots: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
}

impl DispatchWorker {
    pub fn new(
        service: Arc<PayoutService>,
        connectors: Arc<ConnectorFactory>,
        batches: Arc<crate::batch::BatchProcessor>,
        config: WorkerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.concurrency));
        Self {
            service,
            connectors,
            batches,
            config,
            slots,
            shutdown,
        }
    }

    /// Run until the shutdown signal flips, then drain in-flight work for
    /// up to the grace window. In-flight rows keep their `processing`
    /// status; the startup sweeper rescues them after a hard crash.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let rescued = self
            .service
            .rescue_stale_processing(self.config.stale_processing_secs)?;
        if !rescued.is_empty() {
            warn!(
                "🚑 Rescued {} payouts stuck in processing from a previous run",
                rescued.len()
            );
        }

        info!(
            "🚚 Dispatch worker starting: poll={}ms batch={} concurrency={} priority={} sla={}",
            self.config.poll_interval_ms,
            self.config.batch_size,
            self.config.concurrency,
            self.config.priority_enabled,
            self.config.sla_monitor_enabled
        );

        let mut handles = Vec::new();
        handles.push(tokio::spawn(Arc::clone(&self).main_loop()));
        handles.push(tokio::spawn(Arc::clone(&self).retry_loop()));
        if self.config.sla_monitor_enabled {
            handles.push(tokio::spawn(Arc::clone(&self).sla_loop()));
        }
        handles.push(tokio::spawn(Arc::clone(&self).batch_loop()));
        handles.push(tokio::spawn(Arc::clone(&self).maintenance_loop()));

        let mut shutdown = self.shutdown.clone();
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        info!("🛑 Dispatch worker draining in-flight payouts");
        let drain = self
            .slots
            .clone()
            .acquire_many_owned(self.config.concurrency as u32);
        match timeout(Duration::from_secs(self.config.shutdown_grace_secs), drain).await {
            Ok(_) => info!("dispatch worker drained cleanly"),
            Err(_) => warn!(
                "dispatch worker exiting with work in flight after {}s",
                self.config.shutdown_grace_secs
            ),
        }

        for handle in handles {
            handle.abort();
        }
        Ok(())
    }

    /// One sweep of every loop; the scheduled-task entry point.
    pub async fn run_once(&self) -> Result<()> {
        self.service
            .rescue_stale_processing(self.config.stale_processing_secs)?;
        self.dispatch_sweep().await;
        self.retry_sweep().await;
        if self.config.sla_monitor_enabled {
            if let Err(e) = self.service.sweep_sla_violations() {
                warn!("SLA sweep failed: {}", e);
            }
        }
        if let Err(e) = self.batches.tick().await {
            warn!("batch tick failed: {}", e);
        }
        if let Err(e) = self.service.sweep_expired_holds().await {
            warn!("hold sweep failed: {}", e);
        }
        Ok(())
    }

    async fn main_loop(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_millis(self.config.poll_interval_ms));
        loop {
            ticker.tick().await;
            if *self.shutdown.borrow() {
                return;
            }
            self.dispatch_sweep().await;
        }
    }

    async fn dispatch_sweep(&self) {
        let free = self.slots.available_permits();
        if free == 0 {
            return;
        }
        let lease = self.config.batch_size.min(free);
        let payouts = match self.service.lease_for_dispatch(lease, self.config.priority_enabled) {
            Ok(rows) => rows,
            Err(e) => {
                warn!("dispatch lease failed: {}", e);
                return;
            }
        };
        for payout in payouts {
            self.spawn_dispatch(payout).await;
        }
    }

    async fn retry_loop(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(self.config.retry_poll_secs));
        loop {
            ticker.tick().await;
            if *self.shutdown.borrow() {
                return;
            }
            self.retry_sweep().await;
        }
    }

    async fn retry_sweep(&self) {
        let payouts = match self.service.lease_due_retries(self.config.batch_size) {
            Ok(rows) => rows,
            Err(e) => {
                warn!("retry lease failed: {}", e);
                return;
            }
        };
        if !payouts.is_empty() {
            info!("🔁 Retrying {} failed payouts", payouts.len());
        }
        for payout in payouts {
            self.spawn_dispatch(payout).await;
        }
    }

    async fn spawn_dispatch(&self, payout: Payout) {
        let permit = match Arc::clone(&self.slots).acquire_owned().await {
            Ok(p) => p,
            Err(_) => return, // semaphore closed on shutdown
        };
        let service = Arc::clone(&self.service);
        let connectors = Arc::clone(&self.connectors);
        tokio::spawn(async move {
            let _permit = permit;
            let outcome = dispatch_payout(&service, &connectors, &payout).await;
            debug!("payout {} dispatch outcome: {:?}", payout.id, outcome);
        });
    }

    async fn sla_loop(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(self.config.sla_poll_secs));
        loop {
            ticker.tick().await;
            if *self.shutdown.borrow() {
                return;
            }
            match self.service.sweep_sla_violations() {
                Ok(flagged) if flagged > 0 => {
                    warn!("⚠️ SLA monitor flagged {} payouts", flagged);
                }
                Ok(_) => {}
                Err(e) => warn!("SLA sweep failed: {}", e),
            }
        }
    }

    async fn batch_loop(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(self.config.batch_poll_secs));
        loop {
            ticker.tick().await;
            if *self.shutdown.borrow() {
                return;
            }
            if let Err(e) = self.batches.tick().await {
                warn!("batch tick failed: {}", e);
            }
        }
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(self.config.maintenance_poll_secs));
        loop {
            ticker.tick().await;
            if *self.shutdown.borrow() {
                return;
            }
            match self.service.sweep_expired_holds().await {
                Ok(expired) if expired > 0 => {
                    info!("⏰ Expired {} stale holds", expired);
                }
                Ok(_) => {}
                Err(e) => warn!("hold sweep failed: {}", e),
            }
            let pruned = self.service.prune_idempotency_cache();
            if pruned > 0 {
                debug!("pruned {} idempotency cache entries", pruned);
            }
            if let Err(e) = self.service.db().optimize() {
                warn!("db maintenance failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::connectors::{
        BankConnector, ConnectorHealth, SubmitResult, PERMANENT_INVALID_ACCOUNT,
        TRANSIENT_UPSTREAM,
    };
    use crate::models::{HoldStatus, PaymentRail, PayoutPriority};
    use crate::service::tests::{ach_request, test_service};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Connector that replays a script of results, then accepts.
    struct ScriptedConnector {
        rail: PaymentRail,
        script: Mutex<VecDeque<SubmitResult>>,
        instant: bool,
    }

    impl ScriptedConnector {
        fn new(rail: PaymentRail, script: Vec<SubmitResult>) -> Self {
            Self {
                rail,
                script: Mutex::new(script.into()),
                instant: false,
            }
        }
    }

    #[async_trait::async_trait]
    impl BankConnector for ScriptedConnector {
        fn id(&self) -> &str {
            "scripted"
        }

        fn rail(&self) -> PaymentRail {
            self.rail
        }

        async fn submit(&self, request: &SubmitRequest) -> anyhow::Result<SubmitResult> {
            if let Some(result) = self.script.lock().pop_front() {
                return Ok(result);
            }
            Ok(SubmitResult::accepted(
                format!("ACH-{}", request.payout_id),
                self.instant,
            ))
        }

        async fn health_check(&self) -> ConnectorHealth {
            ConnectorHealth {
                healthy: true,
                message: None,
            }
        }
    }

    fn factory_with(connector: ScriptedConnector) -> Arc<ConnectorFactory> {
        let mut factory = ConnectorFactory::new();
        factory.register(Arc::new(connector), true);
        Arc::new(factory)
    }

    #[tokio::test]
    async fn successful_dispatch_marks_sent() {
        let (service, _ledger) = test_service(1_000_000, Config::default());
        let payout = service.create_payout(&ach_request(100.0, None)).await.unwrap();
        let connectors = factory_with(ScriptedConnector::new(PaymentRail::Ach, vec![]));

        let leased = service.lease_for_dispatch(1, true).unwrap();
        let outcome = dispatch_payout(&service, &connectors, &leased[0]).await;
        assert_eq!(outcome, DispatchOutcome::Sent);

        let after = service.get(&payout.id).unwrap();
        assert_eq!(after.status, PayoutStatus::Sent);
        assert!(after.bank_reference.is_some());
        assert!(after.sent_at.is_some());
        // Still awaiting external confirmation: hold stays active.
        let hold = service.get_hold(&payout.id).unwrap().unwrap();
        assert_eq!(hold.status, HoldStatus::Active);
    }

    #[tokio::test]
    async fn instant_settlement_settles_in_one_pass() {
        let (service, _ledger) = test_service(1_000_000, Config::default());
        let payout = service.create_payout(&ach_request(100.0, None)).await.unwrap();
        let connectors = factory_with(ScriptedConnector::new(
            PaymentRail::Ach,
            vec![SubmitResult {
                success: true,
                bank_reference: Some("ACH-123".to_string()),
                instant_settlement: true,
                error_code: None,
                error_message: None,
                bank_fee_cents: Some(50),
            }],
        ));

        let leased = service.lease_for_dispatch(1, true).unwrap();
        let outcome = dispatch_payout(&service, &connectors, &leased[0]).await;
        assert_eq!(outcome, DispatchOutcome::Settled);

        let after = service.get(&payout.id).unwrap();
        assert_eq!(after.status, PayoutStatus::Settled);
        assert_eq!(after.bank_reference.as_deref(), Some("ACH-123"));
        // The actual bank fee flows into the cost identity.
        assert_eq!(after.bank_fee_cents, 50);
        assert_eq!(
            after.total_cost_cents,
            after.amount_cents + after.fee_cents + after.bank_fee_cents
        );

        let hold = service.get_hold(&payout.id).unwrap().unwrap();
        assert_eq!(hold.status, HoldStatus::Released);
    }

    #[tokio::test]
    async fn transient_failure_schedules_a_retry() {
        let (service, _ledger) = test_service(1_000_000, Config::default());
        let payout = service.create_payout(&ach_request(100.0, None)).await.unwrap();
        let connectors = factory_with(ScriptedConnector::new(
            PaymentRail::Ach,
            vec![SubmitResult::rejected(TRANSIENT_UPSTREAM, "gateway down")],
        ));

        let leased = service.lease_for_dispatch(1, true).unwrap();
        let outcome = dispatch_payout(&service, &connectors, &leased[0]).await;
        assert!(matches!(outcome, DispatchOutcome::Failed(_)));

        let after = service.get(&payout.id).unwrap();
        assert_eq!(after.status, PayoutStatus::Failed);
        assert_eq!(after.retry_count, 1);
        assert!(after.next_retry_at.is_some());
        assert_eq!(after.last_error_code.as_deref(), Some(TRANSIENT_UPSTREAM));
        assert_eq!(service.retry_log(&payout.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn permanent_failure_dead_letters_immediately() {
        let (service, _ledger) = test_service(1_000_000, Config::default());
        let payout = service.create_payout(&ach_request(100.0, None)).await.unwrap();
        let connectors = factory_with(ScriptedConnector::new(
            PaymentRail::Ach,
            vec![SubmitResult::rejected(
                PERMANENT_INVALID_ACCOUNT,
                "account closed",
            )],
        ));

        let leased = service.lease_for_dispatch(1, true).unwrap();
        let outcome = dispatch_payout(&service, &connectors, &leased[0]).await;
        assert_eq!(
            outcome,
            DispatchOutcome::DeadLettered(PERMANENT_INVALID_ACCOUNT.to_string())
        );

        let after = service.get(&payout.id).unwrap();
        assert_eq!(after.status, PayoutStatus::Dlq);
        // Straight to the dead letter: no retry was burned.
        assert_eq!(after.retry_count, 0);

        let hold = service.get_hold(&payout.id).unwrap().unwrap();
        assert_eq!(hold.status, HoldStatus::Reversed);

        let alerts = service.list_alerts(Some(false), 10).unwrap();
        assert!(alerts
            .iter()
            .any(|a| a.kind == crate::models::AlertKind::PermanentFailure));
    }

    #[tokio::test]
    async fn exhausted_retries_reach_the_dead_letter_queue() {
        // Zero base delay so every retry is immediately due.
        let config = Config {
            retry_base_delay_secs: 0,
            ..Config::default()
        };
        let (service, _ledger) = test_service(1_000_000, config);
        let payout = service.create_payout(&ach_request(100.0, None)).await.unwrap();
        let connectors = factory_with(ScriptedConnector::new(
            PaymentRail::Ach,
            vec![
                SubmitResult::rejected(TRANSIENT_UPSTREAM, "down"),
                SubmitResult::rejected(TRANSIENT_UPSTREAM, "down"),
                SubmitResult::rejected(TRANSIENT_UPSTREAM, "down"),
            ],
        ));

        let leased = service.lease_for_dispatch(1, true).unwrap();
        dispatch_payout(&service, &connectors, &leased[0]).await;

        for _ in 0..2 {
            let due = service.lease_due_retries(1).unwrap();
            if due.is_empty() {
                break;
            }
            dispatch_payout(&service, &connectors, &due[0]).await;
        }

        let after = service.get(&payout.id).unwrap();
        assert_eq!(after.status, PayoutStatus::Dlq);
        assert_eq!(after.retry_count, after.max_retries);

        let log = service.retry_log(&payout.id).unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log.last().unwrap().outcome, "dlq");

        let hold = service.get_hold(&payout.id).unwrap().unwrap();
        assert_eq!(hold.status, HoldStatus::Reversed);
    }

    #[tokio::test]
    async fn priority_ordering_leases_instant_first() {
        let (service, _ledger) = test_service(10_000_000, Config::default());

        let mut batch_req = ach_request(10.0, None);
        batch_req.priority = PayoutPriority::Batch;
        let batch = service.create_payout(&batch_req).await.unwrap();

        let mut instant_req = ach_request(10.0, None);
        instant_req.priority = PayoutPriority::Instant;
        let instant = service.create_payout(&instant_req).await.unwrap();

        let leased = service.lease_for_dispatch(2, true).unwrap();
        assert_eq!(leased.len(), 2);
        assert_eq!(leased[0].id, instant.id);
        assert_eq!(leased[1].id, batch.id);
    }

    #[tokio::test]
    async fn missing_connector_is_a_processing_error() {
        let (service, _ledger) = test_service(1_000_000, Config::default());
        let payout = service.create_payout(&ach_request(100.0, None)).await.unwrap();
        // Factory with no ACH connector at all.
        let connectors = Arc::new(ConnectorFactory::new());

        let leased = service.lease_for_dispatch(1, true).unwrap();
        let outcome = dispatch_payout(&service, &connectors, &leased[0]).await;
        assert!(matches!(outcome, DispatchOutcome::Failed(_)));

        let after = service.get(&payout.id).unwrap();
        assert_eq!(after.status, PayoutStatus::Failed);
        assert_eq!(
            after.last_error_code.as_deref(),
            Some(PROCESSING_ERROR_CODE)
        );
        assert_eq!(after.retry_count, 1);
    }

    #[tokio::test]
    async fn settlement_confirmation_completes_the_lifecycle() {
        let (service, _ledger) = test_service(1_000_000, Config::default());
        let payout = service.create_payout(&ach_request(100.0, None)).await.unwrap();
        let connectors = factory_with(ScriptedConnector::new(PaymentRail::Ach, vec![]));

        let leased = service.lease_for_dispatch(1, true).unwrap();
        dispatch_payout(&service, &connectors, &leased[0]).await;

        let sent = service.get(&payout.id).unwrap();
        let reference = sent.bank_reference.clone().unwrap();

        let settled = service
            .confirm_settlement(&reference, true, None)
            .await
            .unwrap();
        assert_eq!(settled.status, PayoutStatus::Settled);

        // Duplicate confirmations are absorbed.
        let again = service
            .confirm_settlement(&reference, true, None)
            .await
            .unwrap();
        assert_eq!(again.status, PayoutStatus::Settled);

        let hold = service.get_hold(&payout.id).unwrap().unwrap();
        assert_eq!(hold.status, HoldStatus::Released);
    }
}
