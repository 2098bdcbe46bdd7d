//! End-to-end payout lifecycle against a real SQLite file.

use payrail_backend::batch::BatchProcessor;
use payrail_backend::config::Config;
use payrail_backend::connectors::{ConnectorFactory, SandboxConnector, SandboxConnectorConfig};
use payrail_backend::idempotency::IdempotencyCache;
use payrail_backend::ledger::{HoldManager, InMemoryLedger, LedgerClient};
use payrail_backend::models::{
    CreatePayoutRequest, HoldStatus, PayoutMethod, PayoutPriority, PayoutStatus, PaymentRail,
};
use payrail_backend::routing::NoopRoutingAdvisor;
use payrail_backend::service::PayoutService;
use payrail_backend::sla::{SlaEngine, WeekdayCalendar};
use payrail_backend::store::PayoutDb;
use payrail_backend::worker::dispatch_payout;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const TENANT_ACCOUNT: &str = "merchant:t1:available_balance";

struct Harness {
    _dir: TempDir,
    service: Arc<PayoutService>,
    connectors: Arc<ConnectorFactory>,
    ledger: Arc<InMemoryLedger>,
}

fn harness(config: Config) -> Harness {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("payrail.db");
    let db = PayoutDb::new(db_path.to_str().unwrap()).unwrap();
    db.seed_default_sla_rules().unwrap();

    let ledger = Arc::new(InMemoryLedger::new());
    ledger.deposit(TENANT_ACCOUNT, "USD", 10_000_000);

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

    let mut factory = ConnectorFactory::new();
    factory.register(
        Arc::new(SandboxConnector::new(
            "sandbox-ach".to_string(),
            PaymentRail::Ach,
            SandboxConnectorConfig {
                base_latency_ms: 0,
                latency_jitter_ms: 0,
                ..Default::default()
            },
        )),
        true,
    );
    let connectors = Arc::new(factory);

    Harness {
        _dir: dir,
        service,
        connectors,
        ledger,
    }
}

fn ach_request(amount: f64, key: Option<&str>) -> CreatePayoutRequest {
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
        created_by: Some("it@example.com".to_string()),
    }
}

#[tokio::test]
async fn happy_path_ach_standard() {
    let h = harness(Config::default());

    let payout = h
        .service
        .create_payout(&ach_request(1000.0, Some("K1")))
        .await
        .unwrap();
    assert_eq!(payout.status, PayoutStatus::Pending);
    // ACH default rule: $0.25 base + 10 bps on $1000 = $1.25 fee.
    assert_eq!(payout.total_cost_cents, 100_125);

    let hold = h.service.get_hold(&payout.id).unwrap().unwrap();
    assert_eq!(hold.status, HoldStatus::Active);
    assert_eq!(hold.amount_cents, 100_125);

    // Worker leases and submits.
    let leased = h.service.lease_for_dispatch(10, true).unwrap();
    assert_eq!(leased.len(), 1);
    dispatch_payout(&h.service, &h.connectors, &leased[0]).await;

    let sent = h.service.get(&payout.id).unwrap();
    assert_eq!(sent.status, PayoutStatus::Sent);
    let reference = sent.bank_reference.clone().unwrap();
    assert!(reference.starts_with("ACH-"));

    // External settlement confirmation closes it out.
    let settled = h
        .service
        .confirm_settlement(&reference, true, None)
        .await
        .unwrap();
    assert_eq!(settled.status, PayoutStatus::Settled);
    assert!(settled.settled_at.is_some());

    let hold = h.service.get_hold(&payout.id).unwrap().unwrap();
    assert_eq!(hold.status, HoldStatus::Released);
    // Released funds are gone for good, not refunded.
    assert_eq!(h.ledger.balance(TENANT_ACCOUNT, "USD"), 10_000_000 - 100_125);

    // created, three status changes, then the hold release.
    let trail = h.service.audit_trail(&payout.id).unwrap();
    let events: Vec<&str> = trail.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        events,
        vec![
            "created",
            "status_changed",
            "status_changed",
            "status_changed",
            "hold_released",
        ]
    );
    assert!(trail.windows(2).all(|w| w[0].id < w[1].id));
}

#[tokio::test]
async fn idempotent_replay_is_side_effect_free() {
    let h = harness(Config::default());

    let first = h
        .service
        .create_payout(&ach_request(200.0, Some("K2")))
        .await
        .unwrap();
    let second = h
        .service
        .create_payout(&ach_request(200.0, Some("K2")))
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(h.service.db().payout_count().unwrap(), 1);
    assert_eq!(h.service.db().active_hold_count().unwrap(), 1);
    assert_eq!(h.service.audit_trail(&first.id).unwrap().len(), 1);

    let by_key = h.service.get_by_idempotency_key("K2").unwrap();
    assert_eq!(by_key.id, first.id);
}

#[tokio::test]
async fn retries_exhaust_into_dlq_with_full_history() {
    let config = Config {
        retry_base_delay_secs: 0,
        ..Config::default()
    };
    let h = harness(config);

    // A connector that always fails transiently.
    let mut factory = ConnectorFactory::new();
    factory.register(
        Arc::new(SandboxConnector::new(
            "flaky".to_string(),
            PaymentRail::Ach,
            SandboxConnectorConfig {
                base_latency_ms: 0,
                latency_jitter_ms: 0,
                transient_failure_prob: 1.0,
                ..Default::default()
            },
        )),
        true,
    );
    let flaky = Arc::new(factory);

    let payout = h
        .service
        .create_payout(&ach_request(50.0, None))
        .await
        .unwrap();

    let leased = h.service.lease_for_dispatch(1, true).unwrap();
    dispatch_payout(&h.service, &flaky, &leased[0]).await;

    loop {
        let due = h.service.lease_due_retries(1).unwrap();
        if due.is_empty() {
            break;
        }
        dispatch_payout(&h.service, &flaky, &due[0]).await;
    }

    let after = h.service.get(&payout.id).unwrap();
    assert_eq!(after.status, PayoutStatus::Dlq);
    assert_eq!(after.retry_count, after.max_retries);

    let log = h.service.retry_log(&payout.id).unwrap();
    assert_eq!(log.len(), 3);
    assert_eq!(log.last().unwrap().outcome, "dlq");

    let hold = h.service.get_hold(&payout.id).unwrap().unwrap();
    assert_eq!(hold.status, HoldStatus::Reversed);
    // Reversed hold refunds the tenant in full.
    assert_eq!(h.ledger.balance(TENANT_ACCOUNT, "USD"), 10_000_000);

    // The reversal leaves its own mark on the trail.
    let trail = h.service.audit_trail(&payout.id).unwrap();
    assert_eq!(trail.last().unwrap().event_type, "hold_reversed");
}

#[tokio::test]
async fn batch_drains_items_in_sequence() {
    let h = harness(Config::default());
    let batches = BatchProcessor::new(Arc::clone(&h.service), Arc::clone(&h.connectors));

    let batch = batches
        .create_batch(
            "weekly-vendors",
            "weekly_settlements",
            None,
            None,
            None,
            Some(PaymentRail::Ach),
        )
        .unwrap();

    let mut ids = Vec::new();
    for i in 0..3 {
        let payout = h
            .service
            .create_payout(&ach_request(10.0 + i as f64, None))
            .await
            .unwrap();
        batches.add_payout(&batch.id, &payout.id).unwrap();
        ids.push(payout.id);
    }

    let locked = batches.lock_batch(&batch.id).unwrap();
    assert_eq!(locked.total_items, 3);

    // A locked batch refuses new members.
    let extra = h.service.create_payout(&ach_request(5.0, None)).await.unwrap();
    assert!(batches.add_payout(&batch.id, &extra.id).is_err());

    let done = batches.process_batch(&batch.id).await.unwrap();
    assert_eq!(done.completed_items, 3);
    assert_eq!(done.failed_items, 0);

    for id in &ids {
        let payout = h.service.get(id).unwrap();
        assert_eq!(payout.status, PayoutStatus::Sent);
    }
}
