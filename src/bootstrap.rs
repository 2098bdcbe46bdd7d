//! Shared wiring for the API server and the worker binary.

use crate::batch::BatchProcessor;
use crate::config::Config;
use crate::connectors::{ConnectorFactory, HttpBankConnector};
use crate::idempotency::IdempotencyCache;
use crate::ledger::{HoldManager, HttpLedgerClient, InMemoryLedger, LedgerClient};
use crate::models::PaymentRail;
use crate::routing::{HttpRoutingAdvisor, NoopRoutingAdvisor, RoutingAdvisor};
use crate::service::PayoutService;
use crate::sla::{SlaEngine, WeekdayCalendar};
use crate::store::PayoutDb;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct Engine {
    pub config: Config,
    pub db: PayoutDb,
    pub service: Arc<PayoutService>,
    pub connectors: Arc<ConnectorFactory>,
    pub batches: Arc<BatchProcessor>,
}

/// Build the full engine from configuration. Both binaries call this so a
/// deployment can run the worker embedded or as its own process.
pub fn build_engine(config: Config) -> Result<Engine> {
    let db = PayoutDb::new(&config.database_path)?;
    db.seed_default_sla_rules()?;

    let ledger: Arc<dyn LedgerClient> = match config.ledger_url.as_deref() {
        Some(url) => {
            info!("🏦 Using remote ledger at {}", url);
            Arc::new(HttpLedgerClient::new(url)?)
        }
        None => {
            warn!("no LEDGER_URL configured, using in-memory ledger (dev only)");
            let ledger = InMemoryLedger::new();
            seed_dev_balances(&ledger);
            Arc::new(ledger)
        }
    };

    let routing: Arc<dyn RoutingAdvisor> = match config.routing_advisor_url.as_deref() {
        Some(url) => {
            info!("🧭 Routing advisor at {}", url);
            Arc::new(HttpRoutingAdvisor::new(url)?)
        }
        None => Arc::new(NoopRoutingAdvisor),
    };

    let mut factory = ConnectorFactory::with_sandbox_defaults();
    for rail in [
        PaymentRail::Ach,
        PaymentRail::Wire,
        PaymentRail::Sepa,
        PaymentRail::FasterPayments,
        PaymentRail::MobileMoney,
        PaymentRail::WalletCredit,
    ] {
        let id = format!("{}-gateway", rail.as_str());
        if let Some(connector) = HttpBankConnector::from_env(&id, rail) {
            info!("🔌 Registered gateway connector {}", id);
            factory.register(Arc::new(connector), true);
        }
    }
    let connectors = Arc::new(factory);

    let holds = HoldManager::new(db.clone(), Arc::clone(&ledger), config.hold_ttl_secs);
    let sla = SlaEngine::new(db.clone(), Arc::new(WeekdayCalendar));
    let idempotency = IdempotencyCache::new(Duration::from_secs(config.idempotency_ttl_secs));

    let service = Arc::new(PayoutService::new(
        db.clone(),
        holds,
        sla,
        idempotency,
        routing,
        config.clone(),
    ));
    let batches = Arc::new(BatchProcessor::new(
        Arc::clone(&service),
        Arc::clone(&connectors),
    ));

    Ok(Engine {
        config,
        db,
        service,
        connectors,
        batches,
    })
}

/// `DEV_LEDGER_SEED=account,currency,amount_cents[;...]` funds the
/// in-memory ledger for local runs.
fn seed_dev_balances(ledger: &InMemoryLedger) {
    let Ok(seed) = std::env::var("DEV_LEDGER_SEED") else {
        return;
    };
    for entry in seed.split(';').filter(|e| !e.trim().is_empty()) {
        let parts: Vec<&str> = entry.split(',').map(str::trim).collect();
        if let [account, currency, amount] = parts.as_slice() {
            if let Ok(cents) = amount.parse::<i64>() {
                ledger.deposit(account, currency, cents);
                info!("💰 Seeded {} {} cents into {}", cents, currency, account);
                continue;
            }
        }
        warn!("ignoring malformed DEV_LEDGER_SEED entry '{}'", entry);
    }
}
