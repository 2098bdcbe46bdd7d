//! Bank connector contract and registry.
//!
//! A connector speaks one rail on behalf of the engine. The contract is
//! deliberately narrow: submit a payout, answer a health probe. Settlement
//! confirmations come back through the service, not through connectors.

mod http;
mod sandbox;

pub use http::HttpBankConnector;
pub use sandbox::{SandboxConnector, SandboxConnectorConfig};

use crate::models::{Amount, PaymentRail};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

// Error code families surfaced by connectors. The worker's retry decision
// keys off the prefix alone, so connectors may extend the suffixes.
pub const TRANSIENT_TIMEOUT: &str = "TRANSIENT_TIMEOUT";
pub const TRANSIENT_NETWORK: &str = "TRANSIENT_NETWORK";
pub const TRANSIENT_RATE_LIMITED: &str = "TRANSIENT_RATE_LIMITED";
pub const TRANSIENT_UPSTREAM: &str = "TRANSIENT_UPSTREAM";
pub const PERMANENT_INVALID_ACCOUNT: &str = "PERMANENT_INVALID_ACCOUNT";
pub const PERMANENT_CURRENCY_MISMATCH: &str = "PERMANENT_CURRENCY_MISMATCH";
pub const PERMANENT_COMPLIANCE_BLOCK: &str = "PERMANENT_COMPLIANCE_BLOCK";
pub const PERMANENT_INSUFFICIENT_FUNDS: &str = "PERMANENT_INSUFFICIENT_FUNDS";
pub const PROCESSING_ERROR: &str = "PROCESSING_ERROR";

pub fn is_permanent_code(code: &str) -> bool {
    code.starts_with("PERMANENT_")
}

/// Payout fields a connector needs to move the money.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitRequest {
    pub payout_id: String,
    pub amount_cents: Amount,
    pub currency: String,
    pub beneficiary_type: String,
    pub beneficiary_id: String,
    pub beneficiary_account: Option<String>,
    pub rail: PaymentRail,
    pub country: Option<String>,
    /// Echoed back on statements for reconciliation.
    pub reference: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResult {
    pub success: bool,
    pub bank_reference: Option<String>,
    /// The rail settled synchronously; no confirmation callback will come.
    #[serde(default)]
    pub instant_settlement: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    /// Actual bank-side fee, when the gateway reports one.
    #[serde(default)]
    pub bank_fee_cents: Option<Amount>,
}

impl SubmitResult {
    pub fn accepted(bank_reference: String, instant_settlement: bool) -> Self {
        Self {
            success: true,
            bank_reference: Some(bank_reference),
            instant_settlement,
            error_code: None,
            error_message: None,
            bank_fee_cents: None,
        }
    }

    pub fn rejected(code: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            bank_reference: None,
            instant_settlement: false,
            error_code: Some(code.to_string()),
            error_message: Some(message.into()),
            bank_fee_cents: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectorHealth {
    pub healthy: bool,
    pub message: Option<String>,
}

#[async_trait]
pub trait BankConnector: Send + Sync {
    fn id(&self) -> &str;
    fn rail(&self) -> PaymentRail;

    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitResult>;

    async fn health_check(&self) -> ConnectorHealth;
}

/// Registry of connectors keyed by (connector id, rail), with a default
/// connector per rail for payouts that never named one.
pub struct ConnectorFactory {
    connectors: HashMap<(String, PaymentRail), Arc<dyn BankConnector>>,
    defaults: HashMap<PaymentRail, String>,
}

impl ConnectorFactory {
    pub fn new() -> Self {
        Self {
            connectors: HashMap::new(),
            defaults: HashMap::new(),
        }
    }

    /// Sandbox connectors on every rail; the dev/test wiring.
    pub fn with_sandbox_defaults() -> Self {
        let mut factory = Self::new();
        for rail in [
            PaymentRail::Ach,
            PaymentRail::Wire,
            PaymentRail::Sepa,
            PaymentRail::FasterPayments,
            PaymentRail::MobileMoney,
            PaymentRail::WalletCredit,
        ] {
            factory.register(
                Arc::new(SandboxConnector::new(
                    format!("sandbox-{}", rail.as_str()),
                    rail,
                    SandboxConnectorConfig::default(),
                )),
                true,
            );
        }
        factory
    }

    pub fn register(&mut self, connector: Arc<dyn BankConnector>, default_for_rail: bool) {
        let key = (connector.id().to_string(), connector.rail());
        if default_for_rail {
            self.defaults.insert(connector.rail(), key.0.clone());
        }
        self.connectors.insert(key, connector);
    }

    /// Resolve (connector id, rail), falling back to the rail's default
    /// connector when the id is absent or unknown.
    pub fn resolve(
        &self,
        connector_id: Option<&str>,
        rail: PaymentRail,
    ) -> Option<Arc<dyn BankConnector>> {
        if let Some(id) = connector_id {
            if let Some(c) = self.connectors.get(&(id.to_string(), rail)) {
                return Some(Arc::clone(c));
            }
        }
        let default_id = self.defaults.get(&rail)?;
        self.connectors
            .get(&(default_id.clone(), rail))
            .map(Arc::clone)
    }

    /// Health of every registered connector, keyed "connector_id/rail".
    pub async fn health_snapshot(&self) -> HashMap<String, ConnectorHealth> {
        let mut out = HashMap::with_capacity(self.connectors.len());
        for ((id, rail), connector) in &self.connectors {
            let health = connector.health_check().await;
            out.insert(format!("{}/{}", id, rail.as_str()), health);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}

impl Default for ConnectorFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_code_detection() {
        assert!(is_permanent_code(PERMANENT_INVALID_ACCOUNT));
        assert!(is_permanent_code("PERMANENT_SOMETHING_NEW"));
        assert!(!is_permanent_code(TRANSIENT_TIMEOUT));
        assert!(!is_permanent_code(PROCESSING_ERROR));
    }

    #[tokio::test]
    async fn factory_resolves_named_then_default() {
        let mut factory = ConnectorFactory::new();
        factory.register(
            Arc::new(SandboxConnector::new(
                "primary".to_string(),
                PaymentRail::Ach,
                SandboxConnectorConfig::default(),
            )),
            true,
        );
        factory.register(
            Arc::new(SandboxConnector::new(
                "backup".to_string(),
                PaymentRail::Ach,
                SandboxConnectorConfig::default(),
            )),
            false,
        );

        let named = factory.resolve(Some("backup"), PaymentRail::Ach).unwrap();
        assert_eq!(named.id(), "backup");

        // Unknown id falls back to the rail default.
        let fallback = factory.resolve(Some("missing"), PaymentRail::Ach).unwrap();
        assert_eq!(fallback.id(), "primary");

        let unconfigured = factory.resolve(None, PaymentRail::Wire);
        assert!(unconfigured.is_none());
    }
}
