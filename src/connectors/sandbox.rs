//! Simulated bank connector for dev environments and tests.

use super::{
    BankConnector, ConnectorHealth, SubmitRequest, SubmitResult, PERMANENT_INVALID_ACCOUNT,
    TRANSIENT_UPSTREAM,
};
use crate::models::PaymentRail;
use anyhow::Result;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{sleep, Duration};
use uuid::Uuid;

/// Tunable failure and latency injection.
#[derive(Debug, Clone)]
pub struct SandboxConnectorConfig {
    /// Base latency in ms (random jitter added on top).
    pub base_latency_ms: u64,
    pub latency_jitter_ms: u64,
    /// Probability of a transient gateway error (0.0 to 1.0).
    pub transient_failure_prob: f64,
    /// Probability of a permanent rejection (0.0 to 1.0).
    pub permanent_failure_prob: f64,
    /// Whether accepted submissions settle synchronously.
    pub instant_settlement: bool,
}

impl Default for SandboxConnectorConfig {
    fn default() -> Self {
        Self {
            base_latency_ms: 20,
            latency_jitter_ms: 30,
            transient_failure_prob: 0.0,
            permanent_failure_prob: 0.0,
            instant_settlement: false,
        }
    }
}

impl SandboxConnectorConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("SANDBOX_BASE_LATENCY_MS") {
            if let Ok(ms) = v.parse() {
                config.base_latency_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("SANDBOX_LATENCY_JITTER_MS") {
            if let Ok(ms) = v.parse() {
                config.latency_jitter_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("SANDBOX_TRANSIENT_FAILURE_PROB") {
            if let Ok(p) = v.parse() {
                config.transient_failure_prob = p;
            }
        }
        if let Ok(v) = std::env::var("SANDBOX_PERMANENT_FAILURE_PROB") {
            if let Ok(p) = v.parse() {
                config.permanent_failure_prob = p;
            }
        }
        config
    }
}

pub struct SandboxConnector {
    id: String,
    rail: PaymentRail,
    config: SandboxConnectorConfig,
}

impl SandboxConnector {
    pub fn new(id: String, rail: PaymentRail, config: SandboxConnectorConfig) -> Self {
        // Instant rails settle synchronously in the sandbox too.
        let config = SandboxConnectorConfig {
            instant_settlement: config.instant_settlement
                || matches!(
                    rail,
                    PaymentRail::FasterPayments | PaymentRail::WalletCredit
                ),
            ..config
        };
        Self { id, rail, config }
    }
}

#[async_trait]
impl BankConnector for SandboxConnector {
    fn id(&self) -> &str {
        &self.id
    }

    fn rail(&self) -> PaymentRail {
        self.rail
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitResult> {
        let mut rng = StdRng::from_entropy();

        // Simulate gateway latency.
        let jitter: u64 = rng.gen_range(0..=self.config.latency_jitter_ms);
        sleep(Duration::from_millis(self.config.base_latency_ms + jitter)).await;

        if rng.gen::<f64>() < self.config.permanent_failure_prob {
            return Ok(SubmitResult::rejected(
                PERMANENT_INVALID_ACCOUNT,
                "beneficiary account rejected (simulated)",
            ));
        }
        if rng.gen::<f64>() < self.config.transient_failure_prob {
            return Ok(SubmitResult::rejected(
                TRANSIENT_UPSTREAM,
                "gateway unavailable (simulated)",
            ));
        }

        let reference = format!(
            "{}-{}",
            self.rail.as_str().to_uppercase(),
            Uuid::new_v4().simple()
        );
        let _ = request;
        Ok(SubmitResult::accepted(
            reference,
            self.config.instant_settlement,
        ))
    }

    async fn health_check(&self) -> ConnectorHealth {
        ConnectorHealth {
            healthy: true,
            message: Some("sandbox".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SubmitRequest {
        SubmitRequest {
            payout_id: "p1".to_string(),
            amount_cents: 10_000,
            currency: "USD".to_string(),
            beneficiary_type: "vendor".to_string(),
            beneficiary_id: "ben-1".to_string(),
            beneficiary_account: Some("acct-1".to_string()),
            rail: PaymentRail::Ach,
            country: Some("US".to_string()),
            reference: "p1".to_string(),
        }
    }

    #[tokio::test]
    async fn accepts_by_default() {
        let connector = SandboxConnector::new(
            "sandbox".to_string(),
            PaymentRail::Ach,
            SandboxConnectorConfig {
                base_latency_ms: 0,
                latency_jitter_ms: 0,
                ..Default::default()
            },
        );
        let result = connector.submit(&request()).await.unwrap();
        assert!(result.success);
        assert!(result.bank_reference.unwrap().starts_with("ACH-"));
        assert!(!result.instant_settlement);
    }

    #[tokio::test]
    async fn wallet_rail_settles_instantly() {
        let connector = SandboxConnector::new(
            "sandbox".to_string(),
            PaymentRail::WalletCredit,
            SandboxConnectorConfig {
                base_latency_ms: 0,
                latency_jitter_ms: 0,
                ..Default::default()
            },
        );
        let result = connector.submit(&request()).await.unwrap();
        assert!(result.success);
        assert!(result.instant_settlement);
    }

    #[tokio::test]
    async fn forced_permanent_failure() {
        let connector = SandboxConnector::new(
            "sandbox".to_string(),
            PaymentRail::Ach,
            SandboxConnectorConfig {
                base_latency_ms: 0,
                latency_jitter_ms: 0,
                permanent_failure_prob: 1.0,
                ..Default::default()
            },
        );
        let result = connector.submit(&request()).await.unwrap();
        assert!(!result.success);
        assert_eq!(
            result.error_code.as_deref(),
            Some(PERMANENT_INVALID_ACCOUNT)
        );
    }
}
