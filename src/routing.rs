//! Routing advisor collaborator.
//!
//! The advisor scores candidate (connector, rail) routes for a payout. It
//! is strictly advisory: any error, timeout or empty answer falls back to
//! the caller's requested routing, so the budget for the call is tight.

use crate::models::{Amount, PayoutMethod, PayoutPriority, PaymentRail};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Hard budget for one advisor round trip.
const ADVISOR_TIMEOUT_MS: u64 = 500;

#[derive(Debug, Clone, Serialize)]
pub struct RoutingFeatures<'a> {
    pub amount_cents: Amount,
    pub currency: &'a str,
    pub method: PayoutMethod,
    pub priority: PayoutPriority,
    pub country: Option<&'a str>,
    pub tenant_id: &'a str,
    pub requested_connector: Option<&'a str>,
    pub requested_rail: Option<PaymentRail>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingRecommendation {
    /// Confidence score in [0, 1].
    pub score: f64,
    pub connector_id: String,
    pub rail: PaymentRail,
    #[serde(default)]
    pub estimated_settlement_hours: Option<f64>,
    #[serde(default)]
    pub explanation: Option<String>,
}

#[async_trait]
pub trait RoutingAdvisor: Send + Sync {
    /// None means "no opinion"; the caller proceeds with its own routing.
    async fn predict(&self, features: &RoutingFeatures<'_>) -> Option<RoutingRecommendation>;
}

/// Advisor that never has an opinion; used when no endpoint is configured.
pub struct NoopRoutingAdvisor;

#[async_trait]
impl RoutingAdvisor for NoopRoutingAdvisor {
    async fn predict(&self, _features: &RoutingFeatures<'_>) -> Option<RoutingRecommendation> {
        None
    }
}

/// HTTP advisor client.
pub struct HttpRoutingAdvisor {
    client: Client,
    url: String,
}

impl HttpRoutingAdvisor {
    pub fn new(url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(ADVISOR_TIMEOUT_MS))
            .build()
            .context("Failed to build routing advisor HTTP client")?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl RoutingAdvisor for HttpRoutingAdvisor {
    async fn predict(&self, features: &RoutingFeatures<'_>) -> Option<RoutingRecommendation> {
        let response = match self.client.post(&self.url).json(features).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("routing advisor unreachable: {}", e);
                return None;
            }
        };
        if !response.status().is_success() {
            warn!("routing advisor returned {}", response.status());
            return None;
        }
        match response.json::<RoutingRecommendation>().await {
            Ok(rec) if (0.0..=1.0).contains(&rec.score) => {
                debug!(
                    "routing advisor: {} via {} (score {:.2})",
                    rec.connector_id,
                    rec.rail.as_str(),
                    rec.score
                );
                Some(rec)
            }
            Ok(rec) => {
                warn!("routing advisor score {} out of range, ignoring", rec.score);
                None
            }
            Err(e) => {
                warn!("routing advisor response unparseable: {}", e);
                None
            }
        }
    }
}

/// Fixed-answer advisor for tests.
pub struct FixedRoutingAdvisor(pub Option<RoutingRecommendation>);

#[async_trait]
impl RoutingAdvisor for FixedRoutingAdvisor {
    async fn predict(&self, _features: &RoutingFeatures<'_>) -> Option<RoutingRecommendation> {
        self.0.clone()
    }
}
