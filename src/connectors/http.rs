//! HTTP bank gateway connector with HMAC-signed requests.

use super::{
    BankConnector, ConnectorHealth, SubmitRequest, SubmitResult, TRANSIENT_NETWORK,
    TRANSIENT_RATE_LIMITED, TRANSIENT_TIMEOUT, TRANSIENT_UPSTREAM,
};
use crate::models::PaymentRail;
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct HttpConnectorCredentials {
    pub api_key: String,
    pub api_secret: String,
}

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    #[serde(default)]
    accepted: bool,
    #[serde(default)]
    bank_reference: Option<String>,
    #[serde(default)]
    instant_settlement: bool,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    bank_fee_cents: Option<i64>,
}

/// Connector speaking a JSON bank gateway. One instance per (id, rail).
pub struct HttpBankConnector {
    id: String,
    rail: PaymentRail,
    base_url: String,
    creds: HttpConnectorCredentials,
    client: Client,
}

impl std::fmt::Debug for HttpBankConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBankConnector")
            .field("id", &self.id)
            .field("rail", &self.rail.as_str())
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl HttpBankConnector {
    pub fn new(
        id: String,
        rail: PaymentRail,
        base_url: &str,
        creds: HttpConnectorCredentials,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(rail.submit_timeout_secs()))
            .build()
            .context("Failed to build connector HTTP client")?;
        Ok(Self {
            id,
            rail,
            base_url: base_url.trim_end_matches('/').to_string(),
            creds,
            client,
        })
    }

    /// Gateway connector configured from `CONNECTOR_<RAIL>_URL` /
    /// `_API_KEY` / `_API_SECRET` variables, when all three are present.
    pub fn from_env(id: &str, rail: PaymentRail) -> Option<Self> {
        let prefix = format!("CONNECTOR_{}", rail.as_str().to_uppercase());
        let base_url = std::env::var(format!("{}_URL", prefix)).ok()?;
        let api_key = std::env::var(format!("{}_API_KEY", prefix)).ok()?;
        let api_secret = std::env::var(format!("{}_API_SECRET", prefix)).ok()?;
        Self::new(
            id.to_string(),
            rail,
            &base_url,
            HttpConnectorCredentials {
                api_key,
                api_secret,
            },
        )
        .ok()
    }

    fn sign_request(&self, method: &str, path: &str, body: &str, timestamp: i64) -> Result<String> {
        let message = format!("{}{}{}{}", timestamp, method, path, body);
        let mut mac = HmacSha256::new_from_slice(self.creds.api_secret.as_bytes())
            .context("invalid HMAC key")?;
        mac.update(message.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    fn auth_headers(&self, method: &str, path: &str, body: &str) -> Result<Vec<(String, String)>> {
        let timestamp = Utc::now().timestamp();
        let signature = self.sign_request(method, path, body, timestamp)?;
        Ok(vec![
            ("X-Api-Key".to_string(), self.creds.api_key.clone()),
            ("X-Signature".to_string(), signature),
            ("X-Timestamp".to_string(), timestamp.to_string()),
        ])
    }
}

#[async_trait::async_trait]
impl BankConnector for HttpBankConnector {
    fn id(&self) -> &str {
        &self.id
    }

    fn rail(&self) -> PaymentRail {
        self.rail
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitResult> {
        let path = "/v1/payouts";
        let body = serde_json::to_string(request).context("serialize submit request")?;
        let headers = self.auth_headers("POST", path, &body)?;
        let url = format!("{}{}", self.base_url, path);

        debug!(url = %url, payout = %request.payout_id, "submitting payout to gateway");

        let mut req = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .body(body);
        for (key, value) in headers {
            req = req.header(&key, &value);
        }

        let response = match req.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Ok(SubmitResult::rejected(
                    TRANSIENT_TIMEOUT,
                    format!("gateway timeout: {}", e),
                ));
            }
            Err(e) => {
                return Ok(SubmitResult::rejected(
                    TRANSIENT_NETWORK,
                    format!("gateway unreachable: {}", e),
                ));
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Ok(SubmitResult::rejected(
                TRANSIENT_RATE_LIMITED,
                "gateway rate limit",
            ));
        }
        if status.is_server_error() {
            return Ok(SubmitResult::rejected(
                TRANSIENT_UPSTREAM,
                format!("gateway returned {}", status),
            ));
        }

        let body: GatewayResponse = response.json().await.context("parse gateway response")?;
        if body.accepted {
            let reference = body
                .bank_reference
                .unwrap_or_else(|| request.reference.clone());
            let mut result = SubmitResult::accepted(reference, body.instant_settlement);
            result.bank_fee_cents = body.bank_fee_cents;
            Ok(result)
        } else {
            let code = body
                .error_code
                .unwrap_or_else(|| TRANSIENT_UPSTREAM.to_string());
            warn!(
                payout = %request.payout_id,
                code = %code,
                "gateway rejected payout"
            );
            Ok(SubmitResult {
                success: false,
                bank_reference: None,
                instant_settlement: false,
                error_message: body.error_message.or_else(|| Some(code.clone())),
                error_code: Some(code),
                bank_fee_cents: None,
            })
        }
    }

    async fn health_check(&self) -> ConnectorHealth {
        let url = format!("{}/v1/health", self.base_url);
        match self.client.get(&url).send().await {
            Ok(r) if r.status().is_success() => ConnectorHealth {
                healthy: true,
                message: None,
            },
            Ok(r) => ConnectorHealth {
                healthy: false,
                message: Some(format!("gateway returned {}", r.status())),
            },
            Err(e) => ConnectorHealth {
                healthy: false,
                message: Some(e.to_string()),
            },
        }
    }
}
