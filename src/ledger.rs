//! Ledger collaborator contract and the hold lifecycle built on top of it.
//!
//! The engine never posts double-entry rows itself; it hands hold intents
//! to a `LedgerClient` and keeps the returned entry ids. Deployments point
//! `LEDGER_URL` at the ledger engine; dev and tests run the in-memory one.

use crate::models::{Amount, HoldStatus, Payout, PayoutHold};
use crate::store::PayoutDb;
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Credit account all pending payout funds are parked against.
pub const PENDING_PAYOUTS_ACCOUNT: &str = "payouts:pending";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Amount, available: Amount },

    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn available_balance(&self, account: &str, currency: &str)
        -> Result<Amount, LedgerError>;

    /// Post a hold intent; returns the ledger entry id backing the hold.
    async fn create_hold_entry(
        &self,
        payout_id: &str,
        debit_account: &str,
        credit_account: &str,
        amount: Amount,
        currency: &str,
    ) -> Result<String, LedgerError>;

    async fn release_hold(&self, ledger_entry_id: &str) -> Result<(), LedgerError>;

    async fn reverse_hold(&self, ledger_entry_id: &str, reason: &str) -> Result<(), LedgerError>;

    /// Final double-entry posting once a payout settles.
    async fn final_post(
        &self,
        payout_id: &str,
        debit_account: &str,
        credit_account: &str,
        amount: Amount,
        currency: &str,
    ) -> Result<String, LedgerError>;
}

/// In-process ledger for dev and tests. Tracks per-(account, currency)
/// balances and refuses holds beyond the available balance.
#[derive(Default)]
pub struct InMemoryLedger {
    balances: Mutex<HashMap<(String, String), Amount>>,
    entries: Mutex<HashMap<String, (String, Amount, String)>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/dev helper: fund an account.
    pub fn deposit(&self, account: &str, currency: &str, amount: Amount) {
        let mut balances = self.balances.lock();
        *balances
            .entry((account.to_string(), currency.to_string()))
            .or_insert(0) += amount;
    }

    pub fn balance(&self, account: &str, currency: &str) -> Amount {
        let balances = self.balances.lock();
        balances
            .get(&(account.to_string(), currency.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    async fn available_balance(
        &self,
        account: &str,
        currency: &str,
    ) -> Result<Amount, LedgerError> {
        Ok(self.balance(account, currency))
    }

    async fn create_hold_entry(
        &self,
        payout_id: &str,
        debit_account: &str,
        _credit_account: &str,
        amount: Amount,
        currency: &str,
    ) -> Result<String, LedgerError> {
        let mut balances = self.balances.lock();
        let key = (debit_account.to_string(), currency.to_string());
        let available = balances.get(&key).copied().unwrap_or(0);
        if available < amount {
            return Err(LedgerError::InsufficientFunds {
                required: amount,
                available,
            });
        }
        *balances.entry(key).or_insert(0) -= amount;

        let entry_id = format!("le-{}", Uuid::new_v4());
        self.entries.lock().insert(
            entry_id.clone(),
            (debit_account.to_string(), amount, currency.to_string()),
        );
        let _ = payout_id;
        Ok(entry_id)
    }

    async fn release_hold(&self, ledger_entry_id: &str) -> Result<(), LedgerError> {
        // Funds moved out for good; the entry is simply closed.
        self.entries.lock().remove(ledger_entry_id);
        Ok(())
    }

    async fn reverse_hold(&self, ledger_entry_id: &str, _reason: &str) -> Result<(), LedgerError> {
        if let Some((account, amount, currency)) = self.entries.lock().remove(ledger_entry_id) {
            let mut balances = self.balances.lock();
            *balances.entry((account, currency)).or_insert(0) += amount;
        }
        Ok(())
    }

    async fn final_post(
        &self,
        payout_id: &str,
        _debit_account: &str,
        _credit_account: &str,
        _amount: Amount,
        _currency: &str,
    ) -> Result<String, LedgerError> {
        Ok(format!("fp-{}", payout_id))
    }
}

#[derive(Debug, Deserialize)]
struct LedgerEntryResponse {
    entry_id: String,
}

#[derive(Debug, Deserialize)]
struct LedgerBalanceResponse {
    balance_cents: Amount,
}

/// Remote ledger engine over HTTP.
pub struct HttpLedgerClient {
    client: Client,
    base_url: String,
}

impl HttpLedgerClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build ledger HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn unavailable(e: reqwest::Error) -> LedgerError {
        LedgerError::Unavailable(e.to_string())
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn available_balance(
        &self,
        account: &str,
        currency: &str,
    ) -> Result<Amount, LedgerError> {
        let url = format!("{}/accounts/balance", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("account", account), ("currency", currency)])
            .send()
            .await
            .map_err(Self::unavailable)?;
        if !resp.status().is_success() {
            return Err(LedgerError::Unavailable(format!(
                "balance query returned {}",
                resp.status()
            )));
        }
        let body: LedgerBalanceResponse = resp.json().await.map_err(Self::unavailable)?;
        Ok(body.balance_cents)
    }

    async fn create_hold_entry(
        &self,
        payout_id: &str,
        debit_account: &str,
        credit_account: &str,
        amount: Amount,
        currency: &str,
    ) -> Result<String, LedgerError> {
        let url = format!("{}/holds", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "payout_id": payout_id,
                "debit_account": debit_account,
                "credit_account": credit_account,
                "amount_cents": amount,
                "currency": currency,
            }))
            .send()
            .await
            .map_err(Self::unavailable)?;

        if resp.status() == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
            return Err(LedgerError::InsufficientFunds {
                required: amount,
                available: 0,
            });
        }
        if !resp.status().is_success() {
            return Err(LedgerError::Unavailable(format!(
                "hold post returned {}",
                resp.status()
            )));
        }
        let body: LedgerEntryResponse = resp.json().await.map_err(Self::unavailable)?;
        Ok(body.entry_id)
    }

    async fn release_hold(&self, ledger_entry_id: &str) -> Result<(), LedgerError> {
        let url = format!("{}/holds/{}/release", self.base_url, ledger_entry_id);
        let resp = self.client.post(&url).send().await.map_err(Self::unavailable)?;
        if !resp.status().is_success() {
            return Err(LedgerError::Unavailable(format!(
                "hold release returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn reverse_hold(&self, ledger_entry_id: &str, reason: &str) -> Result<(), LedgerError> {
        let url = format!("{}/holds/{}/reverse", self.base_url, ledger_entry_id);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({"reason": reason}))
            .send()
            .await
            .map_err(Self::unavailable)?;
        if !resp.status().is_success() {
            return Err(LedgerError::Unavailable(format!(
                "hold reverse returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn final_post(
        &self,
        payout_id: &str,
        debit_account: &str,
        credit_account: &str,
        amount: Amount,
        currency: &str,
    ) -> Result<String, LedgerError> {
        let url = format!("{}/postings", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "payout_id": payout_id,
                "debit_account": debit_account,
                "credit_account": credit_account,
                "amount_cents": amount,
                "currency": currency,
            }))
            .send()
            .await
            .map_err(Self::unavailable)?;
        if !resp.status().is_success() {
            return Err(LedgerError::Unavailable(format!(
                "final post returned {}",
                resp.status()
            )));
        }
        let body: LedgerEntryResponse = resp.json().await.map_err(Self::unavailable)?;
        Ok(body.entry_id)
    }
}

/// Hold lifecycle manager: builds hold intents against the ledger and runs
/// the expiry sweep. Hold rows themselves are written by the store inside
/// the payout transactions.
pub struct HoldManager {
    db: PayoutDb,
    ledger: Arc<dyn LedgerClient>,
    hold_ttl_secs: i64,
}

impl HoldManager {
    pub fn new(db: PayoutDb, ledger: Arc<dyn LedgerClient>, hold_ttl_secs: i64) -> Self {
        Self {
            db,
            ledger,
            hold_ttl_secs,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerClient> {
        &self.ledger
    }

    /// Post the hold intent and build the hold row for the creation
    /// transaction. Amount is the payout's full cost; accounts follow the
    /// `{tenant}:available_balance` / `payouts:pending` convention.
    pub async fn open_hold(&self, payout: &Payout, now: i64) -> Result<PayoutHold, LedgerError> {
        let debit_account = payout.tenant_balance_account();
        let ledger_entry_id = self
            .ledger
            .create_hold_entry(
                &payout.id,
                &debit_account,
                PENDING_PAYOUTS_ACCOUNT,
                payout.total_cost_cents,
                &payout.currency,
            )
            .await?;

        Ok(PayoutHold {
            id: Uuid::new_v4().to_string(),
            payout_id: payout.id.clone(),
            amount_cents: payout.total_cost_cents,
            currency: payout.currency.clone(),
            debit_account,
            credit_account: PENDING_PAYOUTS_ACCOUNT.to_string(),
            status: HoldStatus::Active,
            expires_at: now + self.hold_ttl_secs,
            ledger_entry_id: Some(ledger_entry_id),
            created_at: now,
            released_at: None,
            reversed_at: None,
        })
    }

    /// Post-commit ledger release. Best-effort: the durable hold row is the
    /// source of truth and a reconciliation pass settles any drift.
    pub async fn ledger_release(&self, ledger_entry_id: Option<&str>) {
        let Some(entry_id) = ledger_entry_id else {
            return;
        };
        if let Err(e) = self.ledger.release_hold(entry_id).await {
            warn!("ledger release of {} failed: {}", entry_id, e);
        }
    }

    /// Post-commit ledger reversal. Best-effort, as above.
    pub async fn ledger_reverse(&self, ledger_entry_id: Option<&str>, reason: &str) {
        let Some(entry_id) = ledger_entry_id else {
            return;
        };
        if let Err(e) = self.ledger.reverse_hold(entry_id, reason).await {
            warn!("ledger reversal of {} failed: {}", entry_id, e);
        }
    }

    /// Expire active holds whose payout never went out. Returns the expired
    /// pairs so the caller can raise alerts.
    pub async fn sweep_expired(&self, now: i64) -> Result<Vec<(PayoutHold, Payout)>> {
        let expired = self.db.expire_overdue_holds(now)?;
        for (hold, payout) in &expired {
            info!(
                "⏰ Hold {} for payout {} expired, payout failed",
                hold.id, payout.id
            );
            self.ledger_reverse(hold.ledger_entry_id.as_deref(), "hold_expired")
                .await;
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_ledger_holds_and_reversals() {
        let ledger = InMemoryLedger::new();
        ledger.deposit("merchant:t1:available_balance", "USD", 10_000);

        let entry = ledger
            .create_hold_entry("p1", "merchant:t1:available_balance", PENDING_PAYOUTS_ACCOUNT, 4_000, "USD")
            .await
            .unwrap();
        assert_eq!(ledger.balance("merchant:t1:available_balance", "USD"), 6_000);

        // Reversal returns the funds.
        ledger.reverse_hold(&entry, "test").await.unwrap();
        assert_eq!(ledger.balance("merchant:t1:available_balance", "USD"), 10_000);
    }

    #[tokio::test]
    async fn in_memory_ledger_rejects_overdraw() {
        let ledger = InMemoryLedger::new();
        ledger.deposit("merchant:t1:available_balance", "USD", 100);

        let err = ledger
            .create_hold_entry("p1", "merchant:t1:available_balance", PENDING_PAYOUTS_ACCOUNT, 200, "USD")
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        // No partial debit.
        assert_eq!(ledger.balance("merchant:t1:available_balance", "USD"), 100);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let ledger = InMemoryLedger::new();
        ledger.deposit("a", "USD", 1_000);
        let entry = ledger
            .create_hold_entry("p1", "a", PENDING_PAYOUTS_ACCOUNT, 500, "USD")
            .await
            .unwrap();
        ledger.release_hold(&entry).await.unwrap();
        ledger.release_hold(&entry).await.unwrap();
        // Released funds stay gone; double release must not re-credit.
        assert_eq!(ledger.balance("a", "USD"), 500);
    }
}
