//! Core payout domain types shared across the service, worker and API layers.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Fixed-point money amount in minor units (cents). Two fractional digits.
/// This avoids floating point errors in balances and fees.
pub type Amount = i64;

/// Conversion factor: 1.00 in a two-decimal currency = 100 units.
pub const AMOUNT_SCALE: i64 = 100;

/// Convert an API-facing decimal amount to fixed-point minor units.
#[inline]
pub fn to_amount(value: f64) -> Amount {
    (value * AMOUNT_SCALE as f64).round() as Amount
}

/// Convert fixed-point minor units back to a decimal amount.
#[inline]
pub fn from_amount(amount: Amount) -> f64 {
    amount as f64 / AMOUNT_SCALE as f64
}

/// Currencies the engine accepts. Drawn from the rails we route today:
/// card/bank rails plus the mobile-money corridors.
pub const SUPPORTED_CURRENCIES: &[&str] = &[
    "USD", "EUR", "GBP", "CAD", "AUD", "JPY", "CHF", "NGN", "KES", "GHS", "ZAR", "XOF", "XAF",
    "EGP", "MAD", "INR", "PHP", "IDR", "BRL", "MXN",
];

pub fn is_supported_currency(code: &str) -> bool {
    code.len() == 3
        && code.bytes().all(|b| b.is_ascii_uppercase())
        && SUPPORTED_CURRENCIES.contains(&code)
}

/// Payout lifecycle states. Transitions form a DAG enforced by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Scheduled,
    Processing,
    Sent,
    Settled,
    Failed,
    Dlq,
    Reversed,
    Cancelled,
    OnHold,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Pending => "pending",
            PayoutStatus::Scheduled => "scheduled",
            PayoutStatus::Processing => "processing",
            PayoutStatus::Sent => "sent",
            PayoutStatus::Settled => "settled",
            PayoutStatus::Failed => "failed",
            PayoutStatus::Dlq => "dlq",
            PayoutStatus::Reversed => "reversed",
            PayoutStatus::Cancelled => "cancelled",
            PayoutStatus::OnHold => "on_hold",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => PayoutStatus::Pending,
            "scheduled" => PayoutStatus::Scheduled,
            "processing" => PayoutStatus::Processing,
            "sent" => PayoutStatus::Sent,
            "settled" => PayoutStatus::Settled,
            "failed" => PayoutStatus::Failed,
            "dlq" => PayoutStatus::Dlq,
            "reversed" => PayoutStatus::Reversed,
            "cancelled" => PayoutStatus::Cancelled,
            "on_hold" => PayoutStatus::OnHold,
            _ => return None,
        })
    }

    /// Terminal sinks: no transition ever leaves these.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PayoutStatus::Settled
                | PayoutStatus::Dlq
                | PayoutStatus::Reversed
                | PayoutStatus::Cancelled
        )
    }

    /// States in which the payout has not yet gone out the door and must
    /// still be backed by an active hold.
    pub fn is_pre_submit(&self) -> bool {
        matches!(
            self,
            PayoutStatus::Pending
                | PayoutStatus::Scheduled
                | PayoutStatus::Processing
                | PayoutStatus::OnHold
        )
    }
}

/// Dispatch priority tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PayoutPriority {
    Instant,
    Priority,
    #[default]
    Standard,
    Batch,
}

impl PayoutPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutPriority::Instant => "instant",
            PayoutPriority::Priority => "priority",
            PayoutPriority::Standard => "standard",
            PayoutPriority::Batch => "batch",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "instant" => PayoutPriority::Instant,
            "priority" => PayoutPriority::Priority,
            "standard" => PayoutPriority::Standard,
            "batch" => PayoutPriority::Batch,
            _ => return None,
        })
    }

    /// Integer rank for efficient DB ordering (lower = dispatched first).
    pub fn rank(&self) -> i64 {
        match self {
            PayoutPriority::Instant => 0,
            PayoutPriority::Priority => 1,
            PayoutPriority::Standard => 2,
            PayoutPriority::Batch => 3,
        }
    }

    pub fn from_rank(rank: i64) -> Self {
        match rank {
            0 => PayoutPriority::Instant,
            1 => PayoutPriority::Priority,
            3 => PayoutPriority::Batch,
            _ => PayoutPriority::Standard,
        }
    }
}

/// Payment network families a connector can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentRail {
    Ach,
    Wire,
    Sepa,
    FasterPayments,
    MobileMoney,
    WalletCredit,
}

impl PaymentRail {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentRail::Ach => "ach",
            PaymentRail::Wire => "wire",
            PaymentRail::Sepa => "sepa",
            PaymentRail::FasterPayments => "faster_payments",
            PaymentRail::MobileMoney => "mobile_money",
            PaymentRail::WalletCredit => "wallet_credit",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "ach" => PaymentRail::Ach,
            "wire" => PaymentRail::Wire,
            "sepa" => PaymentRail::Sepa,
            "faster_payments" => PaymentRail::FasterPayments,
            "mobile_money" => PaymentRail::MobileMoney,
            "wallet_credit" => PaymentRail::WalletCredit,
            _ => return None,
        })
    }

    /// Submit timeout for connectors on this rail. Wire gateways are slow;
    /// instant rails are not allowed to be.
    pub fn submit_timeout_secs(&self) -> u64 {
        match self {
            PaymentRail::Wire => 60,
            PaymentRail::Ach | PaymentRail::Sepa => 30,
            PaymentRail::FasterPayments | PaymentRail::MobileMoney | PaymentRail::WalletCredit => {
                15
            }
        }
    }
}

/// High-level method requested by the caller; mapped to a rail at routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutMethod {
    BankTransfer,
    MobileMoney,
    WalletCredit,
}

impl PayoutMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutMethod::BankTransfer => "bank_transfer",
            PayoutMethod::MobileMoney => "mobile_money",
            PayoutMethod::WalletCredit => "wallet_credit",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "bank_transfer" => PayoutMethod::BankTransfer,
            "mobile_money" => PayoutMethod::MobileMoney,
            "wallet_credit" => PayoutMethod::WalletCredit,
            _ => return None,
        })
    }

    /// Rail used when neither the caller nor the routing advisor picked one.
    pub fn default_rail(&self) -> PaymentRail {
        match self {
            PayoutMethod::BankTransfer => PaymentRail::Ach,
            PayoutMethod::MobileMoney => PaymentRail::MobileMoney,
            PayoutMethod::WalletCredit => PaymentRail::WalletCredit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldStatus {
    Active,
    Released,
    Reversed,
    Expired,
}

impl HoldStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HoldStatus::Active => "active",
            HoldStatus::Released => "released",
            HoldStatus::Reversed => "reversed",
            HoldStatus::Expired => "expired",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "active" => HoldStatus::Active,
            "released" => HoldStatus::Released,
            "reversed" => HoldStatus::Reversed,
            "expired" => HoldStatus::Expired,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceStatus {
    #[default]
    Clear,
    PendingReview,
    Blocked,
}

impl ComplianceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplianceStatus::Clear => "clear",
            ComplianceStatus::PendingReview => "pending_review",
            ComplianceStatus::Blocked => "blocked",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "clear" => ComplianceStatus::Clear,
            "pending_review" => ComplianceStatus::PendingReview,
            "blocked" => ComplianceStatus::Blocked,
            _ => return None,
        })
    }
}

/// The principal payout record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payout {
    pub id: String,
    /// Client-supplied idempotency key; globally unique when present.
    pub external_id: Option<String>,

    pub origin_module: Option<String>,
    pub origin_entity_type: Option<String>,
    pub origin_entity_id: Option<String>,

    pub beneficiary_type: String,
    pub beneficiary_id: String,
    pub beneficiary_account: Option<String>,

    pub amount_cents: Amount,
    pub fee_cents: Amount,
    pub bank_fee_cents: Amount,
    /// Invariant: always amount + fee + bank_fee.
    pub total_cost_cents: Amount,
    pub currency: String,

    pub method: PayoutMethod,
    pub priority: PayoutPriority,

    pub requested_settlement_date: Option<NaiveDate>,
    pub scheduled_at: Option<i64>,

    pub connector_id: Option<String>,
    pub rail: Option<PaymentRail>,
    pub bank_reference: Option<String>,

    pub status: PayoutStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<i64>,
    pub last_error: Option<String>,
    pub last_error_code: Option<String>,

    pub sla_target_settlement_date: Option<NaiveDate>,
    pub sla_cutoff_time: Option<String>,
    pub sla_violated: bool,
    pub sla_violation_reason: Option<String>,

    pub routing_score: Option<f64>,
    pub routing_reason: Option<String>,
    pub routing_predicted_hours: Option<f64>,

    pub tenant_type: String,
    pub tenant_id: String,
    pub country: Option<String>,
    pub compliance_status: ComplianceStatus,

    pub hold_id: Option<String>,
    pub ledger_entry_id: Option<String>,
    pub reconciliation_id: Option<String>,

    /// Free-form JSON blob carried through from the caller.
    pub metadata: Option<String>,

    pub created_by: Option<String>,
    pub approved_by: Option<String>,

    pub created_at: i64,
    pub updated_at: i64,
    pub processed_at: Option<i64>,
    pub sent_at: Option<i64>,
    pub settled_at: Option<i64>,
    pub failed_at: Option<i64>,
    pub reversed_at: Option<i64>,
    pub cancelled_at: Option<i64>,
}

impl Payout {
    /// Ledger account the tenant's funds are drawn from.
    pub fn tenant_balance_account(&self) -> String {
        format!("{}:{}:available_balance", self.tenant_type, self.tenant_id)
    }
}

/// Pre-authorization reserving funds for a pending payout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutHold {
    pub id: String,
    pub payout_id: String,
    pub amount_cents: Amount,
    pub currency: String,
    pub debit_account: String,
    pub credit_account: String,
    pub status: HoldStatus,
    pub expires_at: i64,
    pub ledger_entry_id: Option<String>,
    pub created_at: i64,
    pub released_at: Option<i64>,
    pub reversed_at: Option<i64>,
}

/// Intake request as received from the HTTP edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePayoutRequest {
    #[serde(default)]
    pub idempotency_key: Option<String>,

    #[serde(default)]
    pub origin_module: Option<String>,
    #[serde(default)]
    pub origin_entity_type: Option<String>,
    #[serde(default)]
    pub origin_entity_id: Option<String>,

    pub beneficiary_type: String,
    pub beneficiary_id: String,
    #[serde(default)]
    pub beneficiary_account: Option<String>,

    /// Decimal amount; converted to minor units at intake.
    pub amount: f64,
    pub currency: String,
    pub method: PayoutMethod,
    #[serde(default)]
    pub priority: PayoutPriority,

    #[serde(default)]
    pub requested_settlement_date: Option<NaiveDate>,
    #[serde(default)]
    pub scheduled_at: Option<i64>,

    #[serde(default)]
    pub connector_id: Option<String>,
    #[serde(default)]
    pub rail: Option<PaymentRail>,

    pub tenant_type: String,
    pub tenant_id: String,
    #[serde(default)]
    pub country: Option<String>,

    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub created_by: Option<String>,
}

/// Scoped SLA rule. Null scope columns are wildcards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaRule {
    pub id: i64,
    pub connector_id: Option<String>,
    pub rail: Option<PaymentRail>,
    pub country: Option<String>,
    pub currency: Option<String>,
    pub priority: Option<PayoutPriority>,
    /// Wall-clock submission cutoff, "HH:MM".
    pub cutoff_time: Option<String>,
    pub processing_days: u32,
    pub settlement_days: u32,
    pub exclude_weekends: bool,
    pub exclude_holidays: bool,
    pub base_fee_cents: Amount,
    /// Percentage fee in basis points of the payout amount.
    pub percentage_fee_bps: i64,
    pub min_fee_cents: Amount,
    pub max_fee_cents: Amount,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Collecting,
    Locked,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Collecting => "collecting",
            BatchStatus::Locked => "locked",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => BatchStatus::Pending,
            "collecting" => BatchStatus::Collecting,
            "locked" => BatchStatus::Locked,
            "processing" => BatchStatus::Processing,
            "completed" => BatchStatus::Completed,
            "failed" => BatchStatus::Failed,
            "cancelled" => BatchStatus::Cancelled,
            _ => return None,
        })
    }
}

/// Scheduled payout grouping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub name: String,
    pub batch_type: String,
    /// Five-field cron expression for recurring batches.
    pub cron_expr: Option<String>,
    pub scheduled_at: Option<i64>,
    pub status: BatchStatus,
    pub total_items: u32,
    pub completed_items: u32,
    pub failed_items: u32,
    pub connector_id: Option<String>,
    pub rail: Option<PaymentRail>,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub batch_id: String,
    pub payout_id: String,
    pub seq: i64,
    pub status: PayoutStatus,
    pub error: Option<String>,
}

/// Append-only record of one retry decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryLogEntry {
    pub id: i64,
    pub payout_id: String,
    pub attempt: u32,
    pub outcome: String,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub next_retry_at: Option<i64>,
    pub backoff_secs: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    System,
    User,
    Service,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::System => "system",
            ActorType::User => "user",
            ActorType::Service => "service",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "system" => ActorType::System,
            "user" => ActorType::User,
            "service" => ActorType::Service,
            _ => return None,
        })
    }
}

/// Immutable audit trail entry. Ids are monotonic per database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: i64,
    pub payout_id: String,
    pub event_type: String,
    pub old_status: Option<String>,
    pub new_status: Option<String>,
    pub details: Option<String>,
    pub actor_type: ActorType,
    pub actor_id: Option<String>,
    pub service: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "low" => AlertSeverity::Low,
            "medium" => AlertSeverity::Medium,
            "high" => AlertSeverity::High,
            "critical" => AlertSeverity::Critical,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    HighValue,
    Dlq,
    PermanentFailure,
    SlaViolation,
    HoldExpired,
    BatchFailed,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::HighValue => "high_value",
            AlertKind::Dlq => "dlq",
            AlertKind::PermanentFailure => "permanent_failure",
            AlertKind::SlaViolation => "sla_violation",
            AlertKind::HoldExpired => "hold_expired",
            AlertKind::BatchFailed => "batch_failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "high_value" => AlertKind::HighValue,
            "dlq" => AlertKind::Dlq,
            "permanent_failure" => AlertKind::PermanentFailure,
            "sla_violation" => AlertKind::SlaViolation,
            "hold_expired" => AlertKind::HoldExpired,
            "batch_failed" => AlertKind::BatchFailed,
            _ => return None,
        })
    }
}

/// Operational alert with a resolution lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub payout_id: Option<String>,
    pub batch_id: Option<String>,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub details: Option<String>,
    pub notified: bool,
    pub resolved: bool,
    pub resolved_by: Option<String>,
    pub resolution_note: Option<String>,
    pub resolved_at: Option<i64>,
    pub created_at: i64,
}

/// Filter for the payout listing surface.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PayoutFilter {
    pub tenant_id: Option<String>,
    pub status: Option<PayoutStatus>,
    pub beneficiary_id: Option<String>,
    pub created_after: Option<i64>,
    pub created_before: Option<i64>,
}

/// One bucket of the per-tenant stats rollup.
#[derive(Debug, Clone, Serialize)]
pub struct StatusBucket {
    pub count: u64,
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PayoutStats {
    pub by_status: std::collections::HashMap<String, StatusBucket>,
    pub avg_settlement_hours: Option<f64>,
}
