//! Business-visible error taxonomy for the payout engine.
//!
//! The intake path surfaces these to the caller; the worker never does.
//! It persists failures on the payout row and keeps looping.

use crate::models::PayoutStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PayoutError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("insufficient balance: required {required_cents}, available {available_cents}")]
    InsufficientBalance {
        required_cents: i64,
        available_cents: i64,
    },

    #[error("not authorized")]
    NotAuthorized,

    #[error("payout not found: {0}")]
    NotFound(String),

    #[error("idempotency key already used with a different payload")]
    DuplicateKeyCollision,

    #[error("payout in status {0:?} cannot be cancelled")]
    NotCancellable(PayoutStatus),

    #[error("payout in status {0:?} cannot be retried")]
    NotRetryable(PayoutStatus),

    #[error("invalid status transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: PayoutStatus,
        to: PayoutStatus,
    },

    #[error("alert already resolved")]
    AlreadyResolved,

    #[error("alert not found: {0}")]
    AlertNotFound(String),

    #[error("batch not found: {0}")]
    BatchNotFound(String),

    #[error("batch in invalid state: {0}")]
    BatchState(String),

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl PayoutError {
    /// Stable machine-readable kind, used in API bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PayoutError::InvalidRequest(_) => "invalid_request",
            PayoutError::InsufficientBalance { .. } => "insufficient_balance",
            PayoutError::NotAuthorized => "not_authorized",
            PayoutError::NotFound(_) => "not_found",
            PayoutError::DuplicateKeyCollision => "duplicate_key_collision",
            PayoutError::NotCancellable(_) => "not_cancellable",
            PayoutError::NotRetryable(_) => "not_retryable",
            PayoutError::InvalidTransition { .. } => "invalid_transition",
            PayoutError::AlreadyResolved => "already_resolved",
            PayoutError::AlertNotFound(_) => "not_found",
            PayoutError::BatchNotFound(_) => "not_found",
            PayoutError::BatchState(_) => "batch_state",
            PayoutError::Ledger(_) => "ledger_error",
            PayoutError::Storage(_) => "internal",
        }
    }
}

pub type PayoutResult<T> = Result<T, PayoutError>;
