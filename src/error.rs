//! Ledger error types
//!
//! [`BankError`] is what every orchestrator and service call returns. Store
//! failures are classified on conversion from [`DbError`] so callers can
//! branch on conflict vs. transient vs. not-found without inspecting
//! strings; the original [`DbError`] stays reachable through `source()`.

use thiserror::Error;

use crate::db::DbError;
use crate::validation::ValidationError;

#[derive(Error, Debug)]
pub enum BankError {
    // === Validation (rejected before any transaction begins) ===
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    // === Business rules (checked under row lock, zero effect) ===
    #[error("insufficient funds in account {account_id}: balance {balance}, amount {amount}")]
    InsufficientFunds {
        account_id: i64,
        balance: i64,
        amount: i64,
    },

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    // === Store ===
    #[error("conflict: {0}")]
    Conflict(#[source] DbError),

    #[error("transient store failure: {0}")]
    Transient(#[source] DbError),

    #[error("store error: {0}")]
    Store(#[source] DbError),

    /// The unit of work failed and so did the rollback. Both are kept.
    #[error("tx err: {cause}, rb err: {rollback}")]
    Rollback {
        #[source]
        cause: Box<BankError>,
        rollback: DbError,
    },

    // === Side effects ===
    #[error("after-create hook failed: {0}")]
    AfterCreate(#[source] anyhow::Error),

    // === Cancellation ===
    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl BankError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        BankError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    /// Map `DbError::NotFound` to a typed not-found for `entity`, classify
    /// everything else.
    pub fn from_lookup(entity: &'static str, key: impl ToString, err: DbError) -> Self {
        match err {
            DbError::NotFound => Self::not_found(entity, key),
            other => other.into(),
        }
    }

    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            BankError::Validation(_) => "INVALID_ARGUMENT",
            BankError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            BankError::NotFound { .. } => "NOT_FOUND",
            BankError::Conflict(_) => "CONFLICT",
            BankError::Transient(_) => "UNAVAILABLE",
            BankError::Store(_) => "INTERNAL",
            BankError::Rollback { .. } => "INTERNAL",
            BankError::AfterCreate(_) => "INTERNAL",
            BankError::Cancelled => "CANCELLED",
            BankError::DeadlineExceeded => "DEADLINE_EXCEEDED",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            BankError::Validation(_) => 400,
            BankError::NotFound { .. } => 404,
            BankError::Conflict(_) => 409,
            BankError::InsufficientFunds { .. } => 422,
            BankError::Cancelled => 499,
            BankError::Store(_) | BankError::Rollback { .. } | BankError::AfterCreate(_) => 500,
            BankError::Transient(_) => 503,
            BankError::DeadlineExceeded => 504,
        }
    }

    /// Whether re-running the whole operation from scratch may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            BankError::Transient(_) => true,
            BankError::Rollback { cause, .. } => cause.is_retryable(),
            _ => false,
        }
    }

    /// The underlying store error, if this failure came from the store.
    pub fn db_error(&self) -> Option<&DbError> {
        match self {
            BankError::Conflict(e) | BankError::Transient(e) | BankError::Store(e) => Some(e),
            BankError::Rollback { cause, .. } => cause.db_error(),
            _ => None,
        }
    }
}

impl From<DbError> for BankError {
    fn from(e: DbError) -> Self {
        if e.is_constraint_violation() {
            BankError::Conflict(e)
        } else if e.is_transient() {
            BankError::Transient(e)
        } else {
            // Lookups name their entity through `from_lookup`; a bare
            // NotFound reaching here is a store fault.
            BankError::Store(e)
        }
    }
}
