//! TabSplit Core
//!
//! Shared domain types for the split-wallet custodial ledger: the wallet
//! document, participant positions, the wallet state machine, split-share
//! math, and the error taxonomy used across all TabSplit crates.
//!
//! This crate is pure: no async, no I/O. Everything that talks to Solana or
//! a document store lives in `tabsplit-chain` and `tabsplit-store`.

mod split;
mod types;

pub use split::{equal_shares, participant_shares, validate_participants};
pub use types::*;

use thiserror::Error;

/// Error taxonomy for the custodial ledger.
///
/// Validation and authorization errors fail fast and reach the caller
/// unchanged. `OnChainTransient` is retried internally before surfacing.
/// `SyncDivergence` is queued for reconciliation and never rolls back a
/// funds-affecting write. `AlreadySettled` is an idempotency guard that
/// callers may treat as success-equivalent.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("wallet not found: {0}")]
    WalletNotFound(String),

    #[error("participant {user_id} not found in wallet {wallet_id}")]
    ParticipantNotFound { wallet_id: String, user_id: String },

    #[error("already settled: {0}")]
    AlreadySettled(String),

    #[error("not authorized: {0}")]
    Authorization(String),

    #[error("insufficient balance: have {available}, need {required}")]
    InsufficientBalance { available: u64, required: u64 },

    #[error("participants not ready for settlement: {0}")]
    ParticipantsNotReady(String),

    #[error("transient on-chain failure: {0}")]
    OnChainTransient(String),

    #[error("on-chain transaction failed: {0}")]
    TransactionFailed(String),

    #[error("bill mirror diverged for bill {0}; queued for reconciliation")]
    SyncDivergence(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("key vault error: {0}")]
    Vault(String),
}

impl LedgerError {
    /// Whether a caller should retry the operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::OnChainTransient(_))
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
