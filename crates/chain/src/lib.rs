//! TabSplit Chain
//!
//! Solana client for the custodial split wallet.
//!
//! Supports two modes:
//! - **Mock Mode**: For development/testing without Solana. Balances live
//!   in an in-memory ledger and transfers settle instantly.
//! - **Live Mode**: Actual Solana RPC calls (nonblocking client) with
//!   bounded retry, exponential backoff, and fresh-blockhash resubmission.
//!
//! The chain is authoritative for withdrawal amounts: engines verify the
//! on-chain balance here rather than trusting mirrored bookkeeping.

mod client;

pub use client::{ChainClient, ChainConfig, ChainMode};
pub use solana_sdk::signature::{Keypair, Signer};

use tabsplit_core::LedgerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("blockhash expired before confirmation")]
    BlockhashExpired,

    #[error("insufficient funds: have {available}, need {required}")]
    InsufficientFunds { available: u64, required: u64 },

    #[error("transaction failed: {0}")]
    TransactionFailed(String),

    #[error("RPC client not initialized")]
    NotInitialized,
}

impl ChainError {
    /// Transient errors are retried internally with backoff; everything
    /// else surfaces immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChainError::Rpc(_) | ChainError::Timeout(_) | ChainError::BlockhashExpired
        )
    }
}

impl From<ChainError> for LedgerError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::InsufficientFunds { available, required } => {
                LedgerError::InsufficientBalance { available, required }
            }
            ChainError::TransactionFailed(msg) => LedgerError::TransactionFailed(msg),
            other if other.is_transient() => LedgerError::OnChainTransient(other.to_string()),
            other => LedgerError::TransactionFailed(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ChainError>;
