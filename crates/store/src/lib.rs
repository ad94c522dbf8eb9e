//! TabSplit Store
//!
//! The ledger mirror store: traits over the two documents this system
//! persists — the authoritative `SplitWallet` record and the user-facing
//! `BillRecord` mirror — plus an in-memory implementation used by tests
//! and local development.
//!
//! The store offers atomic single-document writes only. Per-wallet
//! serialization happens through `update_wallet`, an atomic
//! read-modify-write: the closure runs against the current document and
//! either commits in one step or aborts with a domain error. There is no
//! cross-document transaction; keeping the bill mirror in step is the
//! cross-store synchronizer's job, never the store's.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use tabsplit_core::{BillRecord, LedgerError, SplitWallet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("wallet not found: {0}")]
    WalletNotFound(String),

    #[error("a non-terminal wallet already exists for bill {0}")]
    DuplicateActiveWallet(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The update closure rejected the write; the document is unchanged.
    #[error(transparent)]
    Rejected(#[from] LedgerError),
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::WalletNotFound(id) => LedgerError::WalletNotFound(id),
            StoreError::DuplicateActiveWallet(bill) => LedgerError::Validation(format!(
                "a non-terminal wallet already exists for bill {}",
                bill
            )),
            StoreError::Unavailable(msg) => LedgerError::Storage(msg),
            StoreError::Rejected(inner) => inner,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Mutation applied under the store's atomic read-modify-write. Returning
/// an error aborts the write and leaves the document untouched.
pub type WalletUpdate<'a> =
    Box<dyn FnOnce(&mut SplitWallet) -> tabsplit_core::Result<()> + Send + 'a>;

/// Authoritative wallet document store, keyed by wallet id with a
/// secondary lookup by bill id.
#[async_trait]
pub trait WalletStore: Send + Sync {
    /// Persist a new wallet. Fails with `DuplicateActiveWallet` if a
    /// non-terminal wallet already exists for the same bill.
    async fn insert_wallet(&self, wallet: SplitWallet) -> Result<()>;

    async fn get_wallet(&self, wallet_id: &str) -> Result<Option<SplitWallet>>;

    /// Non-terminal wallet for a bill, if one exists.
    async fn find_active_by_bill(&self, bill_id: &str) -> Result<Option<SplitWallet>>;

    /// Wallet for a bill regardless of status: the non-terminal one if
    /// present, otherwise the most recently updated settled one. Used by
    /// the synchronizer, which must also mirror terminal transitions.
    async fn find_by_bill(&self, bill_id: &str) -> Result<Option<SplitWallet>>;

    /// Atomic read-modify-write. Returns the committed document.
    async fn update_wallet(&self, wallet_id: &str, update: WalletUpdate<'_>)
        -> Result<SplitWallet>;

    /// Hard delete, used only for creation rollback. Settled wallets are
    /// retained for audit.
    async fn delete_wallet(&self, wallet_id: &str) -> Result<()>;
}

/// Bill mirror store. Written exclusively by the cross-store synchronizer.
#[async_trait]
pub trait BillStore: Send + Sync {
    async fn get_bill(&self, bill_id: &str) -> Result<Option<BillRecord>>;

    /// Overwrite the bill's wallet projection in one atomic write.
    async fn put_bill(&self, record: BillRecord) -> Result<()>;
}
