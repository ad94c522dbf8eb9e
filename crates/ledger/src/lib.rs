//! TabSplit Ledger
//!
//! The engines that drive a split wallet through its life: creation and
//! repartition (lifecycle), participant funding (contributions), the degen
//! roulette (settlement), payouts (withdrawals), and the cross-store
//! synchronizer that mirrors the authoritative wallet document into the
//! user-facing bill record.
//!
//! Concurrency model: no in-process lock spans an operation. Every
//! wallet mutation goes through the store's atomic read-modify-write, so
//! guards (status checks, idempotency) and the write they protect commit
//! in one step — concurrent settlement attempts on one wallet cannot both
//! succeed, and contributions from different participants commute.

mod contribute;
mod events;
mod lifecycle;
mod roulette;
mod sync;
mod withdraw;

pub use contribute::ContributeRequest;
pub use events::{EventBus, LedgerEvent, WithdrawalKind};
pub use lifecycle::CreateWalletRequest;
pub use roulette::RouletteOutcome;
pub use sync::{PendingSync, Synchronizer};
pub use withdraw::{PayoutResolver, StaticPayoutResolver};

pub use tabsplit_core::{LedgerError, Result};

use std::sync::Arc;

use tabsplit_chain::ChainClient;
use tabsplit_store::{BillStore, WalletStore};
use tabsplit_vault::KeyVault;

/// The custodial ledger service: one instance serves many wallets, with
/// per-wallet serialization delegated to the store layer.
pub struct LedgerService {
    pub(crate) wallets: Arc<dyn WalletStore>,
    pub(crate) chain: Arc<ChainClient>,
    pub(crate) vault: Arc<KeyVault>,
    pub(crate) sync: Arc<Synchronizer>,
    pub(crate) events: EventBus,
    pub(crate) payouts: Arc<dyn PayoutResolver>,
}

impl LedgerService {
    pub fn new(
        wallets: Arc<dyn WalletStore>,
        bills: Arc<dyn BillStore>,
        chain: Arc<ChainClient>,
        vault: Arc<KeyVault>,
        payouts: Arc<dyn PayoutResolver>,
    ) -> Self {
        Self {
            sync: Arc::new(Synchronizer::new(wallets.clone(), bills)),
            wallets,
            chain,
            vault,
            events: EventBus::new(),
            payouts,
        }
    }

    /// Subscribe to ledger events (reward pipeline, notifications).
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }

    /// The cross-store synchronizer, exposed for reconciliation tooling.
    pub fn synchronizer(&self) -> &Arc<Synchronizer> {
        &self.sync
    }
}

/// Current unix timestamp in seconds.
pub(crate) fn now() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs()
}
