//! In-memory store for tests and local development.
//!
//! Single-process stand-in for the document store: a write lock around
//! each map gives the same per-document atomicity the real store provides
//! through conditional updates. Write-failure injection lets tests force
//! the mirror-write and rollback paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;
use tracing::debug;

use tabsplit_core::{BillRecord, SplitWallet};

use crate::{BillStore, Result, StoreError, WalletStore, WalletUpdate};

/// In-memory wallet + bill store.
#[derive(Default)]
pub struct MemoryStore {
    wallets: RwLock<HashMap<String, SplitWallet>>,
    bills: RwLock<HashMap<String, BillRecord>>,
    /// Remaining bill writes to fail (test injection)
    fail_bill_puts: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` bill writes fail with `Unavailable`. Lets tests
    /// exercise creation rollback and sync retry paths.
    pub fn fail_next_bill_puts(&self, n: u32) {
        self.fail_bill_puts.store(n, Ordering::SeqCst);
    }

    /// Snapshot of every stored wallet (test helper).
    pub fn wallets_snapshot(&self) -> Vec<SplitWallet> {
        self.wallets.read().values().cloned().collect()
    }
}

#[async_trait::async_trait]
impl WalletStore for MemoryStore {
    async fn insert_wallet(&self, wallet: SplitWallet) -> Result<()> {
        let mut wallets = self.wallets.write();
        let duplicate = wallets
            .values()
            .any(|w| w.bill_id == wallet.bill_id && !w.status.is_terminal());
        if duplicate {
            return Err(StoreError::DuplicateActiveWallet(wallet.bill_id));
        }
        debug!(wallet_id = %wallet.id, bill_id = %wallet.bill_id, "inserting wallet");
        wallets.insert(wallet.id.clone(), wallet);
        Ok(())
    }

    async fn get_wallet(&self, wallet_id: &str) -> Result<Option<SplitWallet>> {
        Ok(self.wallets.read().get(wallet_id).cloned())
    }

    async fn find_active_by_bill(&self, bill_id: &str) -> Result<Option<SplitWallet>> {
        Ok(self
            .wallets
            .read()
            .values()
            .find(|w| w.bill_id == bill_id && !w.status.is_terminal())
            .cloned())
    }

    async fn find_by_bill(&self, bill_id: &str) -> Result<Option<SplitWallet>> {
        let wallets = self.wallets.read();
        let active = wallets
            .values()
            .find(|w| w.bill_id == bill_id && !w.status.is_terminal());
        let found = active.or_else(|| {
            wallets
                .values()
                .filter(|w| w.bill_id == bill_id)
                .max_by_key(|w| w.last_updated)
        });
        Ok(found.cloned())
    }

    async fn update_wallet(
        &self,
        wallet_id: &str,
        update: WalletUpdate<'_>,
    ) -> Result<SplitWallet> {
        let mut wallets = self.wallets.write();
        let wallet = wallets
            .get_mut(wallet_id)
            .ok_or_else(|| StoreError::WalletNotFound(wallet_id.to_string()))?;

        // Mutate a copy so an aborting closure leaves the document intact
        let mut candidate = wallet.clone();
        update(&mut candidate)?;
        *wallet = candidate.clone();
        Ok(candidate)
    }

    async fn delete_wallet(&self, wallet_id: &str) -> Result<()> {
        let removed = self.wallets.write().remove(wallet_id);
        if removed.is_none() {
            return Err(StoreError::WalletNotFound(wallet_id.to_string()));
        }
        debug!(wallet_id, "wallet deleted (creation rollback)");
        Ok(())
    }
}

#[async_trait::async_trait]
impl BillStore for MemoryStore {
    async fn get_bill(&self, bill_id: &str) -> Result<Option<BillRecord>> {
        Ok(self.bills.read().get(bill_id).cloned())
    }

    async fn put_bill(&self, record: BillRecord) -> Result<()> {
        let pending = self.fail_bill_puts.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_bill_puts.store(pending - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("injected bill write failure".into()));
        }
        self.bills.write().insert(record.bill_id.clone(), record);
        Ok(())
    }
}
