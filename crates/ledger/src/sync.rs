//! Cross-store synchronizer.
//!
//! The SplitWallet document is authoritative; the bill record is a
//! user-facing mirror. This is the only component that writes the bill
//! record, which keeps the replication path single and auditable.
//!
//! Concurrent sync requests for one bill collapse into a single in-flight
//! run whose outcome is shared through a watch channel. A sync that
//! exhausts its retries lands on the reconciliation queue and never rolls
//! back the primary write — by the time a mirror write fails, the wallet
//! and on-chain state are already correct.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use tabsplit_core::{BillRecord, LedgerError, Result};
use tabsplit_store::{BillStore, WalletStore};

const SYNC_ATTEMPTS: u32 = 3;
const SYNC_RETRY_BASE: Duration = Duration::from_millis(50);

/// A bill whose mirror diverged from the wallet and awaits operator
/// reconciliation.
#[derive(Debug, Clone)]
pub struct PendingSync {
    pub bill_id: String,
    pub reason: String,
    pub attempts: u32,
    pub queued_at: u64,
}

enum Role {
    Leader(watch::Sender<Option<bool>>),
    Follower(watch::Receiver<Option<bool>>),
}

pub struct Synchronizer {
    wallets: Arc<dyn WalletStore>,
    bills: Arc<dyn BillStore>,
    /// In-flight sync per bill; followers share the leader's outcome
    inflight: AsyncMutex<HashMap<String, watch::Receiver<Option<bool>>>>,
    /// Divergences queued for reconciliation
    queue: Mutex<Vec<PendingSync>>,
}

impl Synchronizer {
    pub fn new(wallets: Arc<dyn WalletStore>, bills: Arc<dyn BillStore>) -> Self {
        Self {
            wallets,
            bills,
            inflight: AsyncMutex::new(HashMap::new()),
            queue: Mutex::new(Vec::new()),
        }
    }

    /// Mirror the wallet's current state onto its bill record.
    ///
    /// Joins an in-flight sync for the same bill if one exists. Retries
    /// transient failures with backoff; on exhaustion queues the bill for
    /// reconciliation and returns `SyncDivergence`.
    pub async fn sync_bill(&self, bill_id: &str) -> Result<()> {
        let role = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(bill_id) {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(bill_id.to_string(), rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Follower(mut rx) => {
                debug!(bill_id, "joining in-flight sync");
                loop {
                    if let Some(ok) = *rx.borrow_and_update() {
                        return outcome(ok, bill_id);
                    }
                    if rx.changed().await.is_err() {
                        // Leader finished; the final value is retained
                        let last = *rx.borrow();
                        return outcome(last.unwrap_or(false), bill_id);
                    }
                }
            }
            Role::Leader(tx) => {
                let result = self.run_sync(bill_id).await;
                self.inflight.lock().await.remove(bill_id);
                let ok = result.is_ok();
                let _ = tx.send(Some(ok));
                if let Err(err) = result {
                    self.flag_reconciliation(bill_id, &err.to_string(), SYNC_ATTEMPTS);
                    return Err(LedgerError::SyncDivergence(bill_id.to_string()));
                }
                Ok(())
            }
        }
    }

    /// Fire-and-forget mirror. Used after funds-affecting writes, where a
    /// mirror failure must not fail the caller's request.
    pub fn trigger(self: &Arc<Self>, bill_id: &str) {
        let sync = self.clone();
        let bill_id = bill_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = sync.sync_bill(&bill_id).await {
                warn!(bill_id = %bill_id, "background bill sync failed: {}", err);
            }
        });
    }

    /// Record a divergence for operator reconciliation without running a
    /// sync (used by fail-soft paths like the degen ACL update).
    pub fn flag_reconciliation(&self, bill_id: &str, reason: &str, attempts: u32) {
        warn!(bill_id, reason, "queued for reconciliation");
        self.queue.lock().push(PendingSync {
            bill_id: bill_id.to_string(),
            reason: reason.to_string(),
            attempts,
            queued_at: crate::now(),
        });
    }

    /// Snapshot of queued divergences.
    pub fn pending_reconciliations(&self) -> Vec<PendingSync> {
        self.queue.lock().clone()
    }

    /// Drain the queue, returning what was pending. Reconciliation
    /// tooling re-runs `sync_bill` for each entry.
    pub fn take_reconciliations(&self) -> Vec<PendingSync> {
        std::mem::take(&mut *self.queue.lock())
    }

    async fn run_sync(&self, bill_id: &str) -> Result<()> {
        let wallet = self
            .wallets
            .find_by_bill(bill_id)
            .await
            .map_err(LedgerError::from)?
            .ok_or_else(|| LedgerError::WalletNotFound(format!("no wallet for bill {}", bill_id)))?;

        let record = BillRecord::project(&wallet, crate::now());

        let mut last_err = None;
        for attempt in 0..SYNC_ATTEMPTS {
            match self.bills.put_bill(record.clone()).await {
                Ok(()) => {
                    info!(bill_id, wallet_id = %wallet.id, status = ?wallet.status, "bill mirror updated");
                    return Ok(());
                }
                Err(err) => {
                    debug!(bill_id, attempt, "bill mirror write failed: {}", err);
                    last_err = Some(err);
                    tokio::time::sleep(SYNC_RETRY_BASE * 2u32.saturating_pow(attempt)).await;
                }
            }
        }

        Err(last_err.map(LedgerError::from).unwrap_or_else(|| {
            LedgerError::Storage("bill mirror write failed with no error".into())
        }))
    }
}

fn outcome(ok: bool, bill_id: &str) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(LedgerError::SyncDivergence(bill_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabsplit_core::{Participant, SplitMode, SplitWallet, WalletStatus};
    use tabsplit_store::MemoryStore;

    fn wallet(id: &str, bill: &str) -> SplitWallet {
        SplitWallet {
            id: id.into(),
            bill_id: bill.into(),
            creator_id: "alice".into(),
            currency: "USDC".into(),
            total_amount: 30,
            wallet_address: [7u8; 32],
            mode: SplitMode::Fair,
            status: WalletStatus::Funding,
            participants: vec![Participant::new("alice", [1u8; 32], 30)],
            degen_loser: None,
            roulette_audit: None,
            withdrawal_signature: None,
            created_at: 1000,
            last_updated: 1000,
            completed_at: None,
        }
    }

    fn setup() -> (Arc<MemoryStore>, Arc<Synchronizer>) {
        let store = Arc::new(MemoryStore::new());
        let sync = Arc::new(Synchronizer::new(store.clone(), store.clone()));
        (store, sync)
    }

    #[tokio::test]
    async fn test_sync_projects_wallet_into_bill() {
        let (store, sync) = setup();
        tabsplit_store::WalletStore::insert_wallet(&*store, wallet("w1", "b1")).await.unwrap();

        sync.sync_bill("b1").await.unwrap();

        let bill = tabsplit_store::BillStore::get_bill(&*store, "b1").await.unwrap().unwrap();
        assert_eq!(bill.wallet_id, "w1");
        assert_eq!(bill.status, WalletStatus::Funding);
        assert_eq!(bill.participants.len(), 1);
    }

    #[tokio::test]
    async fn test_sync_retries_through_one_failure() {
        let (store, sync) = setup();
        tabsplit_store::WalletStore::insert_wallet(&*store, wallet("w1", "b1")).await.unwrap();

        store.fail_next_bill_puts(1);
        sync.sync_bill("b1").await.unwrap();
        assert!(tabsplit_store::BillStore::get_bill(&*store, "b1").await.unwrap().is_some());
        assert!(sync.pending_reconciliations().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_sync_queues_reconciliation() {
        let (store, sync) = setup();
        tabsplit_store::WalletStore::insert_wallet(&*store, wallet("w1", "b1")).await.unwrap();

        store.fail_next_bill_puts(SYNC_ATTEMPTS);
        let result = sync.sync_bill("b1").await;
        assert!(matches!(result, Err(LedgerError::SyncDivergence(_))));

        let pending = sync.pending_reconciliations();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].bill_id, "b1");

        // Reconciliation re-run succeeds and clears nothing automatically
        for entry in sync.take_reconciliations() {
            sync.sync_bill(&entry.bill_id).await.unwrap();
        }
        assert!(sync.pending_reconciliations().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_syncs_collapse() {
        let (store, sync) = setup();
        tabsplit_store::WalletStore::insert_wallet(&*store, wallet("w1", "b1")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sync = sync.clone();
            handles.push(tokio::spawn(async move { sync.sync_bill("b1").await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_sync_without_wallet_fails() {
        let (_, sync) = setup();
        let result = sync.sync_bill("ghost").await;
        assert!(matches!(result, Err(LedgerError::SyncDivergence(_))));
    }
}
