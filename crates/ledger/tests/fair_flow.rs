//! End-to-end fair-split flows against the mock chain: creation with
//! rollback, installment contributions, repartition, and the creator
//! withdrawal.

use std::sync::Arc;
use std::time::Duration;

use tabsplit_chain::{ChainClient, ChainConfig, Keypair, Signer};
use tabsplit_core::{
    LedgerError, ParticipantInput, ParticipantStatus, SplitMode, WalletStatus,
};
use tabsplit_ledger::{
    ContributeRequest, CreateWalletRequest, LedgerService, StaticPayoutResolver,
};
use tabsplit_store::{BillStore, MemoryStore, WalletStore};
use tabsplit_vault::{KeyRecordStore, KeyVault, MemoryKeyStore};

// ============================================================================
// Helpers
// ============================================================================

/// 10 USDC in smallest units (6 decimals)
const SHARE: u64 = 10_000_000;

struct Harness {
    service: Arc<LedgerService>,
    store: Arc<MemoryStore>,
    chain: Arc<ChainClient>,
    keys: Arc<MemoryKeyStore>,
}

fn harness() -> Harness {
    tabsplit_logging::init_test();

    let store = Arc::new(MemoryStore::new());
    let mut chain_config = ChainConfig::mock();
    chain_config.retry_base = Duration::from_millis(1);
    let chain = Arc::new(ChainClient::new(chain_config));
    let keys = Arc::new(MemoryKeyStore::new());
    let vault = Arc::new(KeyVault::new([0x11; 32], keys.clone()));
    let service = Arc::new(LedgerService::new(
        store.clone(),
        store.clone(),
        chain.clone(),
        vault,
        Arc::new(StaticPayoutResolver::new()),
    ));
    Harness { service, store, chain, keys }
}

fn member(user: &str, seed: u8) -> ParticipantInput {
    ParticipantInput {
        user_id: user.to_string(),
        wallet_address: [seed; 32],
    }
}

fn funded(chain: &ChainClient, lamports: u64) -> Keypair {
    let kp = Keypair::new();
    chain.mock_credit(&kp.pubkey().to_bytes(), lamports);
    kp
}

fn three_way_request() -> CreateWalletRequest {
    CreateWalletRequest {
        bill_id: "bill-1".to_string(),
        creator_id: "alice".to_string(),
        total_amount: 3 * SHARE,
        currency: "USDC".to_string(),
        participants: vec![member("alice", 1), member("bob", 2), member("carol", 3)],
        mode: SplitMode::Fair,
    }
}

async fn contribute(
    h: &Harness,
    wallet_id: &str,
    user: &str,
    amount: u64,
) -> tabsplit_core::Result<tabsplit_core::Participant> {
    let funder = funded(&h.chain, amount);
    h.service
        .contribute(ContributeRequest { wallet_id, user_id: user, amount, funder: &funder })
        .await
}

// ============================================================================
// Creation
// ============================================================================

#[tokio::test]
async fn test_create_wallet_mirrors_bill() {
    let h = harness();
    let wallet = h.service.create_wallet(three_way_request()).await.unwrap();

    assert_eq!(wallet.status, WalletStatus::Pending);
    assert_eq!(wallet.participants.len(), 3);
    for p in &wallet.participants {
        assert_eq!(p.amount_owed, SHARE);
        assert_eq!(p.amount_paid, 0);
    }

    // The bill mirror is written synchronously at creation
    let bill = h.store.get_bill("bill-1").await.unwrap().unwrap();
    assert_eq!(bill.wallet_id, wallet.id);
    assert_eq!(bill.wallet_address, wallet.wallet_address);
    assert_eq!(bill.status, WalletStatus::Pending);

    // The key record exists and only the creator can decrypt
    assert!(h.keys.get(&wallet.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_second_active_wallet_for_bill_rejected() {
    let h = harness();
    h.service.create_wallet(three_way_request()).await.unwrap();

    let result = h.service.create_wallet(three_way_request()).await;
    assert!(matches!(result, Err(LedgerError::Validation(_))));
}

#[tokio::test]
async fn test_creation_rolls_back_on_key_store_failure() {
    let h = harness();
    h.keys.fail_next_puts(1);

    let result = h.service.create_wallet(three_way_request()).await;
    assert!(result.is_err());

    // No orphaned wallet without a recoverable key
    assert!(h.store.find_active_by_bill("bill-1").await.unwrap().is_none());
    assert!(h.store.wallets_snapshot().is_empty());
    assert!(h.store.get_bill("bill-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_creation_rolls_back_on_bill_mirror_failure() {
    let h = harness();
    // Exhaust every sync retry
    h.store.fail_next_bill_puts(10);

    let result = h.service.create_wallet(three_way_request()).await;
    assert!(matches!(result, Err(LedgerError::SyncDivergence(_))));

    // Both the wallet and its key record are rolled back
    assert!(h.store.wallets_snapshot().is_empty());
    assert_eq!(h.keys.record_count(), 0);
}

// ============================================================================
// Contributions
// ============================================================================

#[tokio::test]
async fn test_installments_accumulate_to_paid() {
    let h = harness();
    let wallet = h.service.create_wallet(three_way_request()).await.unwrap();

    // First installment: 4 of 10
    let p = contribute(&h, &wallet.id, "bob", 4_000_000).await.unwrap();
    assert_eq!(p.amount_paid, 4_000_000);
    assert_eq!(p.status, ParticipantStatus::Pending);
    assert!(p.transaction_signature.is_some());

    let w = h.store.get_wallet(&wallet.id).await.unwrap().unwrap();
    assert_eq!(w.status, WalletStatus::Funding);

    // Second installment completes the share; never overwrites
    let p = contribute(&h, &wallet.id, "bob", 6_000_000).await.unwrap();
    assert_eq!(p.amount_paid, SHARE);
    assert_eq!(p.status, ParticipantStatus::Paid);
    assert!(p.paid_at.is_some());

    // Custodial wallet holds everything contributed
    assert_eq!(h.chain.get_balance(&wallet.wallet_address).await.unwrap(), SHARE);
}

#[tokio::test]
async fn test_overpayment_capped_at_share() {
    let h = harness();
    let wallet = h.service.create_wallet(three_way_request()).await.unwrap();

    let p = contribute(&h, &wallet.id, "bob", SHARE + 2_500_000).await.unwrap();
    assert_eq!(p.amount_paid, SHARE);
    assert_eq!(p.status, ParticipantStatus::Paid);
}

#[tokio::test]
async fn test_contribution_requires_known_participant() {
    let h = harness();
    let wallet = h.service.create_wallet(three_way_request()).await.unwrap();

    let result = contribute(&h, &wallet.id, "mallory", SHARE).await;
    assert!(matches!(result, Err(LedgerError::ParticipantNotFound { .. })));
}

#[tokio::test]
async fn test_contribution_requires_funder_balance() {
    let h = harness();
    let wallet = h.service.create_wallet(three_way_request()).await.unwrap();

    let broke = funded(&h.chain, 100);
    let result = h
        .service
        .contribute(ContributeRequest {
            wallet_id: &wallet.id,
            user_id: "bob",
            amount: SHARE,
            funder: &broke,
        })
        .await;
    assert!(matches!(result, Err(LedgerError::InsufficientBalance { .. })));

    // Ledger untouched
    let w = h.store.get_wallet(&wallet.id).await.unwrap().unwrap();
    assert_eq!(w.participant("bob").unwrap().amount_paid, 0);
}

#[tokio::test]
async fn test_concurrent_contributions_commute() {
    let h = harness();
    let wallet = h.service.create_wallet(three_way_request()).await.unwrap();

    let mut handles = Vec::new();
    for user in ["alice", "bob", "carol"] {
        let service = h.service.clone();
        let funder = funded(&h.chain, SHARE);
        let wallet_id = wallet.id.clone();
        handles.push(tokio::spawn(async move {
            service
                .contribute(ContributeRequest {
                    wallet_id: &wallet_id,
                    user_id: user,
                    amount: SHARE,
                    funder: &funder,
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let w = h.store.get_wallet(&wallet.id).await.unwrap().unwrap();
    assert_eq!(w.total_paid(), 3 * SHARE);
    assert_eq!(w.status, WalletStatus::FullyPaid);
    assert_eq!(h.chain.get_balance(&wallet.wallet_address).await.unwrap(), 3 * SHARE);
}

// ============================================================================
// Repartition
// ============================================================================

#[tokio::test]
async fn test_repartition_preserves_payment_state() {
    let h = harness();
    let wallet = h.service.create_wallet(three_way_request()).await.unwrap();
    for user in ["alice", "bob", "carol"] {
        contribute(&h, &wallet.id, user, SHARE).await.unwrap();
    }

    // Dave joins after everyone paid; obligations redistribute to total/4
    let updated = h
        .service
        .update_participants(
            &wallet.id,
            vec![member("alice", 1), member("bob", 2), member("carol", 3), member("dave", 4)],
        )
        .await
        .unwrap();

    assert_eq!(updated.participants.len(), 4);
    for user in ["alice", "bob", "carol"] {
        let p = updated.participant(user).unwrap();
        assert_eq!(p.amount_owed, 7_500_000);
        // Recorded payments survive the repartition untouched
        assert_eq!(p.amount_paid, SHARE);
        assert_eq!(p.status, ParticipantStatus::Paid);
        assert!(p.transaction_signature.is_some());
    }

    let dave = updated.participant("dave").unwrap();
    assert_eq!(dave.amount_owed, 7_500_000);
    assert_eq!(dave.amount_paid, 0);
    assert_eq!(dave.status, ParticipantStatus::Pending);
}

#[tokio::test]
async fn test_repartition_cannot_drop_paid_participant() {
    let h = harness();
    let wallet = h.service.create_wallet(three_way_request()).await.unwrap();
    contribute(&h, &wallet.id, "bob", 1_000_000).await.unwrap();

    let result = h
        .service
        .update_participants(&wallet.id, vec![member("alice", 1), member("carol", 3)])
        .await;
    assert!(matches!(result, Err(LedgerError::Validation(_))));

    // Bob is still there with his partial payment
    let w = h.store.get_wallet(&wallet.id).await.unwrap().unwrap();
    assert_eq!(w.participant("bob").unwrap().amount_paid, 1_000_000);
}

// ============================================================================
// Creator withdrawal
// ============================================================================

#[tokio::test]
async fn test_fair_flow_end_to_end() {
    let h = harness();
    let wallet = h.service.create_wallet(three_way_request()).await.unwrap();

    for user in ["alice", "bob", "carol"] {
        contribute(&h, &wallet.id, user, SHARE).await.unwrap();
    }
    let w = h.store.get_wallet(&wallet.id).await.unwrap().unwrap();
    assert_eq!(w.status, WalletStatus::FullyPaid);

    let destination = [0x77; 32];
    let sig = h.service.withdraw_creator(&wallet.id, "alice", destination).await.unwrap();
    assert!(h.chain.confirm(&sig).await.unwrap());

    // Full verified balance moved; wallet drained and completed
    assert_eq!(h.chain.get_balance(&destination).await.unwrap(), 3 * SHARE);
    assert_eq!(h.chain.get_balance(&wallet.wallet_address).await.unwrap(), 0);

    let w = h.store.get_wallet(&wallet.id).await.unwrap().unwrap();
    assert_eq!(w.status, WalletStatus::Completed);
    assert_eq!(w.withdrawal_signature, Some(sig));
    assert!(w.completed_at.is_some());

    // Key record deleted after terminal settlement
    assert!(h.keys.get(&wallet.id).await.unwrap().is_none());

    // Mirror converges to the terminal state
    h.service.synchronizer().sync_bill("bill-1").await.unwrap();
    let bill = h.store.get_bill("bill-1").await.unwrap().unwrap();
    assert_eq!(bill.status, WalletStatus::Completed);
}

#[tokio::test]
async fn test_only_creator_may_withdraw() {
    let h = harness();
    let wallet = h.service.create_wallet(three_way_request()).await.unwrap();
    contribute(&h, &wallet.id, "bob", SHARE).await.unwrap();

    let result = h.service.withdraw_creator(&wallet.id, "bob", [0x77; 32]).await;
    assert!(matches!(result, Err(LedgerError::Authorization(_))));

    // Funds stayed put
    assert_eq!(h.chain.get_balance(&wallet.wallet_address).await.unwrap(), SHARE);
}

#[tokio::test]
async fn test_withdrawal_is_single_shot() {
    let h = harness();
    let wallet = h.service.create_wallet(three_way_request()).await.unwrap();
    contribute(&h, &wallet.id, "alice", SHARE).await.unwrap();

    h.service.withdraw_creator(&wallet.id, "alice", [0x77; 32]).await.unwrap();

    let result = h.service.withdraw_creator(&wallet.id, "alice", [0x77; 32]).await;
    assert!(matches!(result, Err(LedgerError::AlreadySettled(_))));
}

#[tokio::test]
async fn test_withdrawal_from_empty_wallet_rejected() {
    let h = harness();
    let wallet = h.service.create_wallet(three_way_request()).await.unwrap();

    let result = h.service.withdraw_creator(&wallet.id, "alice", [0x77; 32]).await;
    assert!(matches!(result, Err(LedgerError::InsufficientBalance { .. })));

    // The failed attempt leaves no reserved terminal state behind
    let w = h.store.get_wallet(&wallet.id).await.unwrap().unwrap();
    assert_eq!(w.status, WalletStatus::Pending);

    // The wallet is still fully usable
    contribute(&h, &wallet.id, "alice", SHARE).await.unwrap();
    h.service.withdraw_creator(&wallet.id, "alice", [0x77; 32]).await.unwrap();
    assert_eq!(h.chain.get_balance(&[0x77; 32]).await.unwrap(), SHARE);
}

#[tokio::test]
async fn test_withdrawal_reverts_reservation_on_chain_failure() {
    let h = harness();
    let wallet = h.service.create_wallet(three_way_request()).await.unwrap();
    contribute(&h, &wallet.id, "alice", SHARE).await.unwrap();

    // Exhaust the balance check's whole retry budget
    h.chain.mock_fail_next_rpcs(4);
    let result = h.service.withdraw_creator(&wallet.id, "alice", [0x77; 32]).await;
    assert!(matches!(result, Err(ref e) if e.is_retryable()));

    // Reservation released: status recomputed, no funds moved
    let w = h.store.get_wallet(&wallet.id).await.unwrap().unwrap();
    assert_eq!(w.status, WalletStatus::Funding);
    assert!(w.withdrawal_signature.is_none());
    assert_eq!(h.chain.get_balance(&wallet.wallet_address).await.unwrap(), SHARE);

    // A retry goes through cleanly
    h.service.withdraw_creator(&wallet.id, "alice", [0x77; 32]).await.unwrap();
    assert_eq!(h.chain.get_balance(&[0x77; 32]).await.unwrap(), SHARE);
}

#[tokio::test]
async fn test_concurrent_creator_withdrawals_pay_once() {
    let h = harness();
    let wallet = h.service.create_wallet(three_way_request()).await.unwrap();
    contribute(&h, &wallet.id, "alice", SHARE).await.unwrap();

    let destination = [0x77; 32];
    let mut handles = Vec::new();
    for _ in 0..2 {
        let service = h.service.clone();
        let wallet_id = wallet.id.clone();
        handles.push(tokio::spawn(async move {
            service.withdraw_creator(&wallet_id, "alice", destination).await
        }));
    }
    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }

    // Exactly one call commits; the duplicate trips the status guard
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(LedgerError::AlreadySettled(_)))));

    // Paid exactly once
    assert_eq!(h.chain.get_balance(&destination).await.unwrap(), SHARE);
    assert_eq!(h.chain.get_balance(&wallet.wallet_address).await.unwrap(), 0);
}
