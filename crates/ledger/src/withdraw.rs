//! Withdrawal engine.
//!
//! Three flows out of the custodial wallet: the fair/spend creator
//! withdrawal, the degen winner refund, and the degen loser settlement.
//! All of them derive the amount from the verified on-chain balance —
//! never from mirrored bookkeeping — and mirror the bill asynchronously.
//!
//! Each flow reserves its settled state through the store's atomic
//! update *before* submitting the transfer: the status guard and the
//! state write commit in one step, so a concurrent duplicate fails on
//! the guard instead of racing the irreversible on-chain write. If the
//! transfer then never happens (balance check or submission fails), the
//! reservation is released; once it lands, a follow-up write records
//! the signature for audit.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{error, info, warn};

use tabsplit_chain::Keypair;
use tabsplit_core::{
    LedgerError, ParticipantStatus, PublicKey, Result, SplitMode, SplitWallet,
    TransactionSignature, WalletStatus, DUST_TOLERANCE,
};

use crate::{LedgerEvent, LedgerService, WithdrawalKind};

/// Resolves a degen loser's external payout destination (the actual bill
/// payment rail). Injected; the ledger does not know how destinations are
/// provisioned.
#[async_trait]
pub trait PayoutResolver: Send + Sync {
    async fn resolve(&self, user_id: &str) -> Result<PublicKey>;
}

/// Fixed-table resolver for tests and local development.
#[derive(Default)]
pub struct StaticPayoutResolver {
    destinations: HashMap<String, PublicKey>,
}

impl StaticPayoutResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, user_id: impl Into<String>, destination: PublicKey) -> Self {
        self.destinations.insert(user_id.into(), destination);
        self
    }
}

#[async_trait]
impl PayoutResolver for StaticPayoutResolver {
    async fn resolve(&self, user_id: &str) -> Result<PublicKey> {
        self.destinations.get(user_id).copied().ok_or_else(|| {
            LedgerError::Validation(format!("no payout destination for user {}", user_id))
        })
    }
}

impl LedgerService {
    /// Fair/spend creator withdrawal: drain the verified on-chain balance
    /// to the given destination (the creator's wallet, or the merchant
    /// for spend bills) and complete the wallet.
    pub async fn withdraw_creator(
        &self,
        wallet_id: &str,
        caller_id: &str,
        destination: PublicKey,
    ) -> Result<TransactionSignature> {
        let wallet = self.load_wallet(wallet_id).await?;

        if wallet.mode == SplitMode::Degen {
            return Err(LedgerError::Validation(
                "degen wallets settle through winner/loser withdrawal".into(),
            ));
        }
        if caller_id != wallet.creator_id {
            return Err(LedgerError::Authorization(format!(
                "only the creator may withdraw from wallet {}",
                wallet.id
            )));
        }
        if wallet.status.is_terminal() {
            return Err(LedgerError::AlreadySettled(wallet.id));
        }

        let signer = self.custodial_signer(&wallet.id, caller_id).await?;

        // Reserve the terminal state. A concurrent duplicate fails here,
        // before any funds can move.
        self.wallets
            .update_wallet(
                wallet_id,
                Box::new(|w| {
                    if w.status.is_terminal() {
                        return Err(LedgerError::AlreadySettled(w.id.clone()));
                    }
                    w.status = WalletStatus::Completed;
                    w.last_updated = crate::now();
                    Ok(())
                }),
            )
            .await?;

        // On-chain state is authoritative for the withdrawal amount
        let balance = match self.chain.get_balance(&wallet.wallet_address).await {
            Ok(balance) => balance,
            Err(err) => {
                self.release_wallet_reservation(wallet_id).await;
                return Err(err.into());
            }
        };
        if balance == 0 {
            self.release_wallet_reservation(wallet_id).await;
            return Err(LedgerError::InsufficientBalance { available: 0, required: 1 });
        }

        let signature = match self.chain.transfer(&signer, &destination, balance).await {
            Ok(signature) => signature,
            Err(err) => {
                self.release_wallet_reservation(wallet_id).await;
                return Err(err.into());
            }
        };

        // Transfer landed; the signature is persisted for audit
        let updated = self
            .wallets
            .update_wallet(
                wallet_id,
                Box::new(move |w| {
                    let now = crate::now();
                    w.withdrawal_signature = Some(signature);
                    w.completed_at = Some(now);
                    w.last_updated = now;
                    Ok(())
                }),
            )
            .await?;

        info!(wallet_id = %updated.id, amount = balance, "creator withdrawal complete");

        // Terminal and fully paid out; the key record can go
        if let Err(err) = self.vault.delete_key(&updated.id).await {
            warn!(wallet_id = %updated.id, "key cleanup failed after withdrawal: {}", err);
        }

        self.sync.trigger(&updated.bill_id);
        self.events.emit(LedgerEvent::WithdrawalCompleted {
            wallet_id: updated.id.clone(),
            user_id: caller_id.to_string(),
            amount: balance,
            kind: WithdrawalKind::Creator,
        });
        Ok(signature)
    }

    /// Degen winner refund: return the winner's locked amount from the
    /// pot, leaving the loser's obligation reserved in the wallet.
    pub async fn withdraw_winner(
        &self,
        wallet_id: &str,
        caller_id: &str,
    ) -> Result<TransactionSignature> {
        let wallet = self.load_wallet(wallet_id).await?;
        self.guard_degen_settled(&wallet)?;

        let participant = wallet.participant(caller_id).ok_or_else(|| {
            LedgerError::ParticipantNotFound {
                wallet_id: wallet.id.clone(),
                user_id: caller_id.to_string(),
            }
        })?;
        if wallet.degen_loser.as_deref() == Some(caller_id) {
            return Err(LedgerError::Authorization(
                "the roulette loser cannot claim a winner refund".into(),
            ));
        }
        if participant.status == ParticipantStatus::Paid {
            return Err(LedgerError::AlreadySettled(format!(
                "winner {} already refunded",
                caller_id
            )));
        }

        let signer = self.custodial_signer(&wallet.id, caller_id).await?;

        // Reserve the payout before any funds move
        let user = caller_id.to_string();
        let reserved = self
            .wallets
            .update_wallet(wallet_id, Box::new(move |w| reserve_payout(w, &user)))
            .await?;
        let refund_due = reserved
            .participant(caller_id)
            .map(|p| p.amount_paid)
            .unwrap_or(0);

        // Keep the loser's unpaid obligation in the pot so the bill can
        // still be settled after this refund
        let loser_reserved = reserved
            .degen_loser
            .as_deref()
            .and_then(|loser| reserved.participant(loser))
            .filter(|p| p.status != ParticipantStatus::Paid)
            .map(|p| p.amount_owed)
            .unwrap_or(0);

        let balance = match self.chain.get_balance(&wallet.wallet_address).await {
            Ok(balance) => balance,
            Err(err) => {
                self.release_payout_reservation(wallet_id, caller_id).await;
                return Err(err.into());
            }
        };
        let available = balance.saturating_sub(loser_reserved);
        let payout = refund_due.min(available);
        if payout == 0 {
            self.release_payout_reservation(wallet_id, caller_id).await;
            return Err(LedgerError::InsufficientBalance {
                available,
                required: refund_due,
            });
        }

        let destination = participant.wallet_address;
        let signature = match self.chain.transfer(&signer, &destination, payout).await {
            Ok(signature) => signature,
            Err(err) => {
                self.release_payout_reservation(wallet_id, caller_id).await;
                return Err(err.into());
            }
        };

        let user = caller_id.to_string();
        let updated = self
            .wallets
            .update_wallet(wallet_id, Box::new(move |w| record_payout(w, &user, signature)))
            .await?;

        info!(wallet_id = %updated.id, winner = %caller_id, amount = payout, "winner refund complete");

        self.close_if_drained(&updated).await;
        self.sync.trigger(&updated.bill_id);
        self.events.emit(LedgerEvent::WithdrawalCompleted {
            wallet_id: updated.id.clone(),
            user_id: caller_id.to_string(),
            amount: payout,
            kind: WithdrawalKind::Winner,
        });
        Ok(signature)
    }

    /// Degen loser settlement: pay the bill from the loser's locked funds
    /// to their resolved external destination.
    pub async fn withdraw_loser(
        &self,
        wallet_id: &str,
        caller_id: &str,
    ) -> Result<TransactionSignature> {
        let wallet = self.load_wallet(wallet_id).await?;
        self.guard_degen_settled(&wallet)?;

        if wallet.degen_loser.as_deref() != Some(caller_id) {
            return Err(LedgerError::Authorization(format!(
                "{} is not the roulette loser for wallet {}",
                caller_id, wallet.id
            )));
        }
        let participant = wallet.participant(caller_id).ok_or_else(|| {
            LedgerError::ParticipantNotFound {
                wallet_id: wallet.id.clone(),
                user_id: caller_id.to_string(),
            }
        })?;
        if participant.status == ParticipantStatus::Paid {
            return Err(LedgerError::AlreadySettled(format!(
                "loser {} already settled",
                caller_id
            )));
        }
        let settlement_due = participant.amount_owed;

        let destination = self.payouts.resolve(caller_id).await?;
        let signer = self.custodial_signer(&wallet.id, caller_id).await?;

        // Reserve the payout before any funds move
        let user = caller_id.to_string();
        self.wallets
            .update_wallet(wallet_id, Box::new(move |w| reserve_payout(w, &user)))
            .await?;

        let balance = match self.chain.get_balance(&wallet.wallet_address).await {
            Ok(balance) => balance,
            Err(err) => {
                self.release_payout_reservation(wallet_id, caller_id).await;
                return Err(err.into());
            }
        };
        let payout = settlement_due.min(balance);
        if payout == 0 {
            self.release_payout_reservation(wallet_id, caller_id).await;
            return Err(LedgerError::InsufficientBalance {
                available: balance,
                required: settlement_due,
            });
        }

        let signature = match self.chain.transfer(&signer, &destination, payout).await {
            Ok(signature) => signature,
            Err(err) => {
                self.release_payout_reservation(wallet_id, caller_id).await;
                return Err(err.into());
            }
        };

        let user = caller_id.to_string();
        let updated = self
            .wallets
            .update_wallet(wallet_id, Box::new(move |w| record_payout(w, &user, signature)))
            .await?;

        info!(wallet_id = %updated.id, loser = %caller_id, amount = payout, "loser settlement complete");

        self.close_if_drained(&updated).await;
        self.sync.trigger(&updated.bill_id);
        self.events.emit(LedgerEvent::WithdrawalCompleted {
            wallet_id: updated.id.clone(),
            user_id: caller_id.to_string(),
            amount: payout,
            kind: WithdrawalKind::Loser,
        });
        Ok(signature)
    }

    async fn load_wallet(&self, wallet_id: &str) -> Result<SplitWallet> {
        self.wallets
            .get_wallet(wallet_id)
            .await?
            .ok_or_else(|| LedgerError::WalletNotFound(wallet_id.to_string()))
    }

    /// Degen payouts are only legal after the roulette has settled.
    fn guard_degen_settled(&self, wallet: &SplitWallet) -> Result<()> {
        if wallet.mode != SplitMode::Degen {
            return Err(LedgerError::Validation(format!(
                "wallet {} is not a degen wallet",
                wallet.id
            )));
        }
        match wallet.status {
            WalletStatus::SpinningCompleted => Ok(()),
            WalletStatus::Completed | WalletStatus::Closed => {
                Err(LedgerError::AlreadySettled(wallet.id.clone()))
            }
            other => Err(LedgerError::Validation(format!(
                "wallet {} is {:?}; roulette has not settled",
                wallet.id, other
            ))),
        }
    }

    /// Decrypt the custodial key for an authorized requester and rebuild
    /// the signing keypair.
    async fn custodial_signer(&self, wallet_id: &str, requester_id: &str) -> Result<Keypair> {
        let secret = self.vault.get_key(wallet_id, requester_id).await?;
        Keypair::try_from(secret.as_ref())
            .map_err(|e| LedgerError::Vault(format!("stored key is not a valid keypair: {}", e)))
    }

    /// Undo a creator reservation whose transfer never happened: the
    /// status is recomputed from the participants, since nothing else
    /// writes a reserved wallet.
    async fn release_wallet_reservation(&self, wallet_id: &str) {
        let result = self
            .wallets
            .update_wallet(
                wallet_id,
                Box::new(|w| {
                    w.status = if w.all_settled_in() {
                        w.funded_status()
                    } else if w.total_paid() > 0 {
                        WalletStatus::Funding
                    } else {
                        WalletStatus::Pending
                    };
                    w.last_updated = crate::now();
                    Ok(())
                }),
            )
            .await;
        if let Err(err) = result {
            error!(wallet_id, "failed to release withdrawal reservation: {}", err);
        }
    }

    /// Undo a payout reservation whose transfer never happened.
    async fn release_payout_reservation(&self, wallet_id: &str, user_id: &str) {
        let user = user_id.to_string();
        let result = self
            .wallets
            .update_wallet(
                wallet_id,
                Box::new(move |w| {
                    if let Some(p) = w.participant_mut(&user) {
                        p.status = ParticipantStatus::Locked;
                        p.paid_at = None;
                    }
                    w.last_updated = crate::now();
                    Ok(())
                }),
            )
            .await;
        if let Err(err) = result {
            error!(wallet_id, user_id, "failed to release payout reservation: {}", err);
        }
    }

    /// Close the wallet and delete its key once the pot is down to dust
    /// and every participant has settled.
    async fn close_if_drained(&self, wallet: &SplitWallet) {
        let balance = match self.chain.get_balance(&wallet.wallet_address).await {
            Ok(balance) => balance,
            Err(err) => {
                warn!(wallet_id = %wallet.id, "close check skipped, balance unavailable: {}", err);
                return;
            }
        };
        if balance > DUST_TOLERANCE {
            return;
        }
        let all_paid = wallet
            .participants
            .iter()
            .all(|p| p.status == ParticipantStatus::Paid);
        if !all_paid {
            return;
        }

        let result = self
            .wallets
            .update_wallet(
                &wallet.id,
                Box::new(|w| {
                    if !w.status.can_transition_to(WalletStatus::Closed) {
                        return Err(LedgerError::AlreadySettled(w.id.clone()));
                    }
                    let now = crate::now();
                    w.status = WalletStatus::Closed;
                    w.completed_at = Some(now);
                    w.last_updated = now;
                    Ok(())
                }),
            )
            .await
            .map_err(LedgerError::from);

        match result {
            Ok(closed) => {
                info!(wallet_id = %closed.id, "wallet drained and closed");
                if let Err(err) = self.vault.delete_key(&closed.id).await {
                    warn!(wallet_id = %closed.id, "key cleanup failed on close: {}", err);
                }
                self.events.emit(LedgerEvent::WalletClosed { wallet_id: closed.id });
            }
            Err(LedgerError::AlreadySettled(_)) => {}
            Err(err) => warn!(wallet_id = %wallet.id, "close failed: {}", err),
        }
    }
}

/// Reserve a degen payout: mark the participant paid under the store's
/// atomic update, with the roulette status guard in the same write. Of
/// two concurrent withdrawals for one participant, exactly one reserves.
fn reserve_payout(w: &mut SplitWallet, user_id: &str) -> tabsplit_core::Result<()> {
    match w.status {
        WalletStatus::SpinningCompleted => {}
        WalletStatus::Completed | WalletStatus::Closed => {
            return Err(LedgerError::AlreadySettled(w.id.clone()));
        }
        other => {
            return Err(LedgerError::Validation(format!(
                "wallet {} is {:?}; roulette has not settled",
                w.id, other
            )));
        }
    }
    let wallet_id = w.id.clone();
    let p = w
        .participant_mut(user_id)
        .ok_or_else(|| LedgerError::ParticipantNotFound {
            wallet_id,
            user_id: user_id.to_string(),
        })?;
    if p.status == ParticipantStatus::Paid {
        return Err(LedgerError::AlreadySettled(format!("{} already paid out", user_id)));
    }
    p.status = ParticipantStatus::Paid;
    p.paid_at = Some(crate::now());
    w.last_updated = crate::now();
    Ok(())
}

/// Record the landed payout signature against a reserved participant.
fn record_payout(
    w: &mut SplitWallet,
    user_id: &str,
    signature: TransactionSignature,
) -> tabsplit_core::Result<()> {
    let wallet_id = w.id.clone();
    let p = w
        .participant_mut(user_id)
        .ok_or_else(|| LedgerError::ParticipantNotFound {
            wallet_id,
            user_id: user_id.to_string(),
        })?;
    p.payout_signature = Some(signature);
    w.last_updated = crate::now();
    Ok(())
}
