//! Wallet lifecycle: creation (with full rollback) and repartition.

use tracing::{error, info, warn};

use tabsplit_chain::{Keypair, Signer};
use tabsplit_core::{
    participant_shares, validate_participants, Amount, LedgerError, Participant, ParticipantInput,
    Result, SplitMode, SplitWallet, WalletStatus,
};
use tabsplit_vault::AuthorizedParticipant;

use crate::{LedgerEvent, LedgerService};

#[derive(Debug, Clone)]
pub struct CreateWalletRequest {
    pub bill_id: String,
    pub creator_id: String,
    pub total_amount: Amount,
    pub currency: String,
    pub participants: Vec<ParticipantInput>,
    pub mode: SplitMode,
}

impl LedgerService {
    /// Create the custodial wallet for a bill.
    ///
    /// The wallet document, its encrypted key record, and the bill mirror
    /// are written in that order; a failure at any later step rolls back
    /// the earlier writes. A wallet must never exist without a
    /// recoverable key, and the wallet and its parent bill must agree
    /// from the moment of creation.
    pub async fn create_wallet(&self, req: CreateWalletRequest) -> Result<SplitWallet> {
        if req.total_amount == 0 {
            return Err(LedgerError::Validation("total amount must be positive".into()));
        }
        validate_participants(&req.participants)?;

        // Idempotency guard: one non-terminal wallet per bill. The store
        // insert re-checks this atomically; this early check just gives a
        // clean error without burning a keypair.
        if let Some(existing) = self.wallets.find_active_by_bill(&req.bill_id).await? {
            return Err(LedgerError::Validation(format!(
                "bill {} already has active wallet {}",
                req.bill_id, existing.id
            )));
        }

        let keypair = Keypair::new();
        let wallet_address = keypair.pubkey().to_bytes();
        let secret = keypair.to_bytes();

        let shares = participant_shares(req.mode, req.total_amount, req.participants.len());
        let participants: Vec<Participant> = req
            .participants
            .iter()
            .zip(shares)
            .map(|(p, owed)| Participant::new(p.user_id.clone(), p.wallet_address, owed))
            .collect();

        let now = crate::now();
        let wallet = SplitWallet {
            id: uuid::Uuid::new_v4().to_string(),
            bill_id: req.bill_id.clone(),
            creator_id: req.creator_id.clone(),
            currency: req.currency.clone(),
            total_amount: req.total_amount,
            wallet_address,
            mode: req.mode,
            status: WalletStatus::Pending,
            participants,
            degen_loser: None,
            roulette_audit: None,
            withdrawal_signature: None,
            created_at: now,
            last_updated: now,
            completed_at: None,
        };

        self.wallets.insert_wallet(wallet.clone()).await?;

        // Degen: every participant may need to sign a payout. Fair/spend:
        // the creator alone holds the key.
        let holders = key_holders(&req.mode, &req.creator_id, &req.participants);
        if let Err(err) = self.vault.store_key(&wallet.id, &secret, holders).await {
            error!(wallet_id = %wallet.id, "key storage failed, rolling back wallet: {}", err);
            self.rollback_wallet(&wallet.id, false).await;
            return Err(err.into());
        }

        // Creation is the one moment the mirror write is synchronous and
        // load-bearing: a bill without its wallet reference is unusable.
        if let Err(err) = self.sync.sync_bill(&req.bill_id).await {
            error!(wallet_id = %wallet.id, "bill mirror failed at creation, rolling back: {}", err);
            self.rollback_wallet(&wallet.id, true).await;
            return Err(err);
        }

        info!(
            wallet_id = %wallet.id,
            bill_id = %req.bill_id,
            mode = ?req.mode,
            address = %hex::encode(&wallet_address[..8]),
            "split wallet created"
        );
        self.events.emit(LedgerEvent::WalletCreated {
            wallet_id: wallet.id.clone(),
            bill_id: req.bill_id,
        });
        Ok(wallet)
    }

    /// Repartition the wallet after an invite or a drop-out.
    ///
    /// Participants already present keep their payment state untouched;
    /// new entries start fresh; removals are only legal for participants
    /// with no recorded payment. Fair/spend obligations are redistributed
    /// equally; degen participants always owe the full bill.
    pub async fn update_participants(
        &self,
        wallet_id: &str,
        new_list: Vec<ParticipantInput>,
    ) -> Result<SplitWallet> {
        validate_participants(&new_list)?;

        let list = new_list.clone();
        let wallet = self
            .wallets
            .update_wallet(
                wallet_id,
                Box::new(move |w| {
                    if w.status.is_terminal() {
                        return Err(LedgerError::AlreadySettled(w.id.clone()));
                    }

                    // A participant with money in the pot cannot be
                    // silently dropped
                    for existing in &w.participants {
                        let kept = list.iter().any(|p| p.user_id == existing.user_id);
                        if !kept && existing.amount_paid > 0 {
                            return Err(LedgerError::Validation(format!(
                                "participant {} has paid {} and cannot be removed",
                                existing.user_id, existing.amount_paid
                            )));
                        }
                    }

                    let shares = participant_shares(w.mode, w.total_amount, list.len());
                    let mut merged = Vec::with_capacity(list.len());
                    for (input, owed) in list.iter().zip(shares) {
                        match w.participant(&input.user_id) {
                            Some(existing) => {
                                // Keep amount_paid / status / signatures;
                                // only the obligation is recomputed
                                let mut p = existing.clone();
                                p.amount_owed = owed;
                                p.wallet_address = input.wallet_address;
                                merged.push(p);
                            }
                            None => {
                                merged.push(Participant::new(
                                    input.user_id.clone(),
                                    input.wallet_address,
                                    owed,
                                ));
                            }
                        }
                    }
                    w.participants = merged;
                    w.last_updated = crate::now();
                    Ok(())
                }),
            )
            .await?;

        // Degen wallets keep the key ACL in step with the participant
        // list. Fail-soft: the repartition itself already committed.
        if wallet.mode.all_participants_hold_key() {
            let holders = wallet
                .participants
                .iter()
                .map(|p| AuthorizedParticipant::new(p.user_id.clone(), p.user_id.clone()))
                .collect();
            if let Err(err) = self.vault.sync_authorized_participants(&wallet.id, holders).await {
                warn!(wallet_id = %wallet.id, "key ACL sync failed after repartition: {}", err);
                self.sync.flag_reconciliation(&wallet.bill_id, "degen key ACL out of step", 0);
            }
        }

        self.sync.trigger(&wallet.bill_id);
        Ok(wallet)
    }

    /// Best-effort removal of the wallet and (optionally) its key record
    /// during creation rollback.
    async fn rollback_wallet(&self, wallet_id: &str, key_stored: bool) {
        if key_stored {
            if let Err(err) = self.vault.delete_key(wallet_id).await {
                error!(wallet_id, "rollback: key record delete failed: {}", err);
            }
        }
        if let Err(err) = self.wallets.delete_wallet(wallet_id).await {
            error!(wallet_id, "rollback: wallet delete failed: {}", err);
        }
    }
}

fn key_holders(
    mode: &SplitMode,
    creator_id: &str,
    participants: &[ParticipantInput],
) -> Vec<AuthorizedParticipant> {
    if mode.all_participants_hold_key() {
        participants
            .iter()
            .map(|p| AuthorizedParticipant::new(p.user_id.clone(), p.user_id.clone()))
            .collect()
    } else {
        vec![AuthorizedParticipant::new(creator_id, creator_id)]
    }
}
