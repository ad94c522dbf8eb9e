//! Contribution processor.
//!
//! Moves a participant's funds into the custodial wallet and records the
//! position. The ledger write is an atomic accumulate: `amount_paid`
//! grows by the contribution, never gets overwritten, so installments and
//! concurrent contributions from different participants both work without
//! coordination.

use tracing::{info, warn};

use tabsplit_chain::{Keypair, Signer};
use tabsplit_core::{Amount, LedgerError, Participant, ParticipantStatus, Result, WalletStatus};

use crate::{LedgerEvent, LedgerService};

/// A participant funding their position.
pub struct ContributeRequest<'a> {
    pub wallet_id: &'a str,
    pub user_id: &'a str,
    pub amount: Amount,
    /// Signer of the participant's in-app wallet; the service submits the
    /// transfer and persists the confirmed signature.
    pub funder: &'a Keypair,
}

impl LedgerService {
    /// Accept a contribution into the custodial wallet.
    ///
    /// The transfer is verified (balance check), submitted, and confirmed
    /// before the ledger write. A mirror failure after that point is
    /// queued for reconciliation, never surfaced — the funds have already
    /// moved on-chain.
    pub async fn contribute(&self, req: ContributeRequest<'_>) -> Result<Participant> {
        if req.amount == 0 {
            return Err(LedgerError::Validation("contribution must be positive".into()));
        }

        let wallet = self
            .wallets
            .get_wallet(req.wallet_id)
            .await?
            .ok_or_else(|| LedgerError::WalletNotFound(req.wallet_id.to_string()))?;

        if wallet.status.is_terminal() {
            return Err(LedgerError::AlreadySettled(wallet.id));
        }

        // Never fall back to caller-supplied participant data
        let participant = wallet.participant(req.user_id).ok_or_else(|| {
            LedgerError::ParticipantNotFound {
                wallet_id: req.wallet_id.to_string(),
                user_id: req.user_id.to_string(),
            }
        })?;

        if participant.is_settled_in() {
            return Err(LedgerError::AlreadySettled(format!(
                "participant {} already {:?}",
                req.user_id, participant.status
            )));
        }

        // Verify the funder can cover the transfer before submitting
        let funder_address = req.funder.pubkey().to_bytes();
        let available = self.chain.get_balance(&funder_address).await?;
        if available < req.amount {
            return Err(LedgerError::InsufficientBalance {
                available,
                required: req.amount,
            });
        }

        let signature = self
            .chain
            .transfer(req.funder, &wallet.wallet_address, req.amount)
            .await?;

        // Funds are on-chain; from here on the ledger write must land.
        let amount = req.amount;
        let user_id = req.user_id.to_string();
        let updated = self
            .wallets
            .update_wallet(
                req.wallet_id,
                Box::new(move |w| {
                    let mode = w.mode;
                    let wallet_id = w.id.clone();
                    let p = w.participant_mut(&user_id).ok_or_else(|| {
                        LedgerError::ParticipantNotFound {
                            wallet_id,
                            user_id: user_id.clone(),
                        }
                    })?;

                    // Accumulate, never overwrite
                    let raw_total = p.amount_paid.saturating_add(amount);
                    if raw_total > p.amount_owed {
                        warn!(
                            user_id = %p.user_id,
                            raw_total,
                            owed = p.amount_owed,
                            "contribution exceeds obligation; capping at amount owed"
                        );
                    }
                    p.amount_paid = raw_total.min(p.amount_owed);
                    p.transaction_signature = Some(signature);

                    if p.amount_paid >= p.amount_owed {
                        p.status = if mode.all_participants_hold_key() {
                            ParticipantStatus::Locked
                        } else {
                            ParticipantStatus::Paid
                        };
                        p.paid_at = Some(crate::now());
                    }

                    if w.status == WalletStatus::Pending
                        && w.status.can_transition_to(WalletStatus::Funding)
                    {
                        w.status = WalletStatus::Funding;
                    }
                    let funded = w.funded_status();
                    if w.all_settled_in() && w.status.can_transition_to(funded) {
                        w.status = funded;
                    }
                    w.last_updated = crate::now();
                    Ok(())
                }),
            )
            .await?;

        let participant = updated
            .participant(req.user_id)
            .cloned()
            .expect("participant present after update");

        info!(
            wallet_id = %updated.id,
            user_id = %req.user_id,
            amount = req.amount,
            paid = participant.amount_paid,
            wallet_status = ?updated.status,
            "contribution recorded"
        );

        // Non-blocking mirror; a failure is queued, not surfaced
        self.sync.trigger(&updated.bill_id);
        self.events.emit(LedgerEvent::ContributionRecorded {
            wallet_id: updated.id.clone(),
            user_id: req.user_id.to_string(),
            amount: req.amount,
            total_paid: participant.amount_paid,
        });

        Ok(participant)
    }
}
