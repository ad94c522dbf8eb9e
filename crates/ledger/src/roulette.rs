//! Settlement engine: the degen roulette.
//!
//! Picks the loser uniformly from the locked participants with a
//! cryptographically secure draw. The status check and the settlement
//! write share one atomic update, so of two concurrent spins exactly one
//! commits; the other observes `spinning_completed` and gets
//! `AlreadySettled`.

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::info;

use tabsplit_core::{LedgerError, Result, RouletteAudit, WalletStatus};

use crate::{LedgerEvent, LedgerService};

/// Seed description recorded in the audit trail.
const SEED_SOURCE: &str = "os-csprng/u64/rejection-sampled";

#[derive(Debug, Clone)]
pub struct RouletteOutcome {
    pub loser_id: String,
    pub audit: RouletteAudit,
}

impl LedgerService {
    /// Execute the degen roulette for a wallet.
    ///
    /// Requires every participant locked and the wallet in `all_locked`.
    /// The loser, the audit record, and the `spinning_completed` status
    /// land in one atomic write.
    pub async fn execute_roulette(&self, wallet_id: &str) -> Result<RouletteOutcome> {
        let wallet = self
            .wallets
            .update_wallet(
                wallet_id,
                Box::new(move |w| {
                    match w.status {
                        WalletStatus::AllLocked => {}
                        WalletStatus::SpinningCompleted
                        | WalletStatus::Completed
                        | WalletStatus::Closed => {
                            return Err(LedgerError::AlreadySettled(w.id.clone()));
                        }
                        other => {
                            return Err(LedgerError::ParticipantsNotReady(format!(
                                "wallet {} is {:?}, not all_locked",
                                w.id, other
                            )));
                        }
                    }
                    if !w.all_settled_in() {
                        return Err(LedgerError::ParticipantsNotReady(format!(
                            "wallet {} has unlocked participants",
                            w.id
                        )));
                    }

                    let order: Vec<String> =
                        w.participants.iter().map(|p| p.user_id.clone()).collect();
                    let (drawn_value, selected_index) = draw_uniform(order.len());
                    let loser = order[selected_index].clone();

                    w.degen_loser = Some(loser);
                    w.roulette_audit = Some(RouletteAudit {
                        seed_source: SEED_SOURCE.to_string(),
                        drawn_value,
                        participant_order: order,
                        selected_index,
                        timestamp: crate::now(),
                    });
                    w.status = WalletStatus::SpinningCompleted;
                    w.last_updated = crate::now();
                    Ok(())
                }),
            )
            .await?;

        let loser_id = wallet.degen_loser.clone().expect("loser set by update");
        let audit = wallet.roulette_audit.clone().expect("audit set by update");

        info!(
            wallet_id = %wallet.id,
            loser = %loser_id,
            drawn_value = audit.drawn_value,
            "roulette settled"
        );

        self.sync.trigger(&wallet.bill_id);
        self.events.emit(LedgerEvent::RouletteSettled {
            wallet_id: wallet.id.clone(),
            loser_id: loser_id.clone(),
        });

        Ok(RouletteOutcome { loser_id, audit })
    }
}

/// Uniform draw over `0..n` from the OS CSPRNG.
///
/// Rejects values in the biased tail of the u64 range and resamples, so
/// the mapping is exactly uniform rather than modulo-skewed.
fn draw_uniform(n: usize) -> (u64, usize) {
    debug_assert!(n > 0);
    let n = n as u64;
    let limit = u64::MAX - (u64::MAX % n);
    loop {
        let value = OsRng.next_u64();
        if value < limit {
            return (value, (value % n) as usize);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_draw_index_in_range() {
        for n in 1..=10 {
            for _ in 0..100 {
                let (_, index) = draw_uniform(n);
                assert!(index < n);
            }
        }
    }

    #[test]
    fn test_draw_reaches_every_index() {
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let (_, index) = draw_uniform(3);
            seen.insert(index);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_draw_value_maps_to_index() {
        let (value, index) = draw_uniform(7);
        assert_eq!((value % 7) as usize, index);
    }

    #[test]
    fn test_single_participant_always_selected() {
        let (_, index) = draw_uniform(1);
        assert_eq!(index, 0);
    }
}
