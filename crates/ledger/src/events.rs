//! Ledger event stream.
//!
//! The reward/points pipeline subscribes to contribution and withdrawal
//! completions. Emission never fails the emitting operation: a send with
//! no subscribers is fine.

use tokio::sync::broadcast;
use tracing::debug;

use tabsplit_core::Amount;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Which withdrawal flow completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithdrawalKind {
    /// Fair/spend creator withdrawal
    Creator,
    /// Degen winner refund
    Winner,
    /// Degen loser settlement
    Loser,
}

#[derive(Debug, Clone)]
pub enum LedgerEvent {
    WalletCreated {
        wallet_id: String,
        bill_id: String,
    },
    ContributionRecorded {
        wallet_id: String,
        user_id: String,
        amount: Amount,
        total_paid: Amount,
    },
    RouletteSettled {
        wallet_id: String,
        loser_id: String,
    },
    WithdrawalCompleted {
        wallet_id: String,
        user_id: String,
        amount: Amount,
        kind: WithdrawalKind,
    },
    WalletClosed {
        wallet_id: String,
    },
}

pub struct EventBus {
    tx: broadcast::Sender<LedgerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: LedgerEvent) {
        // Err just means nobody is listening right now
        if self.tx.send(event).is_err() {
            debug!("ledger event dropped: no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(LedgerEvent::WalletClosed { wallet_id: "w1".into() });

        match rx.recv().await.unwrap() {
            LedgerEvent::WalletClosed { wallet_id } => assert_eq!(wallet_id, "w1"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(LedgerEvent::WalletClosed { wallet_id: "w1".into() });
    }
}
