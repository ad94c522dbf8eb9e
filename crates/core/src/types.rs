use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

/// 32-byte on-chain public key (ed25519)
pub type PublicKey = [u8; 32];

/// 64-byte transaction signature (use BigArray for serde support)
pub type TransactionSignature = [u8; 64];

/// Unix timestamp in seconds
pub type Timestamp = u64;

/// Amounts are integers in the smallest currency unit (lamports for SOL,
/// micro-units for USDC). Contribution accounting never touches floats.
pub type Amount = u64;

/// Dust tolerance when deciding whether a custodial wallet is drained.
/// Remaining lamports below this count as "zero" for closing purposes.
pub const DUST_TOLERANCE: Amount = 5_000;

/// How the bill is split and who ultimately pays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitMode {
    /// Each participant owes a share; the creator withdraws the pot.
    Fair,
    /// Every participant locks the full bill; a random loser pays, the
    /// rest are refunded.
    Degen,
    /// Fair variant whose withdrawal destination is a merchant.
    Spend,
}

impl SplitMode {
    /// Degen wallets authorize every participant on the key record;
    /// fair/spend wallets authorize the creator only.
    pub fn all_participants_hold_key(&self) -> bool {
        matches!(self, SplitMode::Degen)
    }
}

/// Wallet state machine.
///
/// `Pending → Funding → {AllLocked | FullyPaid} → SpinningCompleted →
/// Completed | Closed`. Transitions are monotonic; terminal states reject
/// every further transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletStatus {
    /// Created, no contributions yet
    Pending,
    /// At least one contribution recorded
    Funding,
    /// Degen: every participant has locked the full amount
    AllLocked,
    /// Fair/spend: every participant has paid their share
    FullyPaid,
    /// Degen: roulette executed, loser recorded
    SpinningCompleted,
    /// Funds withdrawn (terminal)
    Completed,
    /// Drained and retired, key record deleted (terminal)
    Closed,
}

impl WalletStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WalletStatus::Completed | WalletStatus::Closed)
    }

    /// Rank used to enforce monotonic transitions. Equal-rank states
    /// (AllLocked / FullyPaid) belong to different modes and never
    /// transition into each other.
    fn rank(&self) -> u8 {
        match self {
            WalletStatus::Pending => 0,
            WalletStatus::Funding => 1,
            WalletStatus::AllLocked | WalletStatus::FullyPaid => 2,
            WalletStatus::SpinningCompleted => 3,
            WalletStatus::Completed | WalletStatus::Closed => 4,
        }
    }

    /// Whether moving to `next` is a legal forward transition.
    pub fn can_transition_to(&self, next: WalletStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if *self == next {
            return false;
        }
        // AllLocked and FullyPaid share a rank but are mode-exclusive
        if self.rank() == next.rank() {
            return false;
        }
        next.rank() > self.rank()
    }
}

/// Participant position within a wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantStatus {
    /// Owes money, nothing (or not everything) contributed yet
    Pending,
    /// Degen: full amount contributed, awaiting the spin
    Locked,
    /// Fair/spend: share fully contributed. Degen: payout settled.
    Paid,
}

/// A bill participant's custodial position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: String,
    /// Destination for payouts (the participant's in-app wallet)
    pub wallet_address: PublicKey,
    pub amount_owed: Amount,
    /// Accumulated, never overwritten: each contribution adds to it.
    pub amount_paid: Amount,
    pub status: ParticipantStatus,
    /// Signature of the most recent contribution transfer
    #[serde(with = "opt_signature")]
    pub transaction_signature: Option<TransactionSignature>,
    /// Signature of this participant's payout (degen winner/loser)
    #[serde(with = "opt_signature")]
    pub payout_signature: Option<TransactionSignature>,
    pub paid_at: Option<Timestamp>,
}

impl Participant {
    /// Fresh participant with no payment history.
    pub fn new(user_id: impl Into<String>, wallet_address: PublicKey, amount_owed: Amount) -> Self {
        Self {
            user_id: user_id.into(),
            wallet_address,
            amount_owed,
            amount_paid: 0,
            status: ParticipantStatus::Pending,
            transaction_signature: None,
            payout_signature: None,
            paid_at: None,
        }
    }

    /// Whether this participant has contributed their full obligation.
    pub fn is_settled_in(&self) -> bool {
        matches!(self.status, ParticipantStatus::Locked | ParticipantStatus::Paid)
    }
}

/// Caller-supplied participant description for create/repartition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantInput {
    pub user_id: String,
    pub wallet_address: PublicKey,
}

/// Recorded inputs/outputs of the randomized loser selection, kept so the
/// draw can be audited after the fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouletteAudit {
    /// How the random value was derived (e.g. "os-csprng/u64/rejection-sampled")
    pub seed_source: String,
    /// Raw value drawn from the random source
    pub drawn_value: u64,
    /// Participant order the index was mapped onto
    pub participant_order: Vec<String>,
    pub selected_index: usize,
    pub timestamp: Timestamp,
}

/// The custodial ledger record. Source of truth for balances and
/// participants; the bill document is an eventually-consistent mirror.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitWallet {
    pub id: String,
    /// 1:1 with the parent bill
    pub bill_id: String,
    pub creator_id: String,
    pub currency: String,
    /// Total bill amount in smallest currency units
    pub total_amount: Amount,
    /// On-chain public key of the custodial account
    pub wallet_address: PublicKey,
    pub mode: SplitMode,
    pub status: WalletStatus,
    pub participants: Vec<Participant>,
    /// Degen: the participant selected to pay the bill
    pub degen_loser: Option<String>,
    pub roulette_audit: Option<RouletteAudit>,
    /// Signature of the creator/final withdrawal, kept for audit
    #[serde(with = "opt_signature")]
    pub withdrawal_signature: Option<TransactionSignature>,
    pub created_at: Timestamp,
    pub last_updated: Timestamp,
    pub completed_at: Option<Timestamp>,
}

impl SplitWallet {
    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn participant_mut(&mut self, user_id: &str) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.user_id == user_id)
    }

    /// Sum of recorded contributions across participants.
    pub fn total_paid(&self) -> Amount {
        self.participants.iter().map(|p| p.amount_paid).sum()
    }

    /// Whether every participant has fully contributed (locked or paid).
    pub fn all_settled_in(&self) -> bool {
        !self.participants.is_empty() && self.participants.iter().all(|p| p.is_settled_in())
    }

    /// Status a fully-funded wallet should move to, by mode.
    pub fn funded_status(&self) -> WalletStatus {
        match self.mode {
            SplitMode::Degen => WalletStatus::AllLocked,
            SplitMode::Fair | SplitMode::Spend => WalletStatus::FullyPaid,
        }
    }
}

/// User-facing mirror of the wallet, owned by the bill document. Only the
/// cross-store synchronizer writes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillRecord {
    pub bill_id: String,
    pub wallet_id: String,
    pub wallet_address: PublicKey,
    pub status: WalletStatus,
    pub participants: Vec<ParticipantSummary>,
    pub updated_at: Timestamp,
}

/// Participant fields the bill UI needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantSummary {
    pub user_id: String,
    pub amount_owed: Amount,
    pub amount_paid: Amount,
    pub status: ParticipantStatus,
}

impl BillRecord {
    /// Project the authoritative wallet into its bill mirror.
    pub fn project(wallet: &SplitWallet, now: Timestamp) -> Self {
        Self {
            bill_id: wallet.bill_id.clone(),
            wallet_id: wallet.id.clone(),
            wallet_address: wallet.wallet_address,
            status: wallet.status,
            participants: wallet
                .participants
                .iter()
                .map(|p| ParticipantSummary {
                    user_id: p.user_id.clone(),
                    amount_owed: p.amount_owed,
                    amount_paid: p.amount_paid,
                    status: p.status,
                })
                .collect(),
            updated_at: now,
        }
    }
}

/// Serde helper for `Option<[u8; 64]>` (BigArray only covers the bare array).
mod opt_signature {
    use super::*;
    use serde::{Deserializer, Serializer};

    #[derive(Serialize, Deserialize)]
    struct Wrapper(#[serde(with = "BigArray")] TransactionSignature);

    pub fn serialize<S: Serializer>(
        value: &Option<TransactionSignature>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        value.map(Wrapper).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<TransactionSignature>, D::Error> {
        Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|w| w.0))
    }
}
