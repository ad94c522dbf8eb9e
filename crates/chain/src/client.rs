//! Chain client for custodial wallet transfers and balance checks.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::{
    commitment_config::CommitmentConfig,
    pubkey::Pubkey,
    signature::{Keypair, Signature, Signer},
    system_transaction,
};

use tabsplit_core::{Amount, PublicKey, TransactionSignature};

use crate::{ChainError, Result};

/// Chain mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainMode {
    /// Mock mode for development - balances tracked in-memory
    Mock,
    /// Live Solana mode
    Live,
}

/// Chain client configuration
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// Chain mode (Mock or Live)
    pub mode: ChainMode,
    /// Solana RPC endpoint (only used in Live mode)
    pub rpc_url: String,
    /// Commitment level for transactions
    pub commitment: String,
    /// Maximum attempts for a transient-failing operation
    pub max_attempts: u32,
    /// Base delay for exponential backoff between attempts
    pub retry_base: Duration,
    /// Upper bound on a single submit-and-confirm round
    pub confirm_timeout: Duration,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            mode: ChainMode::Mock,
            rpc_url: "https://api.devnet.solana.com".to_string(),
            commitment: "confirmed".to_string(),
            max_attempts: 4,
            retry_base: Duration::from_millis(250),
            confirm_timeout: Duration::from_secs(30),
        }
    }
}

impl ChainConfig {
    /// Create a mock configuration for development
    pub fn mock() -> Self {
        Self { mode: ChainMode::Mock, ..Default::default() }
    }

    /// Create a live configuration for Solana devnet
    pub fn devnet() -> Self {
        Self { mode: ChainMode::Live, ..Default::default() }
    }

    /// Create a live configuration for Solana mainnet
    pub fn mainnet() -> Self {
        Self {
            mode: ChainMode::Live,
            rpc_url: "https://api.mainnet-beta.solana.com".to_string(),
            commitment: "finalized".to_string(),
            ..Default::default()
        }
    }

    /// Get commitment config for Solana client
    fn commitment_config(&self) -> CommitmentConfig {
        match self.commitment.as_str() {
            "finalized" => CommitmentConfig::finalized(),
            "confirmed" => CommitmentConfig::confirmed(),
            "processed" => CommitmentConfig::processed(),
            _ => CommitmentConfig::confirmed(),
        }
    }
}

/// In-memory ledger for mock mode
#[derive(Debug, Default)]
struct MockLedger {
    /// Lamport balances by account
    balances: HashMap<PublicKey, Amount>,
    /// Signatures of transfers that have landed
    confirmed: HashSet<TransactionSignature>,
}

/// Chain client for balance checks and custodial transfers.
///
/// In mock mode all transfers settle instantly against the in-memory
/// ledger. In live mode transfers are submitted with a fresh blockhash per
/// attempt; after an ambiguous timeout the previously signed transaction
/// is re-checked on-chain before any resubmission, so a landed transfer is
/// never replayed.
pub struct ChainClient {
    config: ChainConfig,
    /// Solana RPC client (only used in Live mode)
    rpc_client: Option<Arc<RpcClient>>,
    /// Mock ledger (only used in Mock mode)
    mock_ledger: Arc<RwLock<MockLedger>>,
    /// Mock signature counter
    mock_tx_counter: AtomicU64,
    /// Remaining RPC calls to fail with a transient error (test injection)
    mock_fail_rpcs: AtomicU32,
}

impl ChainClient {
    pub fn new(config: ChainConfig) -> Self {
        let rpc_client = if config.mode == ChainMode::Live {
            Some(Arc::new(RpcClient::new_with_commitment(
                config.rpc_url.clone(),
                config.commitment_config(),
            )))
        } else {
            None
        };

        Self {
            config,
            rpc_client,
            mock_ledger: Arc::new(RwLock::new(MockLedger::default())),
            mock_tx_counter: AtomicU64::new(0),
            mock_fail_rpcs: AtomicU32::new(0),
        }
    }

    /// Check if running in mock mode
    pub fn is_mock(&self) -> bool {
        self.config.mode == ChainMode::Mock
    }

    fn rpc(&self) -> Result<&Arc<RpcClient>> {
        self.rpc_client.as_ref().ok_or(ChainError::NotInitialized)
    }

    /// Generate a mock signature
    fn generate_mock_signature(&self) -> TransactionSignature {
        let n = self.mock_tx_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let mut sig = [0u8; 64];
        sig[0..8].copy_from_slice(&n.to_le_bytes());
        sig[8..16].copy_from_slice(b"mocktxn!");
        sig
    }

    /// Consume one injected failure, if armed (mock mode)
    fn take_injected_failure(&self) -> Result<()> {
        let pending = self.mock_fail_rpcs.load(Ordering::SeqCst);
        if pending > 0 {
            self.mock_fail_rpcs.store(pending - 1, Ordering::SeqCst);
            return Err(ChainError::Rpc("injected transient failure".into()));
        }
        Ok(())
    }

    /// Exponential backoff delay for the given zero-based attempt
    fn backoff(&self, attempt: u32) -> Duration {
        self.config.retry_base * 2u32.saturating_pow(attempt)
    }

    // ==================== Balance ====================

    /// Get the lamport balance of an account.
    ///
    /// Transient RPC failures are retried with backoff up to
    /// `max_attempts` before surfacing.
    pub async fn get_balance(&self, address: &PublicKey) -> Result<Amount> {
        let mut last_err = ChainError::Timeout("get_balance".into());
        for attempt in 0..self.config.max_attempts {
            match self.get_balance_once(address).await {
                Ok(balance) => return Ok(balance),
                Err(e) if e.is_transient() => {
                    debug!(attempt, "get_balance transient failure: {}", e);
                    last_err = e;
                    tokio::time::sleep(self.backoff(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    async fn get_balance_once(&self, address: &PublicKey) -> Result<Amount> {
        if self.is_mock() {
            self.take_injected_failure()?;
            let ledger = self.mock_ledger.read().expect("chain lock poisoned");
            return Ok(ledger.balances.get(address).copied().unwrap_or(0));
        }

        let rpc = self.rpc()?;
        let pubkey = Pubkey::new_from_array(*address);
        rpc.get_balance(&pubkey)
            .await
            .map_err(|e| ChainError::Rpc(format!("get_balance: {}", e)))
    }

    // ==================== Transfer ====================

    /// Transfer lamports from `funder` to `to` and wait for confirmation.
    ///
    /// Each live attempt signs with a freshly fetched blockhash. If a
    /// submission times out ambiguously, the signed transaction's signature
    /// is checked on-chain before resubmitting — a transfer that landed is
    /// returned, not replayed.
    pub async fn transfer(
        &self,
        funder: &Keypair,
        to: &PublicKey,
        lamports: Amount,
    ) -> Result<TransactionSignature> {
        if self.is_mock() {
            return self.mock_transfer(funder, to, lamports);
        }

        let rpc = self.rpc()?;
        let to_pubkey = Pubkey::new_from_array(*to);
        let mut in_flight: Option<Signature> = None;
        let mut last_err = ChainError::Timeout("transfer".into());

        for attempt in 0..self.config.max_attempts {
            // A previous attempt may have landed even though we timed out
            if let Some(sig) = in_flight {
                if self.signature_landed(&sig).await? {
                    info!("transfer landed on earlier attempt: {}", sig);
                    return Ok(sig_bytes(&sig));
                }
            }

            let blockhash = rpc
                .get_latest_blockhash()
                .await
                .map_err(|e| ChainError::Rpc(format!("get_latest_blockhash: {}", e)))?;

            let tx = system_transaction::transfer(funder, &to_pubkey, lamports, blockhash);
            let sig = tx.signatures[0];

            let send = rpc.send_and_confirm_transaction(&tx);
            match tokio::time::timeout(self.config.confirm_timeout, send).await {
                Ok(Ok(confirmed)) => {
                    info!("transfer confirmed: {}", confirmed);
                    return Ok(sig_bytes(&confirmed));
                }
                Ok(Err(e)) => {
                    let err = classify_send_error(&e.to_string());
                    if !err.is_transient() {
                        return Err(err);
                    }
                    warn!(attempt, "transfer attempt failed: {}", err);
                    in_flight = Some(sig);
                    last_err = err;
                }
                Err(_) => {
                    warn!(attempt, "transfer confirmation timed out; will re-check {}", sig);
                    in_flight = Some(sig);
                    last_err = ChainError::Timeout("send_and_confirm".into());
                }
            }

            tokio::time::sleep(self.backoff(attempt)).await;
        }

        // Final landed-check before giving up
        if let Some(sig) = in_flight {
            if self.signature_landed(&sig).await.unwrap_or(false) {
                return Ok(sig_bytes(&sig));
            }
        }
        Err(last_err)
    }

    fn mock_transfer(
        &self,
        funder: &Keypair,
        to: &PublicKey,
        lamports: Amount,
    ) -> Result<TransactionSignature> {
        self.take_injected_failure()?;

        let from = funder.pubkey().to_bytes();
        let mut ledger = self.mock_ledger.write().expect("chain lock poisoned");

        let available = ledger.balances.get(&from).copied().unwrap_or(0);
        if available < lamports {
            return Err(ChainError::InsufficientFunds { available, required: lamports });
        }

        ledger.balances.insert(from, available - lamports);
        *ledger.balances.entry(*to).or_insert(0) += lamports;

        let sig = self.generate_mock_signature();
        ledger.confirmed.insert(sig);

        info!(
            "[MOCK] transferred {} lamports {} -> {}",
            lamports,
            hex_encode(&from[..8]),
            hex_encode(&to[..8]),
        );
        Ok(sig)
    }

    // ==================== Confirmation ====================

    /// Whether a transaction signature has landed at the configured
    /// commitment level.
    pub async fn confirm(&self, signature: &TransactionSignature) -> Result<bool> {
        if self.is_mock() {
            let ledger = self.mock_ledger.read().expect("chain lock poisoned");
            return Ok(ledger.confirmed.contains(signature));
        }

        let sig = Signature::from(*signature);
        self.signature_landed(&sig).await
    }

    async fn signature_landed(&self, sig: &Signature) -> Result<bool> {
        let rpc = self.rpc()?;
        let statuses = rpc
            .get_signature_statuses(&[*sig])
            .await
            .map_err(|e| ChainError::Rpc(format!("get_signature_statuses: {}", e)))?;

        match statuses.value.first().and_then(|s| s.as_ref()) {
            Some(status) => match &status.err {
                Some(err) => Err(ChainError::TransactionFailed(err.to_string())),
                None => Ok(status.satisfies_commitment(self.config.commitment_config())),
            },
            None => Ok(false),
        }
    }

    // ==================== Mock Helpers ====================

    /// Credit lamports to an account (mock mode only, for tests)
    pub fn mock_credit(&self, address: &PublicKey, lamports: Amount) {
        assert!(self.is_mock(), "mock_credit is mock-mode only");
        let mut ledger = self.mock_ledger.write().expect("chain lock poisoned");
        *ledger.balances.entry(*address).or_insert(0) += lamports;
    }

    /// Make the next `n` mock RPC calls fail with a transient error
    pub fn mock_fail_next_rpcs(&self, n: u32) {
        assert!(self.is_mock(), "mock_fail_next_rpcs is mock-mode only");
        self.mock_fail_rpcs.store(n, Ordering::SeqCst);
    }
}

/// Map a send error message onto the error taxonomy. Blockhash expiry and
/// node/transport flakiness are transient; simulation failures are not.
fn classify_send_error(msg: &str) -> ChainError {
    let lower = msg.to_lowercase();
    if lower.contains("blockhash") {
        ChainError::BlockhashExpired
    } else if lower.contains("timed out") || lower.contains("connection") || lower.contains("429") {
        ChainError::Rpc(msg.to_string())
    } else {
        ChainError::TransactionFailed(msg.to_string())
    }
}

/// Helper to encode bytes as hex (first N bytes)
fn hex_encode(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

fn sig_bytes(sig: &Signature) -> TransactionSignature {
    let mut bytes = [0u8; 64];
    bytes.copy_from_slice(sig.as_ref());
    bytes
}
