//! TabSplit Vault
//!
//! Encrypted storage for custodial wallet keys with a per-wallet
//! access-control list.
//!
//! Each record is sealed with AES-256-GCM under a key derived from the
//! vault's master secret and a per-record random salt (HKDF-SHA256), with
//! a random nonce per encryption. Plaintext keys are never persisted or
//! logged. Decryption first verifies the requester against the record's
//! `authorized_participants` list; absence is a hard authorization
//! failure, never a fallback path.
//!
//! Decrypted keys are cached for a short TTL and encrypted payloads for a
//! longer one; both caches are dropped on any ACL mutation.

mod cache;

use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use hkdf::Hkdf;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, info};

use tabsplit_core::LedgerError;

use crate::cache::TtlCache;

/// Decrypted keys stay cached for minutes, not hours.
const DECRYPTED_KEY_TTL: Duration = Duration::from_secs(5 * 60);
/// Encrypted payloads can live longer; they are useless without the vault.
const ENCRYPTED_RECORD_TTL: Duration = Duration::from_secs(60 * 60);

/// Current encryption scheme: HKDF-SHA256 + AES-256-GCM.
const ALGORITHM_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("key record not found for wallet {0}")]
    RecordNotFound(String),

    #[error("user {user_id} is not an authorized key holder for wallet {wallet_id}")]
    NotAuthorized { wallet_id: String, user_id: String },

    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("key store unavailable: {0}")]
    Unavailable(String),
}

impl From<VaultError> for LedgerError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::NotAuthorized { .. } => LedgerError::Authorization(err.to_string()),
            other => LedgerError::Vault(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;

/// A user allowed to decrypt a wallet's key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizedParticipant {
    pub user_id: String,
    pub name: String,
}

impl AuthorizedParticipant {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), name: name.into() }
    }
}

/// Persisted custodial secret material. Ciphertext only; the plaintext
/// key exists in memory just long enough to sign a withdrawal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedKeyRecord {
    pub wallet_id: String,
    pub ciphertext: Vec<u8>,
    /// AES-GCM nonce (96-bit)
    pub iv: [u8; 12],
    /// HKDF salt, random per record
    pub salt: [u8; 16],
    pub algorithm_version: u32,
    pub authorized_participants: Vec<AuthorizedParticipant>,
}

impl EncryptedKeyRecord {
    pub fn is_authorized(&self, user_id: &str) -> bool {
        self.authorized_participants.iter().any(|p| p.user_id == user_id)
    }
}

/// Persistence seam for key records, keyed by wallet id. Only the vault
/// mutates these documents.
#[async_trait]
pub trait KeyRecordStore: Send + Sync {
    async fn get(&self, wallet_id: &str) -> Result<Option<EncryptedKeyRecord>>;
    async fn put(&self, record: EncryptedKeyRecord) -> Result<()>;
    async fn delete(&self, wallet_id: &str) -> Result<()>;
}

#[async_trait]
impl<T: KeyRecordStore + ?Sized> KeyRecordStore for std::sync::Arc<T> {
    async fn get(&self, wallet_id: &str) -> Result<Option<EncryptedKeyRecord>> {
        (**self).get(wallet_id).await
    }

    async fn put(&self, record: EncryptedKeyRecord) -> Result<()> {
        (**self).put(record).await
    }

    async fn delete(&self, wallet_id: &str) -> Result<()> {
        (**self).delete(wallet_id).await
    }
}

/// In-memory key record store for tests and local development.
#[derive(Default)]
pub struct MemoryKeyStore {
    records: RwLock<std::collections::HashMap<String, EncryptedKeyRecord>>,
    fail_puts: std::sync::atomic::AtomicU32,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail (test injection for the creation
    /// rollback path).
    pub fn fail_next_puts(&self, n: u32) {
        self.fail_puts.store(n, std::sync::atomic::Ordering::SeqCst);
    }

    /// Number of stored records.
    pub fn record_count(&self) -> usize {
        self.records.read().len()
    }
}

#[async_trait]
impl KeyRecordStore for MemoryKeyStore {
    async fn get(&self, wallet_id: &str) -> Result<Option<EncryptedKeyRecord>> {
        Ok(self.records.read().get(wallet_id).cloned())
    }

    async fn put(&self, record: EncryptedKeyRecord) -> Result<()> {
        use std::sync::atomic::Ordering;
        let pending = self.fail_puts.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_puts.store(pending - 1, Ordering::SeqCst);
            return Err(VaultError::Unavailable("injected key store failure".into()));
        }
        self.records.write().insert(record.wallet_id.clone(), record);
        Ok(())
    }

    async fn delete(&self, wallet_id: &str) -> Result<()> {
        self.records.write().remove(wallet_id);
        Ok(())
    }
}

/// The key vault: encrypts, stores, and gate-keeps custodial wallet keys.
pub struct KeyVault {
    master_secret: [u8; 32],
    store: Box<dyn KeyRecordStore>,
    decrypted_cache: TtlCache<String, [u8; 64]>,
    encrypted_cache: TtlCache<String, EncryptedKeyRecord>,
}

impl KeyVault {
    pub fn new(master_secret: [u8; 32], store: impl KeyRecordStore + 'static) -> Self {
        Self {
            master_secret,
            store: Box::new(store),
            decrypted_cache: TtlCache::new(DECRYPTED_KEY_TTL),
            encrypted_cache: TtlCache::new(ENCRYPTED_RECORD_TTL),
        }
    }

    /// Encrypt and persist a wallet's secret key with its initial ACL.
    pub async fn store_key(
        &self,
        wallet_id: &str,
        secret_key: &[u8; 64],
        authorized_participants: Vec<AuthorizedParticipant>,
    ) -> Result<()> {
        let mut salt = [0u8; 16];
        let mut iv = [0u8; 12];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut iv);

        let cipher = self.cipher(&salt)?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), secret_key.as_slice())
            .map_err(|e| VaultError::Crypto(format!("encrypt: {}", e)))?;

        let record = EncryptedKeyRecord {
            wallet_id: wallet_id.to_string(),
            ciphertext,
            iv,
            salt,
            algorithm_version: ALGORITHM_VERSION,
            authorized_participants,
        };

        self.store.put(record).await?;
        info!(wallet_id, "stored encrypted key record");
        Ok(())
    }

    /// Decrypt a wallet's secret key for an authorized requester.
    ///
    /// The ACL check runs on every call, cached or not — a cache hit
    /// never bypasses authorization.
    pub async fn get_key(&self, wallet_id: &str, requester_id: &str) -> Result<[u8; 64]> {
        let record = self.load_record(wallet_id).await?;

        if !record.is_authorized(requester_id) {
            return Err(VaultError::NotAuthorized {
                wallet_id: wallet_id.to_string(),
                user_id: requester_id.to_string(),
            });
        }

        if let Some(key) = self.decrypted_cache.get(&record.wallet_id) {
            debug!(wallet_id, "decrypted key cache hit");
            return Ok(key);
        }

        let cipher = self.cipher(&record.salt)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&record.iv), record.ciphertext.as_slice())
            .map_err(|e| VaultError::Crypto(format!("decrypt: {}", e)))?;

        let key: [u8; 64] = plaintext
            .try_into()
            .map_err(|_| VaultError::Crypto("decrypted key is not 64 bytes".into()))?;

        self.decrypted_cache.insert(record.wallet_id, key);
        Ok(key)
    }

    /// Replace a record's ACL. Idempotent and safe to retry; invalidates
    /// both caches so revocations take effect immediately.
    pub async fn sync_authorized_participants(
        &self,
        wallet_id: &str,
        participants: Vec<AuthorizedParticipant>,
    ) -> Result<()> {
        let mut record = self
            .store
            .get(wallet_id)
            .await?
            .ok_or_else(|| VaultError::RecordNotFound(wallet_id.to_string()))?;

        if record.authorized_participants != participants {
            record.authorized_participants = participants;
            self.store.put(record).await?;
        }

        self.decrypted_cache.invalidate(&wallet_id.to_string());
        self.encrypted_cache.invalidate(&wallet_id.to_string());
        info!(wallet_id, "authorized participants synced");
        Ok(())
    }

    /// Remove a wallet's key record after terminal settlement.
    pub async fn delete_key(&self, wallet_id: &str) -> Result<()> {
        self.store.delete(wallet_id).await?;
        self.decrypted_cache.invalidate(&wallet_id.to_string());
        self.encrypted_cache.invalidate(&wallet_id.to_string());
        info!(wallet_id, "key record deleted");
        Ok(())
    }

    async fn load_record(&self, wallet_id: &str) -> Result<EncryptedKeyRecord> {
        if let Some(record) = self.encrypted_cache.get(&wallet_id.to_string()) {
            return Ok(record);
        }
        let record = self
            .store
            .get(wallet_id)
            .await?
            .ok_or_else(|| VaultError::RecordNotFound(wallet_id.to_string()))?;
        self.encrypted_cache.insert(wallet_id.to_string(), record.clone());
        Ok(record)
    }

    /// Derive the per-record AES key: HKDF-SHA256(master, salt).
    fn cipher(&self, salt: &[u8; 16]) -> Result<Aes256Gcm> {
        let hk = Hkdf::<Sha256>::new(Some(salt), &self.master_secret);
        let mut okm = [0u8; 32];
        hk.expand(b"tabsplit-wallet-key", &mut okm)
            .map_err(|e| VaultError::Crypto(format!("hkdf: {}", e)))?;
        Aes256Gcm::new_from_slice(&okm).map_err(|e| VaultError::Crypto(format!("cipher: {}", e)))
    }
}
