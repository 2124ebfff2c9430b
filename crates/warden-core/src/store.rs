//! Keystore backends
//!
//! Wallets and accounts are persisted as encrypted records: the secret scalar
//! is sealed with ChaCha20-Poly1305 under a passphrase-derived key, while the
//! public key and (for distributed accounts) the threshold metadata stay in
//! the clear. Two backends are provided: a filesystem store (one directory
//! per wallet, one JSON record per account) and an in-memory store for tests.

use crate::{AccountPath, Error, Result};
use async_trait::async_trait;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// Secret key material sealed under a passphrase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedKey {
    /// ChaCha20-Poly1305 ciphertext of the 32-byte secret scalar
    pub ciphertext: Vec<u8>,
    /// Nonce used for encryption (12 bytes)
    pub nonce: [u8; 12],
    /// Key derivation salt (32 bytes)
    pub salt: [u8; 32],
}

impl EncryptedKey {
    /// Seal a secret under a passphrase
    pub fn seal(secret: &[u8], passphrase: &str) -> Result<Self> {
        let nonce_bytes: [u8; 12] = rand::random();
        let salt: [u8; 32] = rand::random();

        let key = derive_key_from_passphrase(passphrase, &salt);
        let cipher = ChaCha20Poly1305::new(&key.into());
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), secret)
            .map_err(|e| Error::Crypto(format!("encryption failed: {e}")))?;

        Ok(Self {
            ciphertext,
            nonce: nonce_bytes,
            salt,
        })
    }

    /// Attempt to open with a candidate passphrase
    ///
    /// Returns `None` when the passphrase does not authenticate; errors are
    /// reserved for structural problems.
    pub fn open(&self, passphrase: &str) -> Option<Vec<u8>> {
        let key = derive_key_from_passphrase(passphrase, &self.salt);
        let cipher = ChaCha20Poly1305::new(&key.into());
        cipher
            .decrypt(Nonce::from_slice(&self.nonce), self.ciphertext.as_ref())
            .ok()
    }
}

/// Threshold metadata carried by a distributed account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedInfo {
    /// This server's participant id for the account
    pub id: u64,
    /// Number of participants required to sign
    pub threshold: u32,
    /// Participant id to endpoint, identical across the cluster
    pub participants: BTreeMap<u64, String>,
    /// Group verification vector (compressed G1 points, threshold entries)
    pub verification_vector: Vec<Vec<u8>>,
}

/// On-disk account record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredAccount {
    /// `wallet/account` path
    pub path: AccountPath,
    /// Compressed public key; for a distributed account this is the group key
    pub public_key: Vec<u8>,
    /// Sealed secret scalar (full key, or this server's share)
    pub crypto: EncryptedKey,
    /// Present iff the account is distributed
    pub distributed: Option<DistributedInfo>,
    /// Creation timestamp (Unix seconds)
    pub created_at: i64,
    /// Record format version
    pub version: u32,
}

impl StoredAccount {
    /// Current version of the account record format
    pub const CURRENT_VERSION: u32 = 1;

    /// Build a record, sealing the secret under the passphrase
    pub fn seal(
        path: AccountPath,
        public_key: Vec<u8>,
        secret: &[u8],
        passphrase: &str,
        distributed: Option<DistributedInfo>,
    ) -> Result<Self> {
        Ok(Self {
            path,
            public_key,
            crypto: EncryptedKey::seal(secret, passphrase)?,
            distributed,
            created_at: unix_now(),
            version: Self::CURRENT_VERSION,
        })
    }
}

/// Trait for wallet/account storage backends
#[async_trait]
pub trait Store: Send + Sync {
    /// Name of this store, used in logs and collision reports
    fn name(&self) -> &str;

    /// Enumerate wallet names
    async fn wallets(&self) -> Result<Vec<String>>;

    /// Enumerate account records in a wallet
    async fn accounts(&self, wallet: &str) -> Result<Vec<StoredAccount>>;

    /// Whether a wallet exists
    async fn has_wallet(&self, wallet: &str) -> Result<bool>;

    /// Whether an account exists
    async fn has_account(&self, path: &AccountPath) -> Result<bool>;

    /// Create an empty wallet; errors if it already exists
    async fn create_wallet(&self, wallet: &str) -> Result<()>;

    /// Persist an account record; errors if the path is taken
    async fn save_account(&self, record: &StoredAccount) -> Result<()>;
}

/// In-memory store for tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    wallets: RwLock<HashMap<String, HashMap<String, StoredAccount>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn wallets(&self) -> Result<Vec<String>> {
        Ok(self.wallets.read().await.keys().cloned().collect())
    }

    async fn accounts(&self, wallet: &str) -> Result<Vec<StoredAccount>> {
        let wallets = self.wallets.read().await;
        Ok(wallets
            .get(wallet)
            .map(|accounts| accounts.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn has_wallet(&self, wallet: &str) -> Result<bool> {
        Ok(self.wallets.read().await.contains_key(wallet))
    }

    async fn has_account(&self, path: &AccountPath) -> Result<bool> {
        let wallets = self.wallets.read().await;
        Ok(wallets
            .get(path.wallet())
            .is_some_and(|accounts| accounts.contains_key(path.account())))
    }

    async fn create_wallet(&self, wallet: &str) -> Result<()> {
        let mut wallets = self.wallets.write().await;
        if wallets.contains_key(wallet) {
            return Err(Error::Invalid(format!("wallet {wallet} already exists")));
        }
        wallets.insert(wallet.to_string(), HashMap::new());
        Ok(())
    }

    async fn save_account(&self, record: &StoredAccount) -> Result<()> {
        let mut wallets = self.wallets.write().await;
        let accounts = wallets
            .get_mut(record.path.wallet())
            .ok_or_else(|| Error::NotFound(format!("wallet {}", record.path.wallet())))?;
        if accounts.contains_key(record.path.account()) {
            return Err(Error::Invalid(format!(
                "account {} already exists",
                record.path
            )));
        }
        accounts.insert(record.path.account().to_string(), record.clone());
        Ok(())
    }
}

/// Filesystem store: one directory per wallet, one JSON record per account
#[derive(Debug)]
pub struct FilesystemStore {
    base_path: PathBuf,
    name: String,
}

impl FilesystemStore {
    /// Open (creating if necessary) a store rooted at `base_path`
    pub fn open(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        if !base_path.exists() {
            std::fs::create_dir_all(&base_path)?;
        }
        let name = base_path.to_string_lossy().into_owned();
        Ok(Self { base_path, name })
    }

    fn wallet_path(&self, wallet: &str) -> PathBuf {
        self.base_path.join(wallet)
    }

    fn account_path(&self, path: &AccountPath) -> PathBuf {
        self.base_path
            .join(path.wallet())
            .join(format!("{}.json", path.account()))
    }
}

#[async_trait]
impl Store for FilesystemStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn wallets(&self) -> Result<Vec<String>> {
        let mut wallets = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    wallets.push(name.to_string());
                }
            }
        }
        Ok(wallets)
    }

    async fn accounts(&self, wallet: &str) -> Result<Vec<StoredAccount>> {
        let wallet_dir = self.wallet_path(wallet);
        if !wallet_dir.exists() {
            return Ok(Vec::new());
        }

        let mut accounts = Vec::new();
        let mut entries = tokio::fs::read_dir(&wallet_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let data = tokio::fs::read(&path).await?;
            let record: StoredAccount = serde_json::from_slice(&data).map_err(|e| {
                Error::Storage(format!("corrupt account record {}: {e}", path.display()))
            })?;
            accounts.push(record);
        }
        Ok(accounts)
    }

    async fn has_wallet(&self, wallet: &str) -> Result<bool> {
        Ok(self.wallet_path(wallet).is_dir())
    }

    async fn has_account(&self, path: &AccountPath) -> Result<bool> {
        Ok(self.account_path(path).is_file())
    }

    async fn create_wallet(&self, wallet: &str) -> Result<()> {
        let wallet_dir = self.wallet_path(wallet);
        if wallet_dir.exists() {
            return Err(Error::Invalid(format!("wallet {wallet} already exists")));
        }
        tokio::fs::create_dir_all(&wallet_dir).await?;
        Ok(())
    }

    async fn save_account(&self, record: &StoredAccount) -> Result<()> {
        let wallet_dir = self.wallet_path(record.path.wallet());
        if !wallet_dir.is_dir() {
            return Err(Error::NotFound(format!(
                "wallet {}",
                record.path.wallet()
            )));
        }
        let target = self.account_path(&record.path);
        if target.exists() {
            return Err(Error::Invalid(format!(
                "account {} already exists",
                record.path
            )));
        }

        // Write to a temp file, sync, then rename so a crash never leaves a
        // partial record.
        let data = serde_json::to_vec_pretty(record)?;
        let temp = target.with_extension("tmp");
        tokio::fs::write(&temp, &data).await?;
        let file = std::fs::File::open(&temp)?;
        file.sync_all()?;
        tokio::fs::rename(&temp, &target).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&target, perms)?;
        }

        Ok(())
    }
}

/// Derive a sealing key from a passphrase with an SHA-256 stretch
pub fn derive_key_from_passphrase(passphrase: &str, salt: &[u8; 32]) -> [u8; 32] {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(passphrase.as_bytes());
    hasher.update(salt);
    let mut result = hasher.finalize();
    for _ in 0..10000 {
        let mut hasher = Sha256::new();
        hasher.update(result);
        hasher.update(salt);
        result = hasher.finalize();
    }

    result.into()
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
