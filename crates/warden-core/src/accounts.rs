//! Runtime account handles
//!
//! An [`Account`] wraps a stored record with the in-process unlocked state.
//! Unlocking decrypts the secret scalar and keeps it for the process
//! lifetime; locking drops it again. For distributed accounts the handle
//! carries the threshold metadata and the decrypted value is this server's
//! Shamir share rather than the full key.

use crate::bls;
use crate::store::{DistributedInfo, StoredAccount};
use crate::{AccountPath, Error, Result};
use parking_lot::Mutex;
use std::fmt;

pub struct Account {
    path: AccountPath,
    store_name: String,
    record: StoredAccount,
    secret: Mutex<Option<bls::SecretKey>>,
}

impl Account {
    /// Build a handle from a stored record
    pub fn from_record(store_name: &str, record: StoredAccount) -> Self {
        Self {
            path: record.path.clone(),
            store_name: store_name.to_string(),
            record,
            secret: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &AccountPath {
        &self.path
    }

    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    /// Compressed public key; the group key for distributed accounts
    pub fn public_key(&self) -> &[u8] {
        &self.record.public_key
    }

    pub fn is_distributed(&self) -> bool {
        self.record.distributed.is_some()
    }

    pub fn distributed(&self) -> Option<&DistributedInfo> {
        self.record.distributed.as_ref()
    }

    /// Group verification vector decoded to curve points
    pub fn verification_vector(&self) -> Result<Vec<bls::PublicKey>> {
        let info = self
            .record
            .distributed
            .as_ref()
            .ok_or_else(|| Error::Invalid(format!("{} is not distributed", self.path)))?;
        info.verification_vector
            .iter()
            .map(|bytes| bls::PublicKey::from_bytes(bytes))
            .collect()
    }

    pub fn is_unlocked(&self) -> bool {
        self.secret.lock().is_some()
    }

    /// Try to unlock with a candidate passphrase
    ///
    /// Returns true when the account is unlocked afterwards, whether by this
    /// call or a previous one. The decrypted key is validated against the
    /// stored public material before it is accepted.
    pub fn try_unlock(&self, passphrase: &str) -> Result<bool> {
        let mut secret = self.secret.lock();
        if secret.is_some() {
            return Ok(true);
        }

        let Some(plaintext) = self.record.crypto.open(passphrase) else {
            return Ok(false);
        };
        let key = bls::SecretKey::from_bytes(&plaintext)?;

        let expected = match &self.record.distributed {
            None => bls::PublicKey::from_bytes(&self.record.public_key)?,
            Some(info) => {
                // The share's public key is the verification vector evaluated
                // at this server's participant id.
                let vector = self.verification_vector()?;
                bls::evaluate_verification_vector(&vector, info.id)
            }
        };
        if key.public_key() != expected {
            return Err(Error::Crypto(format!(
                "decrypted key for {} does not match its public key",
                self.path
            )));
        }

        *secret = Some(key);
        Ok(true)
    }

    /// Drop the decrypted key
    pub fn lock(&self) {
        *self.secret.lock() = None;
    }

    /// Sign a message with the account key
    ///
    /// For a distributed account this produces a partial signature from this
    /// server's share; combination is the process service's job.
    pub fn sign(&self, message: &[u8]) -> Result<bls::Signature> {
        let secret = self.secret.lock();
        match secret.as_ref() {
            Some(key) => Ok(key.sign(message)),
            None => Err(Error::Locked(self.path.to_string())),
        }
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("path", &self.path.to_string())
            .field("public_key", &hex::encode(&self.record.public_key))
            .field("distributed", &self.is_distributed())
            .field("unlocked", &self.is_unlocked())
            .finish()
    }
}
