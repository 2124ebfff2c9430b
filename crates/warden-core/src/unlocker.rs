//! Account unlocker
//!
//! Holds the passphrase candidates configured for this server and tries them
//! against a locked account on first use. Unlocking is idempotent; a handle
//! once unlocked stays unlocked for the process lifetime unless explicitly
//! locked again.

use crate::accounts::Account;
use crate::Result;
use tracing::debug;

pub struct Unlocker {
    passphrases: Vec<String>,
}

impl Unlocker {
    /// Build from the configured candidate sets
    ///
    /// Account passphrases are tried before wallet passphrases; duplicates
    /// are dropped.
    pub fn new(account_passphrases: Vec<String>, wallet_passphrases: Vec<String>) -> Self {
        let mut passphrases = account_passphrases;
        passphrases.extend(wallet_passphrases);
        let mut seen = std::collections::HashSet::new();
        passphrases.retain(|p| seen.insert(p.clone()));
        Self { passphrases }
    }

    /// Try to unlock an account with the configured candidates
    ///
    /// Returns true when the account ends up unlocked. The KDF makes each
    /// trial deliberately slow, so the first unlock of an account can take a
    /// while; subsequent calls return immediately.
    pub fn unlock_account(&self, account: &Account) -> Result<bool> {
        if account.is_unlocked() {
            return Ok(true);
        }
        for passphrase in &self.passphrases {
            if account.try_unlock(passphrase)? {
                debug!(account = %account.path(), "unlocked account");
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bls;
    use crate::store::StoredAccount;

    fn account(passphrase: &str) -> Account {
        let key = bls::SecretKey::random();
        let record = StoredAccount::seal(
            "w1/acct1".parse().unwrap(),
            key.public_key().to_bytes().to_vec(),
            &key.to_bytes(),
            passphrase,
            None,
        )
        .unwrap();
        Account::from_record("test", record)
    }

    #[test]
    fn test_tries_candidates_in_order() {
        let unlocker = Unlocker::new(
            vec!["first".to_string()],
            vec!["second".to_string(), "third".to_string()],
        );

        let account = account("third");
        assert!(unlocker.unlock_account(&account).unwrap());
        assert!(account.is_unlocked());

        let unknown = self::account("nope");
        assert!(!unlocker.unlock_account(&unknown).unwrap());
        assert!(!unknown.is_unlocked());
    }

    #[test]
    fn test_idempotent() {
        let unlocker = Unlocker::new(vec!["pass".to_string()], vec![]);
        let account = account("pass");
        assert!(unlocker.unlock_account(&account).unwrap());
        assert!(unlocker.unlock_account(&account).unwrap());
    }
}
