//! Account fetcher
//!
//! In-memory index over the configured stores, mapping account path and
//! public key to a shared [`Account`] handle. Lookups take a read lock and
//! dominate; a wallet refresh after account creation takes the write lock.
//! Existing handles survive a refresh so unlocked state is not lost.

use crate::accounts::Account;
use crate::store::Store;
use crate::{AccountPath, Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

#[derive(Default)]
struct Index {
    by_path: HashMap<String, Arc<Account>>,
    by_public_key: HashMap<Vec<u8>, Arc<Account>>,
}

impl Index {
    fn insert(&mut self, account: Arc<Account>) {
        let path = account.path().to_string();
        if let Some(existing) = self.by_path.get(&path) {
            // First store wins when the same path appears twice.
            warn!(
                path = %path,
                kept = existing.store_name(),
                ignored = account.store_name(),
                "duplicate account path across stores"
            );
            return;
        }
        self.by_public_key
            .insert(account.public_key().to_vec(), Arc::clone(&account));
        self.by_path.insert(path, account);
    }
}

pub struct Fetcher {
    stores: Vec<Arc<dyn Store>>,
    index: RwLock<Index>,
}

impl Fetcher {
    /// Build the index from every wallet in every store
    pub async fn new(stores: Vec<Arc<dyn Store>>) -> Result<Self> {
        let fetcher = Self {
            stores,
            index: RwLock::new(Index::default()),
        };
        let wallets: Vec<String> = {
            let mut wallets = Vec::new();
            for store in &fetcher.stores {
                wallets.extend(store.wallets().await?);
            }
            wallets.sort();
            wallets.dedup();
            wallets
        };
        for wallet in wallets {
            fetcher.refresh_wallet(&wallet).await?;
        }
        Ok(fetcher)
    }

    /// Look up an account by path
    pub fn by_path(&self, path: &AccountPath) -> Result<Arc<Account>> {
        self.index
            .read()
            .by_path
            .get(&path.to_string())
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("account {path}")))
    }

    /// Look up an account by compressed public key
    pub fn by_public_key(&self, public_key: &[u8]) -> Result<Arc<Account>> {
        self.index
            .read()
            .by_public_key
            .get(public_key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("public key 0x{}", hex::encode(public_key))))
    }

    /// Snapshot of every indexed account, for listing
    pub fn accounts(&self) -> Vec<Arc<Account>> {
        self.index.read().by_path.values().cloned().collect()
    }

    /// Re-read one wallet from the stores, picking up new accounts
    ///
    /// Called after account creation. Handles already in the index are kept
    /// so that their unlocked state survives.
    pub async fn refresh_wallet(&self, wallet: &str) -> Result<()> {
        let mut records = Vec::new();
        for store in &self.stores {
            for record in store.accounts(wallet).await? {
                records.push((store.name().to_string(), record));
            }
        }

        let mut index = self.index.write();
        for (store_name, record) in records {
            if index.by_path.contains_key(&record.path.to_string()) {
                continue;
            }
            index.insert(Arc::new(Account::from_record(&store_name, record)));
        }
        Ok(())
    }
}
