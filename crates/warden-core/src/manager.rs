//! Account and wallet lifecycle
//!
//! Local account generation, unlocking, locking, and wallet creation.
//! Distributed generation is a peer-protocol concern and is dispatched to
//! the process service by the API layer; everything here is single-server.

use crate::checker::Checker;
use crate::fetcher::Fetcher;
use crate::ruler::{RuleAction, Ruler};
use crate::store::{Store, StoredAccount};
use crate::unlocker::Unlocker;
use crate::{bls, AccountPath, ClientContext, Decision, Error, Operation, Result};
use std::sync::Arc;
use tracing::info;

pub struct AccountManager {
    store: Arc<dyn Store>,
    checker: Arc<Checker>,
    fetcher: Arc<Fetcher>,
    unlocker: Arc<Unlocker>,
    ruler: Arc<Ruler>,
}

impl AccountManager {
    pub fn new(
        store: Arc<dyn Store>,
        checker: Arc<Checker>,
        fetcher: Arc<Fetcher>,
        unlocker: Arc<Unlocker>,
        ruler: Arc<Ruler>,
    ) -> Self {
        Self {
            store,
            checker,
            fetcher,
            unlocker,
            ruler,
        }
    }

    /// Generate a local (non-distributed) account
    ///
    /// Returns the new account's compressed public key.
    pub async fn generate(
        &self,
        client: &ClientContext,
        path: &AccountPath,
        passphrase: &str,
    ) -> Result<Vec<u8>> {
        self.require(client, &path.to_string(), Operation::CreateAccount)?;

        let decision = self
            .ruler
            .run_rules(client, path, &RuleAction::CreateAccount)
            .await;
        if decision != Decision::Approved {
            return Err(Error::Denied(format!("account creation refused for {path}")));
        }

        if !self.store.has_wallet(path.wallet()).await? {
            return Err(Error::NotFound(format!("wallet {}", path.wallet())));
        }
        if self.store.has_account(path).await? {
            return Err(Error::Invalid(format!("account {path} already exists")));
        }

        let key = bls::SecretKey::random();
        let public_key = key.public_key().to_bytes().to_vec();
        let record = StoredAccount::seal(
            path.clone(),
            public_key.clone(),
            &key.to_bytes(),
            passphrase,
            None,
        )?;
        self.store.save_account(&record).await?;
        self.fetcher.refresh_wallet(path.wallet()).await?;

        info!(client = %client.name, account = %path, "generated account");
        Ok(public_key)
    }

    /// Unlock an account with an explicit passphrase, falling back to the
    /// configured candidates when none is supplied
    pub async fn unlock(
        &self,
        client: &ClientContext,
        path: &AccountPath,
        passphrase: Option<&str>,
    ) -> Result<()> {
        self.require(client, &path.to_string(), Operation::AccessAccount)?;
        let account = self.fetcher.by_path(path)?;

        let unlocked = match passphrase {
            Some(passphrase) => account.try_unlock(passphrase)?,
            None => self.unlocker.unlock_account(&account)?,
        };
        if !unlocked {
            return Err(Error::Locked(path.to_string()));
        }
        Ok(())
    }

    /// Drop an account's decrypted key
    pub async fn lock(&self, client: &ClientContext, path: &AccountPath) -> Result<()> {
        self.require(client, &path.to_string(), Operation::AccessAccount)?;
        let account = self.fetcher.by_path(path)?;
        account.lock();
        Ok(())
    }

    fn require(&self, client: &ClientContext, path: &str, operation: Operation) -> Result<()> {
        if !self.checker.check(&client.name, path, operation) {
            return Err(Error::Denied(format!(
                "client {} does not hold {operation} on {path}",
                client.name
            )));
        }
        Ok(())
    }
}

pub struct WalletManager {
    store: Arc<dyn Store>,
    checker: Arc<Checker>,
}

impl WalletManager {
    pub fn new(store: Arc<dyn Store>, checker: Arc<Checker>) -> Self {
        Self { store, checker }
    }

    /// Create an empty wallet
    ///
    /// Only non-deterministic wallets exist here; hierarchical wallets are a
    /// store-format concern this server does not own.
    pub async fn generate_wallet(
        &self,
        client: &ClientContext,
        name: &str,
        wallet_type: &str,
    ) -> Result<()> {
        if name.is_empty() || name.contains('/') {
            return Err(Error::Invalid(format!("invalid wallet name: {name:?}")));
        }
        if !wallet_type.is_empty() && wallet_type != "non-deterministic" {
            return Err(Error::Invalid(format!(
                "unsupported wallet type {wallet_type:?}"
            )));
        }

        // Creating a wallet needs create-account over the whole wallet.
        let probe = format!("{name}/*");
        if !self
            .checker
            .check(&client.name, &probe, Operation::CreateAccount)
        {
            return Err(Error::Denied(format!(
                "client {} may not create wallet {name}",
                client.name
            )));
        }

        self.store.create_wallet(name).await?;
        info!(client = %client.name, wallet = %name, "created wallet");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::Permission;
    use crate::locker::Locker;
    use crate::rules::{RulesEngine, RulesStore};
    use crate::store::MemoryStore;
    use std::collections::HashMap;

    struct Fixture {
        manager: AccountManager,
        wallets: WalletManager,
        fetcher: Arc<Fetcher>,
    }

    async fn fixture(dir: &std::path::Path) -> Fixture {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store.create_wallet("w1").await.unwrap();

        let mut access = HashMap::new();
        access.insert(
            "client1".to_string(),
            vec![Permission {
                path: "w1/*".to_string(),
                operations: vec![Operation::CreateAccount, Operation::AccessAccount],
            }],
        );
        let checker = Arc::new(Checker::new(access).unwrap());
        let fetcher = Arc::new(Fetcher::new(vec![Arc::clone(&store)]).await.unwrap());
        let unlocker = Arc::new(Unlocker::new(vec![], vec![]));
        let ruler = Arc::new(Ruler::new(
            Arc::new(Locker::new()),
            Arc::new(RulesEngine::new(RulesStore::open(dir).unwrap(), vec![])),
        ));

        Fixture {
            manager: AccountManager::new(
                Arc::clone(&store),
                Arc::clone(&checker),
                Arc::clone(&fetcher),
                unlocker,
                ruler,
            ),
            wallets: WalletManager::new(store, checker),
            fetcher,
        }
    }

    #[tokio::test]
    async fn test_generate_unlock_lock() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = fixture(dir.path()).await;
        let client = ClientContext::new("client1", "192.0.2.1");
        let path: AccountPath = "w1/acct1".parse().unwrap();

        let public_key = fixture
            .manager
            .generate(&client, &path, "passphrase")
            .await
            .unwrap();
        assert_eq!(public_key.len(), crate::PUBLIC_KEY_LENGTH);

        // The fetcher sees the new account without a restart.
        let account = fixture.fetcher.by_path(&path).unwrap();
        assert!(!account.is_unlocked());

        fixture
            .manager
            .unlock(&client, &path, Some("passphrase"))
            .await
            .unwrap();
        assert!(account.is_unlocked());

        fixture.manager.lock(&client, &path).await.unwrap();
        assert!(!account.is_unlocked());

        // Wrong passphrase reports locked.
        let result = fixture.manager.unlock(&client, &path, Some("nope")).await;
        assert!(matches!(result, Err(Error::Locked(_))));
    }

    #[tokio::test]
    async fn test_generate_requires_permission() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = fixture(dir.path()).await;
        let stranger = ClientContext::new("stranger", "192.0.2.1");
        let result = fixture
            .manager
            .generate(&stranger, &"w1/acct1".parse().unwrap(), "passphrase")
            .await;
        assert!(matches!(result, Err(Error::Denied(_))));
    }

    #[tokio::test]
    async fn test_wallet_creation() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = fixture(dir.path()).await;
        let client = ClientContext::new("client1", "192.0.2.1");

        // client1 holds create-account on w1/* only.
        assert!(fixture
            .wallets
            .generate_wallet(&client, "w2", "")
            .await
            .is_err());
        // w1 already exists in the fixture store.
        assert!(fixture
            .wallets
            .generate_wallet(&client, "w1", "")
            .await
            .is_err());
        assert!(fixture
            .wallets
            .generate_wallet(&client, "w1", "hierarchical")
            .await
            .is_err());
    }
}
