//! Signer service
//!
//! Drives the pipeline for a single signing operation: permission check,
//! account resolution, unlocking, rule evaluation, then signature
//! production. A signature is only ever produced after the rule decision is
//! APPROVED and its state change has been committed.
//!
//! Distributed accounts are signed through the [`DistributedSigner`]
//! capability; the process service implements it without this module
//! depending on it.

use crate::accounts::Account;
use crate::checker::Checker;
use crate::fetcher::Fetcher;
use crate::observer::Observer;
use crate::ruler::{RuleAction, Ruler};
use crate::unlocker::Unlocker;
use crate::{
    AccountSpecifier, AttestationData, ClientContext, Decision, Error, Hash256, Operation,
    ProposalData, Result,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Capability for signing with a distributed account's threshold key
#[async_trait]
pub trait DistributedSigner: Send + Sync {
    /// Produce a combined threshold signature over the signing root
    ///
    /// The caller has already evaluated its own rules; implementations fan
    /// the action out so every other participant evaluates theirs.
    async fn threshold_sign(
        &self,
        account: &Arc<Account>,
        signing_root: &Hash256,
        action: &RuleAction,
    ) -> Result<Vec<u8>>;
}

pub struct SignerService {
    checker: Arc<Checker>,
    fetcher: Arc<Fetcher>,
    unlocker: Arc<Unlocker>,
    ruler: Arc<Ruler>,
    observer: Arc<dyn Observer>,
    distributed: RwLock<Option<Arc<dyn DistributedSigner>>>,
}

impl SignerService {
    pub fn new(
        checker: Arc<Checker>,
        fetcher: Arc<Fetcher>,
        unlocker: Arc<Unlocker>,
        ruler: Arc<Ruler>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            checker,
            fetcher,
            unlocker,
            ruler,
            observer,
            distributed: RwLock::new(None),
        }
    }

    /// Install the distributed-signing backend once the process service
    /// exists
    pub fn set_distributed_signer(&self, signer: Arc<dyn DistributedSigner>) {
        *self.distributed.write() = Some(signer);
    }

    /// Generic sign over a caller-supplied signing root
    pub async fn sign(
        &self,
        client: &ClientContext,
        account: &AccountSpecifier,
        domain: Hash256,
        signing_root: Hash256,
    ) -> Result<Vec<u8>> {
        self.sign_with_action(client, account, RuleAction::Sign { domain }, signing_root)
            .await
    }

    /// Sign a beacon attestation
    pub async fn sign_beacon_attestation(
        &self,
        client: &ClientContext,
        account: &AccountSpecifier,
        domain: Hash256,
        data: &AttestationData,
    ) -> Result<Vec<u8>> {
        let action = RuleAction::SignBeaconAttestation {
            source_epoch: data.source.epoch,
            target_epoch: data.target.epoch,
        };
        self.sign_with_action(client, account, action, data.signing_root(&domain))
            .await
    }

    /// Sign a beacon block proposal
    pub async fn sign_beacon_proposal(
        &self,
        client: &ClientContext,
        account: &AccountSpecifier,
        domain: Hash256,
        data: &ProposalData,
    ) -> Result<Vec<u8>> {
        let action = RuleAction::SignBeaconProposal { slot: data.slot };
        self.sign_with_action(client, account, action, data.signing_root(&domain))
            .await
    }

    /// Run the pipeline for an already-typed action
    pub async fn sign_with_action(
        &self,
        client: &ClientContext,
        account: &AccountSpecifier,
        action: RuleAction,
        signing_root: Hash256,
    ) -> Result<Vec<u8>> {
        let operation = action.operation();
        let started = Instant::now();
        self.observer.on_request("signer", operation);

        let result = self
            .run_pipeline(client, account, &action, &signing_root, true)
            .await;

        self.observer
            .on_complete("signer", operation, result.is_ok(), started.elapsed());
        result
    }

    /// Produce a local (partial, for distributed accounts) signature after
    /// running the full pipeline
    ///
    /// Used by the process service when this server participates in another
    /// coordinator's threshold signing; it never fans out again.
    pub async fn contribute(
        &self,
        client: &ClientContext,
        account: &AccountSpecifier,
        action: RuleAction,
        signing_root: Hash256,
    ) -> Result<Vec<u8>> {
        self.run_pipeline(client, account, &action, &signing_root, false)
            .await
    }

    async fn run_pipeline(
        &self,
        client: &ClientContext,
        specifier: &AccountSpecifier,
        action: &RuleAction,
        signing_root: &Hash256,
        dispatch_distributed: bool,
    ) -> Result<Vec<u8>> {
        let operation = action.operation();

        // Path-addressed requests are permission-checked before resolution so
        // a denied client cannot probe for account existence. Pubkey-addressed
        // requests have to resolve first.
        let account = match specifier {
            AccountSpecifier::Path(path) => {
                self.check_permission(client, &path.to_string(), operation)?;
                self.fetcher.by_path(path)?
            }
            AccountSpecifier::PublicKey(public_key) => {
                let account = self.fetcher.by_public_key(public_key)?;
                self.check_permission(client, &account.path().to_string(), operation)?;
                account
            }
        };

        if !self.unlocker.unlock_account(&account)? {
            return Err(Error::Locked(account.path().to_string()));
        }

        let decision = self
            .ruler
            .run_rules(client, account.path(), action)
            .await;
        self.observer.on_decision(operation, decision);
        match decision {
            Decision::Approved => {}
            Decision::Denied => {
                return Err(Error::Denied(format!(
                    "rules refused {operation} for {}",
                    account.path()
                )))
            }
            Decision::Errored => {
                return Err(Error::Internal(format!(
                    "rule evaluation errored for {}",
                    account.path()
                )))
            }
        }

        if dispatch_distributed && account.is_distributed() {
            let backend = self
                .distributed
                .read()
                .clone()
                .ok_or_else(|| Error::Internal("no distributed signer configured".into()))?;
            debug!(account = %account.path(), "delegating to threshold signing");
            return backend.threshold_sign(&account, signing_root, action).await;
        }

        let signature = account.sign(signing_root)?;
        info!(
            client = %client.name,
            account = %account.path(),
            operation = %operation,
            "signed"
        );
        Ok(signature.to_bytes().to_vec())
    }

    fn check_permission(
        &self,
        client: &ClientContext,
        path: &str,
        operation: Operation,
    ) -> Result<()> {
        if !self.checker.check(&client.name, path, operation) {
            return Err(Error::Denied(format!(
                "client {} does not hold {operation} on {path}",
                client.name
            )));
        }
        Ok(())
    }
}
