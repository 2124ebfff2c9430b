//! Slashing-protection rules
//!
//! One evaluation per signable thing. Attestations and proposals read and
//! update the persistent per-account record; the update is durable before
//! APPROVED is returned, and a failure to persist yields ERRORED rather than
//! a signature. The remaining operations carry no slashing state.
//!
//! Callers must hold the account's lock for the whole
//! evaluate-persist-sign sequence; the engine itself is oblivious to
//! locking.

mod store;

pub use store::{ProtectionExport, ProtectionRecord, RulesStore, SlashingRecord};

use crate::{Decision, Hash256, DOMAIN_TYPE_BEACON_ATTESTER, DOMAIN_TYPE_BEACON_PROPOSER};
use tracing::{error, warn};

/// Request-scoped metadata handed to every evaluation
#[derive(Debug, Clone)]
pub struct RuleMetadata {
    /// CN of the requesting client
    pub client: String,
    /// Remote IP of the requesting client
    pub client_ip: String,
    /// Account path the request addresses
    pub account: String,
}

pub struct RulesEngine {
    store: RulesStore,
    admin_ips: Vec<String>,
}

impl RulesEngine {
    pub fn new(store: RulesStore, admin_ips: Vec<String>) -> Self {
        Self { store, admin_ips }
    }

    pub fn store(&self) -> &RulesStore {
        &self.store
    }

    /// Generic sign requests must not smuggle protected data past the typed
    /// rules, so the beacon attester and proposer domains are refused here.
    pub fn on_sign(&self, metadata: &RuleMetadata, domain: &Hash256) -> Decision {
        let domain_type = &domain[..4];
        if domain_type == DOMAIN_TYPE_BEACON_ATTESTER || domain_type == DOMAIN_TYPE_BEACON_PROPOSER
        {
            warn!(
                client = %metadata.client,
                account = %metadata.account,
                "denied generic sign with a protected domain"
            );
            return Decision::Denied;
        }
        Decision::Approved
    }

    /// Attestation rule: target strictly increases, source never decreases
    pub fn on_sign_beacon_attestation(
        &self,
        metadata: &RuleMetadata,
        source_epoch: u64,
        target_epoch: u64,
    ) -> Decision {
        if source_epoch > target_epoch {
            warn!(
                client = %metadata.client,
                account = %metadata.account,
                source_epoch,
                target_epoch,
                "denied attestation with source after target"
            );
            return Decision::Denied;
        }

        let existing = self.store.record(&metadata.account).unwrap_or_default();
        if let Some(previous_target) = existing.latest_attestation_target_epoch {
            if previous_target >= target_epoch {
                warn!(
                    client = %metadata.client,
                    account = %metadata.account,
                    previous_target,
                    target_epoch,
                    "denied attestation that does not advance the target epoch"
                );
                return Decision::Denied;
            }
        }
        if let Some(previous_source) = existing.latest_attestation_source_epoch {
            if previous_source > source_epoch {
                warn!(
                    client = %metadata.client,
                    account = %metadata.account,
                    previous_source,
                    source_epoch,
                    "denied attestation that rewinds the source epoch"
                );
                return Decision::Denied;
            }
        }

        // The stored source never moves backwards, even when the approved
        // request carries an older (but still legal) source.
        let new_source = existing
            .latest_attestation_source_epoch
            .map_or(source_epoch, |previous| previous.max(source_epoch));
        match self.store.update(&metadata.account, |record| {
            record.latest_attestation_source_epoch = Some(new_source);
            record.latest_attestation_target_epoch = Some(target_epoch);
        }) {
            Ok(_) => Decision::Approved,
            Err(e) => {
                error!(
                    account = %metadata.account,
                    error = %e,
                    "failed to persist attestation state"
                );
                Decision::Errored
            }
        }
    }

    /// Proposal rule: the slot strictly increases
    pub fn on_sign_beacon_proposal(&self, metadata: &RuleMetadata, slot: u64) -> Decision {
        let existing = self.store.record(&metadata.account).unwrap_or_default();
        if let Some(previous_slot) = existing.highest_proposed_slot {
            if previous_slot >= slot {
                warn!(
                    client = %metadata.client,
                    account = %metadata.account,
                    previous_slot,
                    slot,
                    "denied proposal that does not advance the slot"
                );
                return Decision::Denied;
            }
        }

        match self.store.update(&metadata.account, |record| {
            record.highest_proposed_slot = Some(slot);
        }) {
            Ok(_) => Decision::Approved,
            Err(e) => {
                error!(
                    account = %metadata.account,
                    error = %e,
                    "failed to persist proposal state"
                );
                Decision::Errored
            }
        }
    }

    pub fn on_sign_aggregation_slot(&self, _metadata: &RuleMetadata, _slot: u64) -> Decision {
        Decision::Approved
    }

    pub fn on_sign_aggregate_and_proof(&self, _metadata: &RuleMetadata) -> Decision {
        Decision::Approved
    }

    pub fn on_sign_randao(&self, _metadata: &RuleMetadata, _epoch: u64) -> Decision {
        Decision::Approved
    }

    pub fn on_sign_selection_proof(&self, _metadata: &RuleMetadata, _slot: u64) -> Decision {
        Decision::Approved
    }

    pub fn on_access_account(&self, _metadata: &RuleMetadata) -> Decision {
        Decision::Approved
    }

    pub fn on_create_account(&self, _metadata: &RuleMetadata) -> Decision {
        Decision::Approved
    }

    /// Destructive: remove all slashing history for the account
    pub fn on_reset(&self, metadata: &RuleMetadata) -> Decision {
        if !self.is_admin(&metadata.client_ip) {
            warn!(
                client_ip = %metadata.client_ip,
                account = %metadata.account,
                "denied slashing-protection reset from non-admin address"
            );
            return Decision::Denied;
        }
        match self.store.reset(&metadata.account) {
            Ok(()) => Decision::Approved,
            Err(e) => {
                error!(account = %metadata.account, error = %e, "reset failed");
                Decision::Errored
            }
        }
    }

    /// Export every record; read-only and so not admin-gated
    pub fn export_protection(&self) -> ProtectionExport {
        self.store.export()
    }

    /// Import records; destructive and so admin-gated
    pub fn import_protection(
        &self,
        client_ip: &str,
        export: &ProtectionExport,
    ) -> crate::Result<usize> {
        if !self.is_admin(client_ip) {
            return Err(crate::Error::Denied(format!(
                "slashing-protection import refused for {client_ip}"
            )));
        }
        self.store.import(export)
    }

    fn is_admin(&self, client_ip: &str) -> bool {
        self.admin_ips.iter().any(|ip| ip == client_ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(dir: &std::path::Path) -> RulesEngine {
        RulesEngine::new(RulesStore::open(dir).unwrap(), vec!["10.0.0.1".to_string()])
    }

    fn metadata() -> RuleMetadata {
        RuleMetadata {
            client: "client1".to_string(),
            client_ip: "192.0.2.1".to_string(),
            account: "w1/acct1".to_string(),
        }
    }

    #[test]
    fn test_attestation_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let meta = metadata();

        // Fresh account: approved, record becomes (5, 10).
        assert_eq!(
            engine.on_sign_beacon_attestation(&meta, 5, 10),
            Decision::Approved
        );
        let record = engine.store().record("w1/acct1").unwrap();
        assert_eq!(record.latest_attestation_source_epoch, Some(5));
        assert_eq!(record.latest_attestation_target_epoch, Some(10));

        // Older-but-legal source: approved, stored source not decreased.
        assert_eq!(
            engine.on_sign_beacon_attestation(&meta, 4, 11),
            Decision::Approved
        );
        let record = engine.store().record("w1/acct1").unwrap();
        assert_eq!(record.latest_attestation_source_epoch, Some(5));
        assert_eq!(record.latest_attestation_target_epoch, Some(11));

        // Target not strictly greater: denied, record unchanged.
        assert_eq!(
            engine.on_sign_beacon_attestation(&meta, 6, 11),
            Decision::Denied
        );
        let unchanged = engine.store().record("w1/acct1").unwrap();
        assert_eq!(unchanged, record);
    }

    #[test]
    fn test_attestation_rejects_rewound_source() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let meta = metadata();

        assert_eq!(
            engine.on_sign_beacon_attestation(&meta, 8, 10),
            Decision::Approved
        );
        assert_eq!(
            engine.on_sign_beacon_attestation(&meta, 7, 12),
            Decision::Denied
        );
    }

    #[test]
    fn test_attestation_rejects_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        assert_eq!(
            engine.on_sign_beacon_attestation(&metadata(), 10, 5),
            Decision::Denied
        );
        assert!(engine.store().record("w1/acct1").is_none());
    }

    #[test]
    fn test_proposal_slot_strictly_increases() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let meta = metadata();

        assert_eq!(engine.on_sign_beacon_proposal(&meta, 100), Decision::Approved);
        assert_eq!(engine.on_sign_beacon_proposal(&meta, 100), Decision::Denied);
        assert_eq!(engine.on_sign_beacon_proposal(&meta, 99), Decision::Denied);
        assert_eq!(engine.on_sign_beacon_proposal(&meta, 101), Decision::Approved);
    }

    #[test]
    fn test_generic_sign_refuses_protected_domains() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let meta = metadata();

        let mut attester_domain = [0u8; 32];
        attester_domain[..4].copy_from_slice(&DOMAIN_TYPE_BEACON_ATTESTER);
        assert_eq!(engine.on_sign(&meta, &attester_domain), Decision::Denied);

        let proposer_domain = [0u8; 32];
        assert_eq!(engine.on_sign(&meta, &proposer_domain), Decision::Denied);

        let mut voluntary_exit = [0u8; 32];
        voluntary_exit[..4].copy_from_slice(&[4, 0, 0, 0]);
        assert_eq!(engine.on_sign(&meta, &voluntary_exit), Decision::Approved);
    }

    #[test]
    fn test_reset_requires_admin_ip() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let meta = metadata();

        assert_eq!(engine.on_sign_beacon_proposal(&meta, 1), Decision::Approved);
        assert_eq!(engine.on_reset(&meta), Decision::Denied);
        assert!(engine.store().record("w1/acct1").is_some());

        let admin = RuleMetadata {
            client_ip: "10.0.0.1".to_string(),
            ..meta
        };
        assert_eq!(engine.on_reset(&admin), Decision::Approved);
        assert!(engine.store().record("w1/acct1").is_none());
    }
}
