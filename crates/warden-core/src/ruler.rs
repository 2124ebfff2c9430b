//! Ruler
//!
//! Facade over the rules engine. Acquires the per-account lock, builds the
//! rule metadata, and dispatches the typed action, so that the read-decide-
//! persist triple is a critical section per account path while distinct
//! accounts evaluate in parallel.

use crate::locker::Locker;
use crate::rules::{RuleMetadata, RulesEngine};
use crate::{AccountPath, ClientContext, Decision, Hash256, Operation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A rule evaluation request, one variant per signable thing
///
/// Serializable because peers re-run the same evaluation on their own
/// slashing stores during distributed signing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RuleAction {
    Sign {
        domain: Hash256,
    },
    SignBeaconAttestation {
        source_epoch: u64,
        target_epoch: u64,
    },
    SignBeaconProposal {
        slot: u64,
    },
    SignAggregationSlot {
        slot: u64,
    },
    SignAggregateAndProof,
    SignRandao {
        epoch: u64,
    },
    SignSelectionProof {
        slot: u64,
    },
    AccessAccount,
    CreateAccount,
}

impl RuleAction {
    /// The permission this action requires
    pub fn operation(&self) -> Operation {
        match self {
            RuleAction::Sign { .. } => Operation::Sign,
            RuleAction::SignBeaconAttestation { .. } => Operation::SignBeaconAttestation,
            RuleAction::SignBeaconProposal { .. } => Operation::SignBeaconProposal,
            RuleAction::SignAggregationSlot { .. } => Operation::SignAggregationSlot,
            RuleAction::SignAggregateAndProof => Operation::SignAggregateAndProof,
            RuleAction::SignRandao { .. } => Operation::SignRandao,
            RuleAction::SignSelectionProof { .. } => Operation::SignSelectionProof,
            RuleAction::AccessAccount => Operation::AccessAccount,
            RuleAction::CreateAccount => Operation::CreateAccount,
        }
    }
}

pub struct Ruler {
    locker: Arc<Locker>,
    rules: Arc<RulesEngine>,
}

impl Ruler {
    pub fn new(locker: Arc<Locker>, rules: Arc<RulesEngine>) -> Self {
        Self { locker, rules }
    }

    pub fn rules(&self) -> &RulesEngine {
        &self.rules
    }

    /// Evaluate an action for an account, serialized per account path
    pub async fn run_rules(
        &self,
        client: &ClientContext,
        account: &AccountPath,
        action: &RuleAction,
    ) -> Decision {
        let key = account.to_string();
        let _guard = self.locker.lock(&key).await;

        let metadata = RuleMetadata {
            client: client.name.clone(),
            client_ip: client.ip.clone(),
            account: key,
        };

        match action {
            RuleAction::Sign { domain } => self.rules.on_sign(&metadata, domain),
            RuleAction::SignBeaconAttestation {
                source_epoch,
                target_epoch,
            } => self
                .rules
                .on_sign_beacon_attestation(&metadata, *source_epoch, *target_epoch),
            RuleAction::SignBeaconProposal { slot } => {
                self.rules.on_sign_beacon_proposal(&metadata, *slot)
            }
            RuleAction::SignAggregationSlot { slot } => {
                self.rules.on_sign_aggregation_slot(&metadata, *slot)
            }
            RuleAction::SignAggregateAndProof => {
                self.rules.on_sign_aggregate_and_proof(&metadata)
            }
            RuleAction::SignRandao { epoch } => self.rules.on_sign_randao(&metadata, *epoch),
            RuleAction::SignSelectionProof { slot } => {
                self.rules.on_sign_selection_proof(&metadata, *slot)
            }
            RuleAction::AccessAccount => self.rules.on_access_account(&metadata),
            RuleAction::CreateAccount => self.rules.on_create_account(&metadata),
        }
    }
}
