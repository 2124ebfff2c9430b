//! Core types for the remote signer
//!
//! Account paths, the closed operation set, rule decisions, and the typed
//! signing requests whose fields feed the slashing-protection rules.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// 32-byte root or domain value
pub type Hash256 = [u8; 32];

/// Compressed BLS public key bytes (48 bytes, G1)
pub const PUBLIC_KEY_LENGTH: usize = 48;

/// Compressed BLS signature bytes (96 bytes, G2)
pub const SIGNATURE_LENGTH: usize = 96;

/// Domain type prefix for beacon block proposals
pub const DOMAIN_TYPE_BEACON_PROPOSER: [u8; 4] = [0x00, 0x00, 0x00, 0x00];

/// Domain type prefix for beacon attestations
pub const DOMAIN_TYPE_BEACON_ATTESTER: [u8; 4] = [0x01, 0x00, 0x00, 0x00];

/// Hierarchical `wallet/account` identifier
///
/// The path is the unit of locking, permissions, and slashing state. Both
/// components are non-empty and free of `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountPath {
    wallet: String,
    account: String,
}

impl AccountPath {
    /// Build a path from its components, validating both
    pub fn new(wallet: impl Into<String>, account: impl Into<String>) -> Result<Self> {
        let wallet = wallet.into();
        let account = account.into();
        if !valid_component(&wallet) {
            return Err(Error::Invalid(format!("invalid wallet name: {wallet:?}")));
        }
        if !valid_component(&account) {
            return Err(Error::Invalid(format!("invalid account name: {account:?}")));
        }
        Ok(Self { wallet, account })
    }

    /// Wallet component
    pub fn wallet(&self) -> &str {
        &self.wallet
    }

    /// Account component
    pub fn account(&self) -> &str {
        &self.account
    }
}

// Path components double as directory and file names in the keystore.
fn valid_component(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

impl FromStr for AccountPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((wallet, account)) => Self::new(wallet, account),
            None => Err(Error::Invalid(format!(
                "account path {s:?} is not of the form wallet/account"
            ))),
        }
    }
}

impl TryFrom<String> for AccountPath {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<AccountPath> for String {
    fn from(path: AccountPath) -> String {
        path.to_string()
    }
}

impl fmt::Display for AccountPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.wallet, self.account)
    }
}

/// The closed set of operations a client can be granted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    Sign,
    SignBeaconAttestation,
    SignBeaconProposal,
    SignAggregationSlot,
    SignAggregateAndProof,
    SignRandao,
    SignSelectionProof,
    AccessAccount,
    CreateAccount,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Sign => "sign",
            Operation::SignBeaconAttestation => "sign-beacon-attestation",
            Operation::SignBeaconProposal => "sign-beacon-proposal",
            Operation::SignAggregationSlot => "sign-aggregation-slot",
            Operation::SignAggregateAndProof => "sign-aggregate-and-proof",
            Operation::SignRandao => "sign-randao",
            Operation::SignSelectionProof => "sign-selection-proof",
            Operation::AccessAccount => "access-account",
            Operation::CreateAccount => "create-account",
        };
        write!(f, "{s}")
    }
}

/// Outcome of a rule evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Denied,
    Errored,
}

impl Decision {
    pub fn is_approved(&self) -> bool {
        matches!(self, Decision::Approved)
    }
}

/// Identity of the caller, resolved from the client certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientContext {
    /// CN of the validated client certificate
    pub name: String,
    /// Remote IP, used by admin-only rules
    pub ip: String,
}

impl ClientContext {
    pub fn new(name: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
        }
    }
}

/// How a request addresses an account
#[derive(Debug, Clone)]
pub enum AccountSpecifier {
    Path(AccountPath),
    PublicKey(Vec<u8>),
}

impl fmt::Display for AccountSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountSpecifier::Path(path) => write!(f, "{path}"),
            AccountSpecifier::PublicKey(pk) => write!(f, "0x{}", hex::encode(pk)),
        }
    }
}

/// Source or target vote of an attestation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: u64,
    pub root: Hash256,
}

/// Fields of a beacon attestation signing request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationData {
    pub slot: u64,
    pub committee_index: u64,
    pub beacon_block_root: Hash256,
    pub source: Checkpoint,
    pub target: Checkpoint,
}

impl AttestationData {
    /// Digest over the canonical encoding of the attestation plus domain
    pub fn signing_root(&self, domain: &Hash256) -> Hash256 {
        let mut hasher = Sha256::new();
        hasher.update(self.slot.to_le_bytes());
        hasher.update(self.committee_index.to_le_bytes());
        hasher.update(self.beacon_block_root);
        hasher.update(self.source.epoch.to_le_bytes());
        hasher.update(self.source.root);
        hasher.update(self.target.epoch.to_le_bytes());
        hasher.update(self.target.root);
        hasher.update(domain);
        hasher.finalize().into()
    }
}

/// Fields of a beacon block proposal signing request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalData {
    pub slot: u64,
    pub proposer_index: u64,
    pub parent_root: Hash256,
    pub state_root: Hash256,
    pub body_root: Hash256,
}

impl ProposalData {
    /// Digest over the canonical encoding of the proposal plus domain
    pub fn signing_root(&self, domain: &Hash256) -> Hash256 {
        let mut hasher = Sha256::new();
        hasher.update(self.slot.to_le_bytes());
        hasher.update(self.proposer_index.to_le_bytes());
        hasher.update(self.parent_root);
        hasher.update(self.state_root);
        hasher.update(self.body_root);
        hasher.update(domain);
        hasher.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_path_parsing() {
        let path: AccountPath = "validators/0".parse().unwrap();
        assert_eq!(path.wallet(), "validators");
        assert_eq!(path.account(), "0");
        assert_eq!(path.to_string(), "validators/0");

        assert!("validators".parse::<AccountPath>().is_err());
        assert!("/acct".parse::<AccountPath>().is_err());
        assert!("wallet/".parse::<AccountPath>().is_err());
        assert!("a/b/c".parse::<AccountPath>().is_err());
    }

    #[test]
    fn test_account_path_serde_round_trip() {
        let path: AccountPath = "w1/acct1".parse().unwrap();
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, "\"w1/acct1\"");
        let back: AccountPath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, path);
    }

    #[test]
    fn test_operation_names() {
        assert_eq!(
            Operation::SignBeaconAttestation.to_string(),
            "sign-beacon-attestation"
        );
        let op: Operation = serde_json::from_str("\"sign-beacon-proposal\"").unwrap();
        assert_eq!(op, Operation::SignBeaconProposal);
    }

    #[test]
    fn test_signing_roots_are_domain_separated() {
        let data = AttestationData {
            slot: 1,
            committee_index: 0,
            beacon_block_root: [1u8; 32],
            source: Checkpoint {
                epoch: 5,
                root: [2u8; 32],
            },
            target: Checkpoint {
                epoch: 6,
                root: [3u8; 32],
            },
        };
        let root_a = data.signing_root(&[0u8; 32]);
        let root_b = data.signing_root(&[9u8; 32]);
        assert_ne!(root_a, root_b);
    }
}
