//! Wire types for the client API and the peer protocol
//!
//! Binary values (keys, roots, signatures, shares) travel as hex strings.
//! Every response carries a `state`; errors are described in `error` without
//! exposing server internals.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use warden_core::ruler::RuleAction;
use warden_core::{Error, Hash256};

/// Request outcome as seen by clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    Succeeded,
    Denied,
    Failed,
    Unknown,
    NotFound,
    NotPermitted,
}

impl RequestState {
    /// Map a pipeline error to the client-visible state
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::Denied(_) | Error::Locked(_) => RequestState::Denied,
            Error::NotFound(_) => RequestState::NotFound,
            Error::Unavailable(_)
            | Error::Invalid(_)
            | Error::Crypto(_)
            | Error::Storage(_)
            | Error::Serialization(_)
            | Error::Internal(_)
            | Error::Io(_) => RequestState::Failed,
        }
    }
}

/// Decode a hex-encoded 32-byte value
pub fn decode_hash256(value: &str) -> Result<Hash256, Error> {
    let bytes = hex::decode(value.trim_start_matches("0x"))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::Invalid(format!("expected 32 bytes, got {}", bytes.len())))
}

/// Decode arbitrary hex bytes
pub fn decode_bytes(value: &str) -> Result<Vec<u8>, Error> {
    Ok(hex::decode(value.trim_start_matches("0x"))?)
}

// ============================================================================
// Client API
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignRequest {
    /// `wallet/account`; exactly one of account and public_key is required
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    /// 32-byte domain, hex
    pub domain: String,
    /// 32-byte signing root, hex
    pub signing_root: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignResponse {
    pub state: RequestState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SignResponse {
    pub fn succeeded(signature: &[u8]) -> Self {
        Self {
            state: RequestState::Succeeded,
            signature: Some(hex::encode(signature)),
            error: None,
        }
    }

    pub fn failed(error: &Error) -> Self {
        Self {
            state: RequestState::from_error(error),
            signature: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMessage {
    pub epoch: u64,
    /// 32-byte root, hex
    pub root: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignBeaconAttestationRequest {
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    pub domain: String,
    pub slot: u64,
    pub committee_index: u64,
    pub beacon_block_root: String,
    pub source: CheckpointMessage,
    pub target: CheckpointMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignBeaconProposalRequest {
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    pub domain: String,
    pub slot: u64,
    pub proposer_index: u64,
    pub parent_root: String,
    pub state_root: String,
    pub body_root: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListAccountsRequest {
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountMessage {
    pub path: String,
    pub public_key: String,
    pub distributed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListAccountsResponse {
    pub state: RequestState,
    pub accounts: Vec<AccountMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// `wallet/account` to create
    pub account: String,
    pub passphrase: String,
    /// Present together with `participants` for a distributed account
    #[serde(default)]
    pub signing_threshold: Option<u32>,
    /// Peer ids that will hold shares
    #[serde(default)]
    pub participants: Option<Vec<u64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub state: RequestState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlockRequest {
    pub account: String,
    #[serde(default)]
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRequest {
    pub account: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateWalletRequest {
    pub wallet: String,
    #[serde(default, rename = "type")]
    pub wallet_type: Option<String>,
}

/// Response carrying only an outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateResponse {
    pub state: RequestState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StateResponse {
    pub fn succeeded() -> Self {
        Self {
            state: RequestState::Succeeded,
            error: None,
        }
    }

    pub fn failed(error: &Error) -> Self {
        Self {
            state: RequestState::from_error(error),
            error: Some(error.to_string()),
        }
    }

    pub fn not_permitted(reason: impl Into<String>) -> Self {
        Self {
            state: RequestState::NotPermitted,
            error: Some(reason.into()),
        }
    }
}

// ============================================================================
// Peer protocol
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantMessage {
    /// Expected certificate CN
    pub name: String,
    /// host:port endpoint
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareRequest {
    /// 32-byte session id, hex
    pub session_id: String,
    /// Account path the generation will create
    pub account: String,
    pub threshold: u32,
    /// Participant id → identity; identical for every participant
    pub participants: BTreeMap<u64, ParticipantMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRequest {
    pub session_id: String,
    pub sender_id: u64,
    /// Sender's Feldman commitments (compressed G1, hex), threshold entries
    pub verification_vector: Vec<String>,
    /// Sender's polynomial evaluated at the recipient's id (32 bytes, hex).
    /// Private to this recipient; the link is mTLS.
    pub share: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyAndSignRequest {
    pub session_id: String,
    /// First wave verifies and signs the confirmation; the second persists
    pub commit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyAndSignResponse {
    pub state: RequestState,
    pub participant_id: u64,
    /// Group public key this participant assembled (compressed G1, hex)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_public_key: Option<String>,
    /// Partial signature over the session confirmation root
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortRequest {
    pub session_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributeRequest {
    pub account: String,
    /// 32-byte signing root, hex
    pub signing_root: String,
    /// The rule evaluation the receiving peer must re-run before signing
    pub action: RuleAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributeResponse {
    pub state: RequestState,
    pub participant_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
