//! # Warden core
//!
//! Core library for the warden distributed remote signer: the signing
//! pipeline and everything it leans on.
//!
//! ## Architecture
//!
//! A sign request travels checker → fetcher → unlocker → ruler → signer:
//!
//! - **Checker**: static permission oracle over the client certificate CN
//! - **Fetcher**: in-memory index from account path / public key to handle
//! - **Unlocker**: decrypts key material with the configured passphrases
//! - **Locker + Ruler + Rules**: per-account serialization of the
//!   slashing-protection read-decide-persist triple
//! - **Signer**: orchestrates the pipeline and produces the BLS signature
//!
//! Distributed accounts hold a Shamir share of a threshold key; the signer
//! hands those to a [`signer::DistributedSigner`] backend (implemented by the
//! node's process service) instead of signing locally.
//!
//! ## Safety model
//!
//! A signature is produced only after the rule decision is APPROVED and the
//! updated slashing record is durable on disk. When persistence fails the
//! request errors and nothing is signed; slashing safety beats liveness.

pub mod accounts;
pub mod bls;
pub mod checker;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod lister;
pub mod locker;
pub mod manager;
pub mod observer;
pub mod rules;
pub mod ruler;
pub mod signer;
pub mod store;
pub mod types;
pub mod unlocker;

pub use error::{Error, Result};
pub use types::{
    AccountPath, AccountSpecifier, AttestationData, Checkpoint, ClientContext, Decision, Hash256,
    Operation, ProposalData, DOMAIN_TYPE_BEACON_ATTESTER, DOMAIN_TYPE_BEACON_PROPOSER,
    PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
