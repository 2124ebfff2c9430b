//! Node-level errors
//!
//! Pipeline errors travel as `warden_core::Error`; this enum covers the
//! transport shell around it: TLS material, listeners, and peer wiring.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NodeError>;

#[derive(Debug, Error)]
pub enum NodeError {
    /// Certificate or key material could not be loaded or used
    #[error("TLS error: {0}")]
    Tls(String),

    /// Listener or connection problem
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Listen or peer address could not be parsed or resolved
    #[error("address error: {0}")]
    Address(String),

    /// Error bubbled up from the core pipeline
    #[error(transparent)]
    Core(#[from] warden_core::Error),
}
