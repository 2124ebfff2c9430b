//! Error types shared across the signer pipeline

use thiserror::Error;

/// Result type alias for signer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the signing pipeline and its supporting services
#[derive(Debug, Error)]
pub enum Error {
    // ============ Client-visible outcomes ============
    /// Permission or slashing rule refused the operation; non-retryable
    #[error("denied: {0}")]
    Denied(String),

    /// Account or public key unknown
    #[error("not found: {0}")]
    NotFound(String),

    /// Account present but its passphrase has not been presented
    #[error("account locked: {0}")]
    Locked(String),

    /// Insufficient peers participated or a peer deadline elapsed
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Malformed request
    #[error("invalid request: {0}")]
    Invalid(String),

    // ============ Internal causes ============
    /// Cryptographic operation failed
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Keystore or rules-store persistence failed
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Bug or unclassified failure
    #[error("internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when the error must never be retried by the caller.
    ///
    /// Rule refusals and malformed requests are final; only peer transport
    /// failures are candidates for retry, and only inside the sender.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Error::Unavailable(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(e: hex::FromHexError) -> Self {
        Error::Invalid(format!("invalid hex: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Denied("slot 100 already proposed".to_string());
        assert!(err.to_string().contains("denied"));
        assert!(err.to_string().contains("slot 100"));
    }

    #[test]
    fn test_terminal_classification() {
        assert!(Error::Denied("x".into()).is_terminal());
        assert!(Error::Invalid("x".into()).is_terminal());
        assert!(!Error::Unavailable("x".into()).is_terminal());
    }
}
