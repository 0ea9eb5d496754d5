//! Error types for the crypto envelope.

use thiserror::Error;

/// Result alias for crypto operations.
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors raised by key derivation and the packet envelope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Authenticity check failed: a GCM tag mismatch, bad block padding,
    /// or a wrong challenge response. Always fatal to the connection.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// A negotiated parameter is outside the supported envelope: unknown
    /// mode or digest, bad key/IV/salt size, zero iteration count.
    #[error("invalid cipher parameter: {0}")]
    InvalidParameter(String),

    /// Ciphertext is structurally impossible for the negotiated mode
    /// (shorter than its IV prefix or authentication tag).
    #[error("ciphertext too short: {size} bytes, need at least {min}")]
    TruncatedCiphertext {
        /// Received ciphertext size
        size: usize,
        /// Minimum size for the negotiated mode
        min: usize,
    },
}
