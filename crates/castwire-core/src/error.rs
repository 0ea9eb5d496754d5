//! Connection error taxonomy.
//!
//! Every error category here is fatal to the connection that raised it:
//! the connection enters `Closing`, emits a best-effort `disconnect` with a
//! reason string, records the error as the observable last error, and
//! transitions to `Closed`. Nothing is retried locally.
//!
//! Wire-format and crypto failures from the lower layers are wrapped rather
//! than stringified, so tests and callers can still match on the precise
//! cause. `std::io::Error` only appears at the transport boundary.

use std::time::Duration;

use castwire_crypto::CryptoError;
use castwire_proto::ProtocolError;
use thiserror::Error;

use crate::session::SessionState;

/// Result alias for connection operations.
pub type Result<T> = std::result::Result<T, ConnectionError>;

/// Errors that terminate a connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Wire-format violation: malformed header or payload, oversized
    /// packet, compression or framing inconsistency, truncated stream.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Envelope failure: GCM tag mismatch, bad padding, unusable
    /// parameters.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Handshake authentication failed: wrong challenge response, retries
    /// exhausted, or a missing shared secret.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A packet arrived that is not legal in the current handshake state.
    #[error("unexpected '{packet_type}' packet in state {state:?}")]
    UnexpectedPacket {
        /// State when the packet arrived
        state: SessionState,
        /// Type of the offending packet
        packet_type: String,
    },

    /// The outbound queue hit its high-water mark.
    #[error("peer too slow: {queued} packets queued, high water is {high_water}")]
    PeerTooSlow {
        /// Queue length at failure
        queued: usize,
        /// Configured high-water mark
        high_water: usize,
    },

    /// A handshake or chunk-reassembly timer expired.
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        /// What was being waited for
        operation: &'static str,
        /// How long we waited
        elapsed: Duration,
    },

    /// A registered handler failed; surfaced as a local error per policy.
    #[error("handler for '{packet_type}' failed: {reason}")]
    Local {
        /// Packet type whose handler failed
        packet_type: String,
        /// Handler-reported reason
        reason: String,
    },

    /// Operation attempted on a connection that is closing or closed.
    #[error("connection closed: {0}")]
    Closed(String),

    /// Underlying byte-stream failure.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ConnectionError {
    /// This error is an authentication failure (HMAC response, retry
    /// exhaustion, or an envelope authenticity check).
    #[must_use]
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Crypto(CryptoError::AuthFailed(_)))
    }

    /// Short reason string suitable for an outgoing `disconnect` packet.
    #[must_use]
    pub fn disconnect_reason(&self) -> String {
        match self {
            Self::Protocol(e) => format!("protocol error: {e}"),
            Self::Crypto(_) | Self::Auth(_) => "authentication failed".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                Self::Protocol(ProtocolError::UnexpectedEof { expected: 0, actual: 0 })
            },
            _ => Self::Transport(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_classification() {
        assert!(ConnectionError::Auth("bad response".into()).is_auth_failure());
        assert!(
            ConnectionError::Crypto(CryptoError::AuthFailed("tag".into())).is_auth_failure()
        );
        assert!(
            !ConnectionError::PeerTooSlow { queued: 10, high_water: 5 }.is_auth_failure()
        );
    }

    #[test]
    fn disconnect_reason_never_leaks_crypto_detail() {
        let reason = ConnectionError::Crypto(CryptoError::AuthFailed("GCM tag mismatch".into()))
            .disconnect_reason();
        assert_eq!(reason, "authentication failed");
    }

    #[test]
    fn eof_maps_to_protocol_error() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(
            ConnectionError::from(io),
            ConnectionError::Protocol(ProtocolError::UnexpectedEof { .. })
        ));
    }
}
