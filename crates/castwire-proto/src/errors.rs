//! Error types for the wire format layer.
//!
//! Every error here is a structural protocol violation: a malformed header,
//! a payload that does not decode, a compression mismatch, or a framing
//! inconsistency. All of them are fatal to the connection that produced
//! them; none are retried.

use thiserror::Error;

/// Result alias for wire-format operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while parsing or emitting the wire format.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Header failed structural validation (bad magic, reserved flag bits,
    /// impossible field combination).
    #[error("malformed header: {reason}")]
    MalformedHeader {
        /// What the validation rejected
        reason: String,
    },

    /// Header declared a payload larger than the configured limit.
    ///
    /// Raised before any payload allocation happens.
    #[error("oversized packet: {size} bytes exceeds limit of {limit}")]
    OversizedPacket {
        /// Payload size declared by the header
        size: usize,
        /// Configured payload-size limit
        limit: usize,
    },

    /// Payload bytes did not decode as a valid value tree.
    #[error("malformed payload at byte {offset}: {reason}")]
    MalformedPayload {
        /// Byte offset within the payload where decoding failed
        offset: usize,
        /// What the decoder rejected
        reason: String,
    },

    /// Decompressor rejected the body, or the codec was not negotiated.
    #[error("compression error: {0}")]
    Compression(String),

    /// Chunk bookkeeping violation: duplicate index, out-of-range
    /// substitution target, or chunk state inconsistency.
    #[error("framing error: {0}")]
    Framing(String),

    /// Stream ended in the middle of a header or payload.
    #[error("unexpected end of stream: needed {expected} bytes, got {actual}")]
    UnexpectedEof {
        /// Bytes the parser still needed
        expected: usize,
        /// Bytes actually available
        actual: usize,
    },
}

impl ProtocolError {
    /// Shorthand for a [`ProtocolError::MalformedPayload`] at a known offset.
    pub(crate) fn payload(offset: usize, reason: impl Into<String>) -> Self {
        Self::MalformedPayload { offset, reason: reason.into() }
    }
}
