//! Connection-scoped configuration.
//!
//! One immutable struct passed at construction; nothing global, nothing
//! from the environment. Every limit the protocol enforces is visible and
//! tunable here.

use std::time::Duration;

use castwire_proto::{DEFAULT_COMPRESSION_THRESHOLD, DEFAULT_PAYLOAD_LIMIT};

/// Default handshake completion timeout.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for the chunks of a partially reassembled packet.
pub const DEFAULT_CHUNK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default outbound queue high-water mark, in packets.
pub const DEFAULT_QUEUE_HIGH_WATER: usize = 65_536;

/// Default number of additional `hello` attempts tolerated during
/// challenge-response authentication.
pub const DEFAULT_HELLO_RETRY_LIMIT: u8 = 3;

/// Immutable per-connection configuration.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Version string advertised in `hello`.
    pub version: String,
    /// Upper bound on any single frame payload, enforced from the header
    /// before allocation.
    pub payload_limit: usize,
    /// Minimum payload size worth compressing.
    pub compression_threshold: usize,
    /// Compression level nibble (brotli quality; lz4 ignores it).
    pub compression_level: u8,
    /// Outbound queue length at which `send` fails with `PeerTooSlow`.
    pub queue_high_water: usize,
    /// Time allowed for the `hello` exchange to complete.
    pub handshake_timeout: Duration,
    /// Time allowed between a chunk frame and its main packet.
    pub chunk_timeout: Duration,
    /// Additional `hello` attempts before authentication fails.
    pub hello_retry_limit: u8,
    /// Advertise lz4 decompression support.
    pub advertise_lz4: bool,
    /// Advertise brotli decompression support.
    pub advertise_brotli: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            version: "6.0".to_string(),
            payload_limit: DEFAULT_PAYLOAD_LIMIT,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            compression_level: 1,
            queue_high_water: DEFAULT_QUEUE_HIGH_WATER,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            chunk_timeout: DEFAULT_CHUNK_TIMEOUT,
            hello_retry_limit: DEFAULT_HELLO_RETRY_LIMIT,
            advertise_lz4: true,
            advertise_brotli: true,
        }
    }
}
