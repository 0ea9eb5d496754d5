//! The 8-byte packet header.
//!
//! Every frame on the wire starts with this header, in network byte order:
//!
//! ```text
//! +-------+-------+-------------+-------------+---------------------------+
//! | magic | flags | compression | chunk_index | payload_size (u32, BE)    |
//! | 'P'   | u8    | u8          | u8          |                           |
//! +-------+-------+-------------+-------------+---------------------------+
//! ```
//!
//! `payload_size` is exactly the number of bytes that follow the header
//! before the next header. `chunk_index` zero marks a main packet; any other
//! value marks a raw chunk destined for that position of the next main
//! packet.

use crate::errors::{ProtocolError, Result};

/// Size of the serialized header (8 bytes).
pub const HEADER_SIZE: usize = 8;

/// Header magic byte (`'P'`).
pub const MAGIC: u8 = b'P';

/// Flag bit: payload is a rencodeplus-encoded value tree.
///
/// Must be set on every main packet and clear on every chunk.
pub const FLAG_RENCODE: u8 = 0x10;

/// Flag bit: no packet follows immediately (a Nagle-style hint downstream).
pub const FLAG_FLUSH: u8 = 0x08;

/// Flag bit: payload is wrapped in the negotiated AES envelope.
pub const FLAG_CIPHER: u8 = 0x02;

/// All flag bits this implementation understands.
pub const FLAG_MASK: u8 = FLAG_RENCODE | FLAG_FLUSH | FLAG_CIPHER;

/// Compression byte, high nibble: lz4 block format.
pub const COMPRESS_LZ4: u8 = 0x10;

/// Compression byte, high nibble: brotli.
pub const COMPRESS_BROTLI: u8 = 0x40;

/// Mask of the compression-algorithm nibble.
pub const COMPRESS_ALGO_MASK: u8 = 0xf0;

/// Mask of the compression-level nibble.
pub const COMPRESS_LEVEL_MASK: u8 = 0x0f;

/// Default upper bound on `payload_size` (256 MiB).
pub const DEFAULT_PAYLOAD_LIMIT: usize = 256 * 1024 * 1024;

/// Parsed 8-byte packet header.
///
/// # Invariants
///
/// - `chunk_index != 0` implies the rencode flag is clear and `compression`
///   is zero: chunks are raw bytes that bypass the packet encoder.
/// - `payload_size` never exceeds the limit it was validated against.
///
/// Both are enforced by [`PacketHeader::parse`] for incoming headers and by
/// the constructors for outgoing ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Flag bitmask (`FLAG_*` constants).
    pub flags: u8,
    /// Compression byte: algorithm nibble plus level nibble.
    pub compression: u8,
    /// Zero for a main packet; the substitution position for a chunk.
    pub chunk_index: u8,
    /// Number of payload bytes following this header.
    pub payload_size: u32,
}

impl PacketHeader {
    /// Header for a main (rencodeplus-encoded) packet.
    #[must_use]
    pub fn main(flags: u8, compression: u8, payload_size: u32) -> Self {
        Self { flags: flags | FLAG_RENCODE, compression, chunk_index: 0, payload_size }
    }

    /// Header for a raw chunk at `chunk_index`.
    ///
    /// Chunks never carry the rencode flag and are never compressed; the
    /// only flag that may be set is [`FLAG_CIPHER`].
    #[must_use]
    pub fn chunk(chunk_index: u8, cipher: bool, payload_size: u32) -> Self {
        let flags = if cipher { FLAG_CIPHER } else { 0 };
        Self { flags, compression: 0, chunk_index, payload_size }
    }

    /// Serialize to wire bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let size = self.payload_size.to_be_bytes();
        [MAGIC, self.flags, self.compression, self.chunk_index, size[0], size[1], size[2], size[3]]
    }

    /// Parse and validate a header from wire bytes.
    ///
    /// Validation is cheapest-first: length, magic, unknown flag bits, the
    /// declared size against `payload_limit`, then the chunk invariant.
    /// The oversize check runs here so that a hostile header is rejected
    /// before any payload buffer is allocated.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::UnexpectedEof`] if fewer than 8 bytes are given
    /// - [`ProtocolError::MalformedHeader`] on bad magic, unknown flag bits,
    ///   or a chunk header claiming encoding/compression
    /// - [`ProtocolError::OversizedPacket`] if `payload_size` exceeds
    ///   `payload_limit`
    pub fn parse(bytes: &[u8], payload_limit: usize) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtocolError::UnexpectedEof {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        if bytes[0] != MAGIC {
            return Err(ProtocolError::MalformedHeader {
                reason: format!("bad magic byte {:#04x}", bytes[0]),
            });
        }

        let flags = bytes[1];
        if flags & !FLAG_MASK != 0 {
            return Err(ProtocolError::MalformedHeader {
                reason: format!("unknown flag bits {:#04x}", flags & !FLAG_MASK),
            });
        }

        let compression = bytes[2];
        let chunk_index = bytes[3];
        let payload_size = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

        if payload_size as usize > payload_limit {
            return Err(ProtocolError::OversizedPacket {
                size: payload_size as usize,
                limit: payload_limit,
            });
        }

        if chunk_index != 0 && (flags & FLAG_RENCODE != 0 || compression != 0) {
            return Err(ProtocolError::MalformedHeader {
                reason: format!(
                    "chunk {chunk_index} claims encoding (flags {flags:#04x}, compression {compression:#04x})"
                ),
            });
        }

        Ok(Self { flags, compression, chunk_index, payload_size })
    }

    /// Payload is a main rencodeplus packet.
    #[must_use]
    pub fn is_main(&self) -> bool {
        self.chunk_index == 0
    }

    /// Flush hint: no packet follows immediately.
    #[must_use]
    pub fn has_flush(&self) -> bool {
        self.flags & FLAG_FLUSH != 0
    }

    /// Payload is wrapped in the AES envelope.
    #[must_use]
    pub fn has_cipher(&self) -> bool {
        self.flags & FLAG_CIPHER != 0
    }

    /// Compression-algorithm nibble (`COMPRESS_*` constants, or zero).
    #[must_use]
    pub fn compression_algo(&self) -> u8 {
        self.compression & COMPRESS_ALGO_MASK
    }

    /// Compression-level nibble (zero means uncompressed).
    #[must_use]
    pub fn compression_level(&self) -> u8 {
        self.compression & COMPRESS_LEVEL_MASK
    }
}
