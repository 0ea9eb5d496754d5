//! Castwire wire format.
//!
//! The byte-level contract of the castwire remote-display protocol: the
//! 8-byte packet header, the rencodeplus structural codec used for main
//! payloads, the per-packet compression codecs, and the chunk framing that
//! lets large binary arguments bypass the structural encoder.
//!
//! Everything in this crate is sans-IO and operates on in-memory buffers;
//! the protocol engine in `castwire-core` drives it against a byte stream.

pub mod compress;
pub mod errors;
pub mod framer;
pub mod header;
pub mod packet;
pub mod rencode;

pub use compress::{CompressionPolicy, Compressor, DEFAULT_COMPRESSION_THRESHOLD};
pub use errors::{ProtocolError, Result};
pub use framer::{Chunk, Reassembler, encode_frame};
pub use header::{
    DEFAULT_PAYLOAD_LIMIT, FLAG_CIPHER, FLAG_FLUSH, FLAG_RENCODE, HEADER_SIZE, PacketHeader,
};
pub use packet::Packet;
pub use rencode::Value;
