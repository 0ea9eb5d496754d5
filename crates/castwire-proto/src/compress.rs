//! Per-packet compression codecs.
//!
//! Three codecs are addressed by the header's high compression nibble:
//! `none` (0), lz4 (`0x10`, block format with the uncompressed size
//! prepended) and brotli (`0x40`). The sender picks a codec per packet from
//! size and peer capability; the receiver picks solely from the header and
//! treats a codec the peer never advertised as a protocol error.

use std::io::Read;

use crate::{
    errors::{ProtocolError, Result},
    header::{COMPRESS_ALGO_MASK, COMPRESS_BROTLI, COMPRESS_LEVEL_MASK, COMPRESS_LZ4},
};

/// Default minimum payload size worth compressing (bytes).
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 512;

/// A compression codec, as addressed by the packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    /// Passthrough.
    None,
    /// lz4 block format, uncompressed size prepended.
    Lz4,
    /// Brotli, quality taken from the level nibble.
    Brotli,
}

impl Compressor {
    /// Resolve the codec from a header compression byte.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Compression`] on an unknown algorithm nibble, or on
    /// a zero algorithm with a non-zero level.
    pub fn from_header(compression: u8) -> Result<Self> {
        match compression & COMPRESS_ALGO_MASK {
            0 => {
                if compression & COMPRESS_LEVEL_MASK != 0 {
                    return Err(ProtocolError::Compression(format!(
                        "level {} without an algorithm",
                        compression & COMPRESS_LEVEL_MASK
                    )));
                }
                Ok(Self::None)
            },
            COMPRESS_LZ4 => Ok(Self::Lz4),
            COMPRESS_BROTLI => Ok(Self::Brotli),
            other => Err(ProtocolError::Compression(format!(
                "unknown compressor code {other:#04x}"
            ))),
        }
    }

    /// Header compression byte for this codec at `level`.
    #[must_use]
    pub fn header_byte(self, level: u8) -> u8 {
        match self {
            Self::None => 0,
            Self::Lz4 => COMPRESS_LZ4 | (level & COMPRESS_LEVEL_MASK),
            Self::Brotli => COMPRESS_BROTLI | (level & COMPRESS_LEVEL_MASK),
        }
    }

    /// Wire name, as used in capability keys.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Lz4 => "lz4",
            Self::Brotli => "brotli",
        }
    }

    /// Compress `data`. `level` is ignored by lz4 and is the brotli quality.
    pub fn compress(self, data: &[u8], level: u8) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Lz4 => Ok(lz4_flex::block::compress_prepend_size(data)),
            Self::Brotli => {
                let params = brotli::enc::BrotliEncoderParams {
                    quality: i32::from(level.clamp(1, 11)),
                    ..brotli::enc::BrotliEncoderParams::default()
                };
                let mut out = Vec::new();
                brotli::BrotliCompress(&mut &data[..], &mut out, &params)
                    .map_err(|e| ProtocolError::Compression(format!("brotli: {e}")))?;
                Ok(out)
            },
        }
    }

    /// Decompress `data`, refusing to produce more than `limit` bytes.
    pub fn decompress(self, data: &[u8], limit: usize) -> Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Lz4 => {
                let (size, _) = lz4_flex::block::uncompressed_size(data)
                    .map_err(|e| ProtocolError::Compression(format!("lz4: {e}")))?;
                if size > limit {
                    return Err(ProtocolError::Compression(format!(
                        "lz4 body expands to {size} bytes, over the {limit} byte limit"
                    )));
                }
                lz4_flex::block::decompress_size_prepended(data)
                    .map_err(|e| ProtocolError::Compression(format!("lz4: {e}")))
            },
            Self::Brotli => {
                let mut out = Vec::new();
                let mut reader = brotli::Decompressor::new(data, 4096).take(limit as u64 + 1);
                reader
                    .read_to_end(&mut out)
                    .map_err(|e| ProtocolError::Compression(format!("brotli: {e}")))?;
                if out.len() > limit {
                    return Err(ProtocolError::Compression(format!(
                        "brotli body expands past the {limit} byte limit"
                    )));
                }
                Ok(out)
            },
        }
    }
}

/// Sender-side compression policy: what the peer accepts, and below what
/// size compression is not worth attempting.
#[derive(Debug, Clone)]
pub struct CompressionPolicy {
    /// Minimum payload size to compress.
    pub threshold: usize,
    /// Peer advertised lz4 support.
    pub lz4: bool,
    /// Peer advertised brotli support.
    pub brotli: bool,
    /// Level nibble recorded in the header (brotli quality).
    pub level: u8,
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self { threshold: DEFAULT_COMPRESSION_THRESHOLD, lz4: false, brotli: false, level: 1 }
    }
}

impl CompressionPolicy {
    /// Pick a codec for a payload of `len` bytes.
    ///
    /// `may_compress` is the producer's hint; packets marked incompressible
    /// (already-compressed pixel data, encrypted blobs) are sent raw. lz4 is
    /// preferred over brotli when both are available.
    #[must_use]
    pub fn choose(&self, len: usize, may_compress: bool) -> Compressor {
        if !may_compress || len < self.threshold {
            return Compressor::None;
        }
        if self.lz4 {
            Compressor::Lz4
        } else if self.brotli {
            Compressor::Brotli
        } else {
            Compressor::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lz4_round_trip() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(20);
        let packed = Compressor::Lz4.compress(&data, 1).unwrap();
        assert!(packed.len() < data.len());
        let unpacked = Compressor::Lz4.decompress(&packed, 1 << 20).unwrap();
        assert_eq!(unpacked, data);
    }

    #[test]
    fn brotli_round_trip() {
        let data = b"abcdefgh".repeat(200);
        let packed = Compressor::Brotli.compress(&data, 5).unwrap();
        assert!(packed.len() < data.len());
        let unpacked = Compressor::Brotli.decompress(&packed, 1 << 20).unwrap();
        assert_eq!(unpacked, data);
    }

    #[test]
    fn lz4_expansion_limit_enforced() {
        let data = vec![0u8; 4096];
        let packed = Compressor::Lz4.compress(&data, 1).unwrap();
        assert!(matches!(
            Compressor::Lz4.decompress(&packed, 100),
            Err(ProtocolError::Compression(_))
        ));
    }

    #[test]
    fn brotli_expansion_limit_enforced() {
        let data = vec![0u8; 4096];
        let packed = Compressor::Brotli.compress(&data, 5).unwrap();
        assert!(matches!(
            Compressor::Brotli.decompress(&packed, 100),
            Err(ProtocolError::Compression(_))
        ));
    }

    #[test]
    fn header_byte_round_trip() {
        for (codec, level) in [(Compressor::Lz4, 1), (Compressor::Brotli, 9)] {
            let byte = codec.header_byte(level);
            assert_eq!(Compressor::from_header(byte).unwrap(), codec);
        }
        assert_eq!(Compressor::from_header(0).unwrap(), Compressor::None);
    }

    #[test]
    fn unknown_codec_rejected() {
        assert!(matches!(
            Compressor::from_header(0x20),
            Err(ProtocolError::Compression(_))
        ));
        // A level without an algorithm is malformed too.
        assert!(matches!(
            Compressor::from_header(0x03),
            Err(ProtocolError::Compression(_))
        ));
    }

    #[test]
    fn policy_respects_threshold_and_capability() {
        let policy = CompressionPolicy { threshold: 512, lz4: true, brotli: true, level: 1 };
        assert_eq!(policy.choose(100, true), Compressor::None);
        assert_eq!(policy.choose(1000, true), Compressor::Lz4);
        assert_eq!(policy.choose(1000, false), Compressor::None);

        let brotli_only = CompressionPolicy { lz4: false, ..policy };
        assert_eq!(brotli_only.choose(1000, true), Compressor::Brotli);

        let neither = CompressionPolicy::default();
        assert_eq!(neither.choose(1000, true), Compressor::None);
    }
}
