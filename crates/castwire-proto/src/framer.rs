//! Frame emission and chunk reassembly.
//!
//! Large binary arguments (pixel data, file transfers) bypass the packet
//! encoder: the sender transmits them as raw chunk frames ahead of the main
//! packet, each tagged with the item position it replaces. The receiver
//! buffers chunks until the main packet arrives, then substitutes each one
//! into its slot.
//!
//! Chunks for a main packet are always emitted before the main packet
//! itself, so the reassembly buffer never spans packets: it fills while
//! chunk frames arrive and is drained by the next main frame.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::{
    errors::{ProtocolError, Result},
    header::{HEADER_SIZE, PacketHeader},
    rencode::Value,
};

/// A raw binary blob that replaces the item at `index` in the main packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Position in the wire item list (never zero — zero marks the main
    /// packet itself).
    pub index: u8,
    /// The raw bytes.
    pub data: Bytes,
}

impl Chunk {
    /// Build a chunk for position `index`.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Framing`] when `index` is zero.
    pub fn new(index: u8, data: impl Into<Bytes>) -> Result<Self> {
        if index == 0 {
            return Err(ProtocolError::Framing("chunk index zero is the main packet".into()));
        }
        Ok(Self { index, data: data.into() })
    }
}

/// Serialize one frame: header followed by payload bytes.
#[must_use]
pub fn encode_frame(header: &PacketHeader, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(payload);
    out
}

/// Receive-side chunk buffer for the next main packet.
#[derive(Debug, Default)]
pub struct Reassembler {
    chunks: BTreeMap<u8, Bytes>,
}

impl Reassembler {
    /// Fresh, empty reassembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// No chunks are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Number of pending chunks.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.chunks.len()
    }

    /// Store a received chunk against the next main packet.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Framing`] on index zero or a duplicate index.
    pub fn store(&mut self, index: u8, data: Bytes) -> Result<()> {
        if index == 0 {
            return Err(ProtocolError::Framing("chunk frame with index zero".into()));
        }
        if self.chunks.insert(index, data).is_some() {
            return Err(ProtocolError::Framing(format!("duplicate chunk index {index}")));
        }
        Ok(())
    }

    /// Substitute every pending chunk into the decoded main item list and
    /// clear the buffer.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Framing`] when a chunk index is outside the item
    /// list. The buffer is cleared even on failure — a failed main packet
    /// must not leak its chunks into the next one.
    pub fn substitute(&mut self, items: &mut [Value]) -> Result<()> {
        let chunks = std::mem::take(&mut self.chunks);
        let len = items.len();
        for (index, data) in chunks {
            let slot = items.get_mut(usize::from(index)).ok_or_else(|| {
                ProtocolError::Framing(format!(
                    "chunk index {index} outside a {len}-item packet"
                ))
            })?;
            *slot = Value::Bytes(data);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_index_zero_rejected() {
        assert!(Chunk::new(0, vec![1u8]).is_err());
        let mut reassembler = Reassembler::new();
        assert!(matches!(
            reassembler.store(0, Bytes::from_static(b"x")),
            Err(ProtocolError::Framing(_))
        ));
    }

    #[test]
    fn duplicate_chunk_rejected() {
        let mut reassembler = Reassembler::new();
        reassembler.store(1, Bytes::from_static(b"a")).unwrap();
        assert!(matches!(
            reassembler.store(1, Bytes::from_static(b"b")),
            Err(ProtocolError::Framing(_))
        ));
    }

    #[test]
    fn substitution_replaces_placeholders() {
        let mut reassembler = Reassembler::new();
        reassembler.store(1, Bytes::from_static(b"pixels")).unwrap();
        reassembler.store(2, Bytes::from_static(b"icon")).unwrap();

        let mut items = vec![Value::text("draw"), Value::text(""), Value::None, Value::Int(5)];
        reassembler.substitute(&mut items).unwrap();

        assert_eq!(items[1], Value::bytes(&b"pixels"[..]));
        assert_eq!(items[2], Value::bytes(&b"icon"[..]));
        assert_eq!(items[3], Value::Int(5));
        assert!(reassembler.is_empty());
    }

    #[test]
    fn out_of_range_chunk_rejected_and_buffer_cleared() {
        let mut reassembler = Reassembler::new();
        reassembler.store(9, Bytes::from_static(b"x")).unwrap();

        let mut items = vec![Value::text("small")];
        assert!(matches!(
            reassembler.substitute(&mut items),
            Err(ProtocolError::Framing(_))
        ));
        assert!(reassembler.is_empty());
    }

    #[test]
    fn frame_encoding_is_header_then_payload() {
        let header = PacketHeader::chunk(3, false, 4);
        let frame = encode_frame(&header, b"data");
        assert_eq!(frame.len(), HEADER_SIZE + 4);
        assert_eq!(&frame[..HEADER_SIZE], &header.to_bytes());
        assert_eq!(&frame[HEADER_SIZE..], b"data");
    }
}
