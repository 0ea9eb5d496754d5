//! Property-based tests for the wire format.
//!
//! These verify the round-trip laws for ALL valid inputs, not just specific
//! examples: rencodeplus value trees survive encode/decode, headers survive
//! emit/parse, compressed bodies survive compress/decompress, and chunk
//! substitution reconstructs the sender's packet.

use bytes::Bytes;
use castwire_proto::{
    Chunk, CompressionPolicy, Compressor, PacketHeader, Reassembler, Value,
    header::{DEFAULT_PAYLOAD_LIMIT, FLAG_CIPHER, FLAG_FLUSH},
};
use proptest::prelude::*;

/// Strategy for arbitrary value trees, including nested lists and maps.
fn arbitrary_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        any::<i64>().prop_map(Value::Int),
        any::<bool>().prop_map(Value::Bool),
        Just(Value::None),
        any::<f64>().prop_map(Value::F64),
        prop::collection::vec(any::<u8>(), 0..200).prop_map(|b| Value::Bytes(Bytes::from(b))),
        ".{0,80}".prop_map(Value::Text),
        // Values past the native range exercise the decimal tail
        any::<i64>().prop_map(|i| Value::int(i128::from(i) * 7 + i128::from(i64::MAX))),
    ];
    leaf.prop_recursive(4, 64, 8, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..70).prop_map(Value::List),
            prop::collection::btree_map(inner.clone(), inner, 0..30).prop_map(Value::Map),
        ]
    })
}

#[test]
fn prop_value_encode_decode_roundtrip() {
    proptest!(|(value in arbitrary_value())| {
        let wire = value.to_wire();
        let decoded = Value::decode(&wire).expect("decode should succeed");

        // PROPERTY: Round-trip must be identity
        prop_assert_eq!(decoded, value);
    });
}

#[test]
fn prop_value_decode_never_panics_on_corruption() {
    proptest!(|(value in arbitrary_value(), flip in any::<(usize, u8)>())| {
        let mut wire = value.to_wire();
        let position = flip.0 % wire.len();
        wire[position] ^= flip.1;

        // PROPERTY: Corrupted input either decodes to some value or fails
        // cleanly; it never panics or loops.
        let _ = Value::decode(&wire);
    });
}

#[test]
fn prop_header_roundtrip() {
    proptest!(|(
        flush in any::<bool>(),
        cipher in any::<bool>(),
        level in 0u8..16,
        size in 0u32..=(DEFAULT_PAYLOAD_LIMIT as u32),
    )| {
        let mut flags = 0;
        if flush {
            flags |= FLAG_FLUSH;
        }
        if cipher {
            flags |= FLAG_CIPHER;
        }
        let compression = if level == 0 { 0 } else { Compressor::Lz4.header_byte(level) };
        let header = PacketHeader::main(flags, compression, size);

        let parsed = PacketHeader::parse(&header.to_bytes(), DEFAULT_PAYLOAD_LIMIT)
            .expect("parse should succeed");

        // PROPERTY: Header round-trip must be identity
        prop_assert_eq!(parsed, header);
        prop_assert_eq!(parsed.has_flush(), flush);
        prop_assert_eq!(parsed.has_cipher(), cipher);
    });
}

#[test]
fn prop_compression_roundtrip() {
    proptest!(|(
        body in prop::collection::vec(any::<u8>(), 0..4096),
        codec in prop_oneof![
            Just(Compressor::None),
            Just(Compressor::Lz4),
            Just(Compressor::Brotli),
        ],
    )| {
        let packed = codec.compress(&body, 3).expect("compress should succeed");
        let unpacked = codec
            .decompress(&packed, DEFAULT_PAYLOAD_LIMIT)
            .expect("decompress should succeed");

        // PROPERTY: Compression round-trip must be identity for every codec
        prop_assert_eq!(unpacked, body);
    });
}

#[test]
fn prop_policy_never_picks_unadvertised_codec() {
    proptest!(|(
        len in 0usize..100_000,
        may_compress in any::<bool>(),
        lz4 in any::<bool>(),
        brotli in any::<bool>(),
    )| {
        let policy = CompressionPolicy { threshold: 512, lz4, brotli, level: 1 };
        let codec = policy.choose(len, may_compress);

        match codec {
            Compressor::Lz4 => prop_assert!(lz4),
            Compressor::Brotli => prop_assert!(brotli),
            Compressor::None => {},
        }
        if len < 512 || !may_compress {
            prop_assert_eq!(codec, Compressor::None);
        }
    });
}

#[test]
fn prop_chunk_substitution_reconstructs_packet() {
    proptest!(|(
        blobs in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..512), 1..5),
        tail in prop::collection::vec(any::<i64>().prop_map(Value::Int), 0..4),
    )| {
        // Sender view: a main item list with placeholders, plus the raw
        // chunks destined for those positions.
        let mut items = vec![Value::text("blob-carrier")];
        let mut chunks = Vec::new();
        for (position, blob) in blobs.iter().enumerate() {
            items.push(Value::text(""));
            chunks.push(Chunk::new((position + 1) as u8, blob.clone()).expect("valid index"));
        }
        items.extend(tail.clone());

        // Receiver view: chunks arrive first, then the decoded main list.
        let mut reassembler = Reassembler::new();
        for chunk in &chunks {
            reassembler.store(chunk.index, chunk.data.clone()).expect("no duplicates");
        }
        let wire = Value::List(items.clone()).to_wire();
        let mut decoded = Value::decode_list(&wire).expect("decode should succeed");
        reassembler.substitute(&mut decoded).expect("substitution should succeed");

        // PROPERTY: The reconstruction equals the sender's packet with each
        // chunk in place of its placeholder.
        for chunk in &chunks {
            prop_assert_eq!(
                &decoded[usize::from(chunk.index)],
                &Value::Bytes(chunk.data.clone())
            );
        }
        prop_assert_eq!(decoded.len(), items.len());
        prop_assert_eq!(&decoded[decoded.len() - tail.len()..], &tail[..]);
        prop_assert!(reassembler.is_empty());
    });
}
