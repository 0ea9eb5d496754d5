//! Chunked payload scenarios: large blobs bypass the packet encoder and
//! are substituted back on receive.

use std::time::Duration;

use bytes::Bytes;
use castwire_core::{Protocol, ProtocolConfig, ProtocolHandle, SendOptions};
use castwire_proto::{Chunk, Packet, Value};
use tokio::{io::DuplexStream, sync::mpsc, time::timeout};

fn pair() -> (Protocol<DuplexStream>, Protocol<DuplexStream>) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    (
        Protocol::new(a, ProtocolConfig::default()),
        Protocol::new(b, ProtocolConfig::default()),
    )
}

async fn established(handle: &ProtocolHandle) {
    timeout(Duration::from_secs(5), handle.wait_established())
        .await
        .expect("handshake should not hang")
        .expect("handshake should succeed");
}

#[tokio::test]
async fn megabyte_chunk_is_substituted_at_its_index() {
    let (client, mut server) = pair();

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<(Bytes, String)>();
    server
        .register_handler("big", move |packet| {
            let blob = packet.arg_bytes(0).map_err(|e| e.to_string())?.clone();
            let meta = packet.arg_text(1).map_err(|e| e.to_string())?.to_owned();
            seen_tx.send((blob, meta)).ok();
            Ok(())
        })
        .unwrap();

    let client = client.start().unwrap();
    let server = server.start().unwrap();
    established(&client).await;
    established(&server).await;

    // The main packet carries a placeholder at the chunked position; the
    // pixel buffer travels as a raw chunk for wire position 1.
    let pixels = vec![0xAAu8; 1_048_576];
    let packet = Packet::new("big", vec![Value::text(""), Value::text("meta")]);
    let chunk = Chunk::new(1, pixels.clone()).unwrap();
    client.send(packet, SendOptions::new().chunks(vec![chunk])).unwrap();

    let (blob, meta) = timeout(Duration::from_secs(10), seen_rx.recv())
        .await
        .expect("chunked packet should arrive")
        .expect("channel open");
    assert_eq!(blob.len(), 1_048_576);
    assert_eq!(blob.as_ref(), pixels.as_slice());
    assert_eq!(meta, "meta");
}

#[tokio::test]
async fn multiple_chunks_substitute_in_one_packet() {
    let (client, mut server) = pair();

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<Vec<Bytes>>();
    server
        .register_handler("multi", move |packet| {
            let blobs = (0..packet.len())
                .map(|i| packet.arg_bytes(i).map(Clone::clone).map_err(|e| e.to_string()))
                .collect::<Result<Vec<_>, _>>()?;
            seen_tx.send(blobs).ok();
            Ok(())
        })
        .unwrap();

    let client = client.start().unwrap();
    let server = server.start().unwrap();
    established(&client).await;
    established(&server).await;

    let packet = Packet::new("multi", vec![Value::text(""), Value::text("")]);
    let chunks = vec![
        Chunk::new(1, vec![1u8; 4096]).unwrap(),
        Chunk::new(2, vec![2u8; 8192]).unwrap(),
    ];
    client.send(packet, SendOptions::new().chunks(chunks)).unwrap();

    let blobs = timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .expect("packet should arrive")
        .expect("channel open");
    assert_eq!(blobs.len(), 2);
    assert_eq!(blobs[0].as_ref(), &[1u8; 4096][..]);
    assert_eq!(blobs[1].as_ref(), &[2u8; 8192][..]);
}

#[tokio::test]
async fn chunks_travel_encrypted_when_cipher_is_negotiated() {
    let (mut client, mut server) = pair();
    client.set_cipher(b"swordfish", castwire_crypto::CipherMode::Gcm);
    server.set_password(b"swordfish");

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<Bytes>();
    server
        .register_handler("pixels", move |packet| {
            seen_tx.send(packet.arg_bytes(0).map_err(|e| e.to_string())?.clone()).ok();
            Ok(())
        })
        .unwrap();

    let client = client.start().unwrap();
    let server = server.start().unwrap();
    established(&client).await;
    established(&server).await;

    let blob = vec![0x5Au8; 100_000];
    let packet = Packet::new("pixels", vec![Value::text("")]);
    let chunk = Chunk::new(1, blob.clone()).unwrap();
    client.send(packet, SendOptions::new().chunks(vec![chunk])).unwrap();

    let received = timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .expect("packet should arrive")
        .expect("channel open");
    assert_eq!(received.as_ref(), blob.as_slice());
}
