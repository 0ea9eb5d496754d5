//! Backpressure: the outbound high-water mark fails the connection
//! instead of buffering without bound.

use std::time::Duration;

use castwire_core::{ConnectionError, Protocol, ProtocolConfig, SendOptions, SessionState};
use castwire_proto::{Packet, Value};
use tokio::time::timeout;

#[tokio::test]
async fn high_water_mark_fails_send_and_closes() {
    // A tiny transport buffer and a reduced high-water mark stand in for
    // the production default of 65 536 queued packets.
    let (a, b) = tokio::io::duplex(1024);
    let config = ProtocolConfig { queue_high_water: 64, ..ProtocolConfig::default() };
    let client = Protocol::new(a, config).start().unwrap();

    // The peer never reads: hold its half open without starting an engine.
    let _peer = b;

    let mut overflow = None;
    for i in 0..1000 {
        match client.send(
            Packet::new("noise", vec![Value::Int(i), Value::text("x".repeat(64))]),
            SendOptions::new(),
        ) {
            Ok(()) => {},
            Err(error) => {
                overflow = Some(error);
                break;
            },
        }
    }

    let error = overflow.expect("the queue must overflow");
    assert!(
        matches!(error, ConnectionError::PeerTooSlow { high_water: 64, .. }),
        "unexpected error: {error}"
    );
    assert!(matches!(
        client.state(),
        SessionState::Closing | SessionState::Closed
    ));
    assert_eq!(client.last_error(), Some(error));

    // Subsequent sends are refused outright.
    let err = client.send(Packet::new("noise", vec![]), SendOptions::new()).unwrap_err();
    assert!(matches!(err, ConnectionError::Closed(_)));
}

#[tokio::test]
async fn queue_length_is_observable() {
    let (a, b) = tokio::io::duplex(1024);
    let client = Protocol::new(a, ProtocolConfig::default()).start().unwrap();
    let _peer = b;

    // Without yielding to the writer task, queued packets accumulate.
    for i in 0..10 {
        client
            .send(Packet::new("noise", vec![Value::Int(i)]), SendOptions::new())
            .unwrap();
    }
    assert!(client.queue_len() >= 10);
    assert!(client.stats().queue_len >= 10);

    timeout(Duration::from_millis(200), client.wait_established()).await.ok();
}
