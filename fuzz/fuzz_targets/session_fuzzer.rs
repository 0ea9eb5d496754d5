//! The handshake machine must tolerate arbitrary packet sequences.

#![no_main]

use castwire_core::{Capabilities, Session, SessionConfig};
use castwire_proto::{Packet, Value};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut session = Session::new(SessionConfig {
        local_caps: Capabilities::new("6.0"),
        password: Some(b"fuzz".to_vec()),
        require_challenge: None,
        retry_limit: 3,
    });
    let _ = session.start();

    for piece in data.chunks(16) {
        let packet = match Value::decode(piece) {
            Ok(Value::List(mut items)) if !items.is_empty() => {
                let name = match items.remove(0) {
                    Value::Text(name) => name,
                    _ => "hello".to_string(),
                };
                Packet::new(name, items)
            },
            _ => Packet::new("hello", vec![Value::Bytes(piece.to_vec().into())]),
        };
        let _ = session.handle_packet(packet);
    }
    let _ = session.close("fuzz done");
});
