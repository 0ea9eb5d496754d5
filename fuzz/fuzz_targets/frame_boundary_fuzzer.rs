//! Header parsing and chunk bookkeeping on arbitrary bytes.

#![no_main]

use bytes::Bytes;
use castwire_proto::{PacketHeader, Reassembler, Value};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = PacketHeader::parse(data, 1 << 20);

    if data.len() < 2 {
        return;
    }
    let (control, rest) = data.split_at(2);

    let mut reassembler = Reassembler::new();
    let _ = reassembler.store(control[0], Bytes::copy_from_slice(rest));
    let _ = reassembler.store(control[1], Bytes::copy_from_slice(rest));
    if let Ok(mut items) = Value::decode_list(rest) {
        let _ = reassembler.substitute(&mut items);
    }
});
