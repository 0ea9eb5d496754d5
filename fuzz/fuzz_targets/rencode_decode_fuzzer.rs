//! The decoder must never panic, loop, or over-allocate on hostile input,
//! and anything it accepts must re-encode to a decodable form.

#![no_main]

use castwire_proto::Value;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(value) = Value::decode(data) {
        // Accepted input must round-trip through our own encoder.
        let wire = value.to_wire();
        let again = Value::decode(&wire).expect("re-encoded value must decode");
        assert_eq!(again, value);
    }
});
