//! The decryptor must reject or cleanly process arbitrary ciphertext in
//! every mode, without panicking.

#![no_main]

use castwire_crypto::{CipherMode, Decryptor, KeyHash, stretch_key};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let key = stretch_key(b"fuzz", b"fuzz-salt", KeyHash::Sha1, 1, 32).expect("valid parameters");
    let iv = [0u8; 16];
    for mode in [CipherMode::Cbc, CipherMode::Gcm, CipherMode::Ctr, CipherMode::Cfb] {
        let stream_iv = mode.needs_stream_iv().then_some(&iv[..]);
        let mut decryptor = Decryptor::new(mode, &key, stream_iv).expect("valid parameters");
        let _ = decryptor.open(data);
    }
});
