//! Castwire cryptographic envelope.
//!
//! The symmetric crypto negotiated by the `hello` exchange: PBKDF2 key
//! stretching from the pre-shared secret, the per-packet AES envelope
//! (CBC, GCM, CTR or CFB), and the HMAC digests used for challenge
//! responses.
//!
//! # Key lifecycle
//!
//! ```text
//! pre-shared secret (or auth password — the documented weaker mode)
//!        │
//!        ▼
//! PBKDF2-HMAC-SHA1/SHA256 over a random salt → AES key (per connection)
//!        │
//!        ▼
//! Encryptor (writer half) / Decryptor (reader half), independent IV state
//! ```
//!
//! Keys live in zeroise-on-drop buffers and are created exactly once, at
//! handshake completion; closing the connection drops both halves and
//! wipes the material.
//!
//! # Security
//!
//! - GCM is the only authenticated mode; a tag mismatch is fatal to the
//!   connection. The block modes rely on the packet decoder to reject
//!   garbage plaintext.
//! - Challenge verification is constant-time.
//! - When the authentication password doubles as key material, the
//!   connection is only as strong as that password.

pub mod digest;
pub mod envelope;
pub mod errors;
pub mod kdf;

pub use digest::ChallengeDigest;
pub use envelope::{BLOCK_IV_SIZE, CipherMode, Decryptor, Encryptor, GCM_NONCE_SIZE};
pub use errors::{CryptoError, Result};
pub use kdf::{
    DEFAULT_ITERATIONS, DEFAULT_KEY_SIZE, KeyHash, SALT_SIZE, StretchedKey, generate_salt,
    stretch_key,
};
