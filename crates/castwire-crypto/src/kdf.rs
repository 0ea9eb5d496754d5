//! PBKDF2 key stretching.
//!
//! The pre-shared secret (or, in the weaker documented mode, the
//! authentication password) is never used directly: it is stretched with
//! PBKDF2 over a random salt into a key of the negotiated size. The digest
//! and iteration count are negotiated in `hello`; SHA-1 is the wire default,
//! SHA-256 the recommended upgrade.
//!
//! Derived keys are wrapped in [`StretchedKey`], which zeroises the material
//! on drop.

use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha1::Sha1;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::errors::{CryptoError, Result};

/// Key size for AES-256, the recommended configuration.
pub const DEFAULT_KEY_SIZE: usize = 32;

/// Default PBKDF2 iteration count, the negotiated minimum.
pub const DEFAULT_ITERATIONS: u32 = 1000;

/// Salt size generated by [`generate_salt`].
pub const SALT_SIZE: usize = 16;

/// Digest used for PBKDF2 key stretching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyHash {
    /// PBKDF2-HMAC-SHA1, the wire default.
    Sha1,
    /// PBKDF2-HMAC-SHA256, negotiated upgrade.
    Sha256,
}

impl KeyHash {
    /// Parse the capability form (`"SHA1"` / `"SHA256"`, case-insensitive).
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "SHA1" | "SHA-1" => Ok(Self::Sha1),
            "SHA256" | "SHA-256" => Ok(Self::Sha256),
            other => Err(CryptoError::InvalidParameter(format!("unknown key hash '{other}'"))),
        }
    }

    /// Capability wire name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
        }
    }
}

/// A derived AES key. The material is zeroised when dropped.
pub struct StretchedKey(Zeroizing<Vec<u8>>);

impl StretchedKey {
    /// Key material.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Key size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Key is empty (never true for a derived key).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for StretchedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material must never reach logs.
        f.debug_struct("StretchedKey").field("len", &self.0.len()).finish_non_exhaustive()
    }
}

/// Stretch `password` into an AES key.
///
/// # Errors
///
/// [`CryptoError::InvalidParameter`] on an unsupported key size (only 16,
/// 24 and 32 are AES keys), an empty salt, or a zero iteration count.
pub fn stretch_key(
    password: &[u8],
    salt: &[u8],
    hash: KeyHash,
    iterations: u32,
    key_size: usize,
) -> Result<StretchedKey> {
    if !matches!(key_size, 16 | 24 | 32) {
        return Err(CryptoError::InvalidParameter(format!("key size {key_size} is not an AES key")));
    }
    if salt.is_empty() {
        return Err(CryptoError::InvalidParameter("empty key salt".into()));
    }
    if iterations == 0 {
        return Err(CryptoError::InvalidParameter("zero key stretch iterations".into()));
    }

    let mut key = Zeroizing::new(vec![0u8; key_size]);
    match hash {
        KeyHash::Sha1 => pbkdf2_hmac::<Sha1>(password, salt, iterations, &mut key),
        KeyHash::Sha256 => pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut key),
    }
    Ok(StretchedKey(key))
}

/// Fresh random salt from the operating system RNG.
#[must_use]
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6070 PBKDF2-HMAC-SHA1 test vectors.
    #[test]
    fn pbkdf2_sha1_rfc6070_vectors() {
        let key = stretch_key(b"password", b"salt", KeyHash::Sha1, 1, 16).unwrap();
        assert_eq!(hex::encode(&key.as_slice()[..16]), "0c60c80f961f0e71f3a9b524af601206");

        let key = stretch_key(b"password", b"salt", KeyHash::Sha1, 2, 16).unwrap();
        assert_eq!(hex::encode(&key.as_slice()[..16]), "ea6c014dc72d6f8ccd1ed92ace1d41f0");
    }

    #[test]
    fn pbkdf2_sha256_derives_requested_length() {
        let key = stretch_key(b"swordfish", b"0123456789abcdef", KeyHash::Sha256, 1000, 32).unwrap();
        assert_eq!(key.len(), 32);

        // Same inputs, same key; different salt, different key.
        let again =
            stretch_key(b"swordfish", b"0123456789abcdef", KeyHash::Sha256, 1000, 32).unwrap();
        assert_eq!(key.as_slice(), again.as_slice());

        let other = stretch_key(b"swordfish", b"fedcba9876543210", KeyHash::Sha256, 1000, 32).unwrap();
        assert_ne!(key.as_slice(), other.as_slice());
    }

    #[test]
    fn invalid_parameters_rejected() {
        assert!(stretch_key(b"p", b"s", KeyHash::Sha1, 1000, 17).is_err());
        assert!(stretch_key(b"p", b"", KeyHash::Sha1, 1000, 32).is_err());
        assert!(stretch_key(b"p", b"s", KeyHash::Sha1, 0, 32).is_err());
    }

    #[test]
    fn key_hash_parse() {
        assert_eq!(KeyHash::parse("sha1").unwrap(), KeyHash::Sha1);
        assert_eq!(KeyHash::parse("SHA-256").unwrap(), KeyHash::Sha256);
        assert!(KeyHash::parse("md5").is_err());
    }

    #[test]
    fn salts_are_unique() {
        assert_ne!(generate_salt(), generate_salt());
    }
}
