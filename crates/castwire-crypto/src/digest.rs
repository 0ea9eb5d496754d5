//! Challenge-response digests.
//!
//! A peer that demands authentication replies to the first `hello` with a
//! `challenge` packet carrying a random salt and a digest specification.
//! The initiator answers with a fresh `hello` whose `challenge_response` is
//! `HMAC(password, salt)` under the requested digest, hex-encoded.
//!
//! Bare `"hmac"` is the MD5 legacy alias and is accepted but never chosen
//! by this side. Verification is constant-time.

use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::Sha1;
use sha2::Sha256;

use crate::errors::{CryptoError, Result};

/// HMAC digest used for challenge responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeDigest {
    /// `hmac` / `hmac+md5`: the legacy alias.
    HmacMd5,
    /// `hmac+sha1`.
    HmacSha1,
    /// `hmac+sha256`, the preferred digest.
    HmacSha256,
}

impl ChallengeDigest {
    /// Parse the wire form advertised in a `challenge` packet.
    pub fn parse(spec: &str) -> Result<Self> {
        match spec.to_ascii_lowercase().as_str() {
            "hmac" | "hmac+md5" => Ok(Self::HmacMd5),
            "hmac+sha1" => Ok(Self::HmacSha1),
            "hmac+sha256" => Ok(Self::HmacSha256),
            other => {
                Err(CryptoError::InvalidParameter(format!("unknown challenge digest '{other}'")))
            },
        }
    }

    /// Wire form for a `challenge` packet.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::HmacMd5 => "hmac+md5",
            Self::HmacSha1 => "hmac+sha1",
            Self::HmacSha256 => "hmac+sha256",
        }
    }

    /// Compute the hex response for `salt` under `password`.
    ///
    /// HMAC accepts keys of any length, so this cannot fail; an impossible
    /// keying error yields an empty response, which never verifies.
    #[must_use]
    pub fn respond(self, password: &[u8], salt: &[u8]) -> String {
        let raw = match self {
            Self::HmacMd5 => {
                let Ok(mut mac) = Hmac::<Md5>::new_from_slice(password) else {
                    return String::new();
                };
                mac.update(salt);
                mac.finalize().into_bytes().to_vec()
            },
            Self::HmacSha1 => {
                let Ok(mut mac) = Hmac::<Sha1>::new_from_slice(password) else {
                    return String::new();
                };
                mac.update(salt);
                mac.finalize().into_bytes().to_vec()
            },
            Self::HmacSha256 => {
                let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(password) else {
                    return String::new();
                };
                mac.update(salt);
                mac.finalize().into_bytes().to_vec()
            },
        };
        hex::encode(raw)
    }

    /// Constant-time check of a received hex response.
    #[must_use]
    pub fn verify(self, password: &[u8], salt: &[u8], response: &str) -> bool {
        let Ok(received) = hex::decode(response) else {
            return false;
        };
        match self {
            Self::HmacMd5 => {
                let Ok(mut mac) = Hmac::<Md5>::new_from_slice(password) else {
                    return false;
                };
                mac.update(salt);
                mac.verify_slice(&received).is_ok()
            },
            Self::HmacSha1 => {
                let Ok(mut mac) = Hmac::<Sha1>::new_from_slice(password) else {
                    return false;
                };
                mac.update(salt);
                mac.verify_slice(&received).is_ok()
            },
            Self::HmacSha256 => {
                let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(password) else {
                    return false;
                };
                mac.update(salt);
                mac.verify_slice(&received).is_ok()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 2202 / RFC 4231 "Jefe" vectors.
    const KEY: &[u8] = b"Jefe";
    const DATA: &[u8] = b"what do ya want for nothing?";

    #[test]
    fn hmac_md5_vector() {
        assert_eq!(
            ChallengeDigest::HmacMd5.respond(KEY, DATA),
            "750c783e6ab0b503eaa86e310a5db738"
        );
    }

    #[test]
    fn hmac_sha1_vector() {
        assert_eq!(
            ChallengeDigest::HmacSha1.respond(KEY, DATA),
            "effcdf6ae5eb2fa2d27416d5f184df9c259a7c79"
        );
    }

    #[test]
    fn hmac_sha256_vector() {
        assert_eq!(
            ChallengeDigest::HmacSha256.respond(KEY, DATA),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn verify_accepts_good_and_rejects_bad() {
        let salt = b"random salt bytes";
        for digest in
            [ChallengeDigest::HmacMd5, ChallengeDigest::HmacSha1, ChallengeDigest::HmacSha256]
        {
            let response = digest.respond(b"swordfish", salt);
            assert!(digest.verify(b"swordfish", salt, &response));
            assert!(!digest.verify(b"wrong password", salt, &response));
            assert!(!digest.verify(b"swordfish", b"other salt", &response));
            assert!(!digest.verify(b"swordfish", salt, "not hex!"));
        }
    }

    #[test]
    fn parse_accepts_legacy_alias() {
        assert_eq!(ChallengeDigest::parse("hmac").unwrap(), ChallengeDigest::HmacMd5);
        assert_eq!(ChallengeDigest::parse("HMAC+SHA1").unwrap(), ChallengeDigest::HmacSha1);
        assert_eq!(ChallengeDigest::parse("hmac+sha256").unwrap(), ChallengeDigest::HmacSha256);
        assert!(ChallengeDigest::parse("crc32").is_err());
    }
}
