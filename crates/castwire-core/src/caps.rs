//! The `hello` capability dictionary.
//!
//! A typed view over the heterogeneous map exchanged in `hello`. The core
//! reads the keys it owns — `version`, `aliases`, the `cipher.*` family,
//! compression opt-ins, `challenge_response` — and passes everything else
//! through opaquely for subsystems.

use std::collections::BTreeMap;

use castwire_crypto::{
    CipherMode, KeyHash,
    kdf::{DEFAULT_ITERATIONS, DEFAULT_KEY_SIZE},
};
use castwire_proto::Value;
use rand::RngCore;

use crate::error::{ConnectionError, Result};

/// Cipher parameters advertised in `hello`.
///
/// The parameters a side advertises describe the packets that side will
/// send; the receiver builds the matching decryptor from them and the
/// shared secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherSpec {
    /// Mode of operation.
    pub mode: CipherMode,
    /// PBKDF2 salt for this direction's key.
    pub key_salt: Vec<u8>,
    /// PBKDF2 digest.
    pub key_hash: KeyHash,
    /// PBKDF2 iteration count.
    pub iterations: u32,
    /// Derived key size in bytes.
    pub key_size: usize,
    /// Per-connection stream IV (CTR only).
    pub iv: Option<Vec<u8>>,
}

impl CipherSpec {
    /// Fresh parameters for this side's outgoing direction: random salt,
    /// and a random stream IV when the mode needs one.
    #[must_use]
    pub fn generate(mode: CipherMode) -> Self {
        let mut salt = vec![0u8; castwire_crypto::SALT_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let iv = mode.needs_stream_iv().then(|| {
            let mut iv = vec![0u8; castwire_crypto::BLOCK_IV_SIZE];
            rand::rngs::OsRng.fill_bytes(&mut iv);
            iv
        });
        Self {
            mode,
            key_salt: salt,
            key_hash: KeyHash::Sha256,
            iterations: DEFAULT_ITERATIONS,
            key_size: DEFAULT_KEY_SIZE,
            iv,
        }
    }
}

/// Typed wrapper over the `hello` capability map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    map: BTreeMap<Value, Value>,
}

impl Capabilities {
    /// Capability map advertising `version`.
    pub fn new(version: impl Into<String>) -> Self {
        let mut caps = Self::default();
        caps.insert("version", Value::text(version));
        caps
    }

    /// Read a capability map out of a decoded `hello` argument.
    pub fn from_value(value: &Value) -> Result<Self> {
        let map = value.as_map().ok_or_else(|| {
            ConnectionError::Auth(format!(
                "hello payload is a {}, not a capability map",
                value.type_name()
            ))
        })?;
        Ok(Self { map: map.clone() })
    }

    /// The whole map as a packet argument.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Map(self.map.clone())
    }

    /// Insert a raw capability; subsystem keys pass through here.
    pub fn insert(&mut self, key: &str, value: Value) {
        self.map.insert(Value::text(key), value);
    }

    /// Raw capability lookup.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(&Value::text(key))
    }

    /// Advertised protocol version.
    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.get("version").and_then(Value::as_text)
    }

    /// Advertised packet-type aliases.
    ///
    /// Entries that are not text-to-integer are ignored rather than fatal;
    /// a peer advertising garbage aliases simply gets the string forms.
    #[must_use]
    pub fn aliases(&self) -> BTreeMap<String, i64> {
        let mut out = BTreeMap::new();
        if let Some(Value::Map(map)) = self.get("aliases") {
            for (key, value) in map {
                if let (Some(name), Some(alias)) = (key.as_text(), value.as_int()) {
                    out.insert(name.to_owned(), alias);
                }
            }
        }
        out
    }

    /// Advertise packet-type aliases.
    pub fn set_aliases(&mut self, aliases: &BTreeMap<String, i64>) {
        let map = aliases
            .iter()
            .map(|(name, alias)| (Value::text(name.clone()), Value::Int(*alias)))
            .collect::<BTreeMap<_, _>>();
        self.insert("aliases", Value::Map(map));
    }

    /// Peer accepts lz4-compressed payloads.
    #[must_use]
    pub fn lz4(&self) -> bool {
        self.get("lz4").and_then(Value::as_bool).unwrap_or(false)
    }

    /// Peer accepts brotli-compressed payloads.
    #[must_use]
    pub fn brotli(&self) -> bool {
        self.get("brotli").and_then(Value::as_bool).unwrap_or(false)
    }

    /// Advertise the compressors this side can decompress.
    pub fn set_compression(&mut self, lz4: bool, brotli: bool) {
        self.insert("lz4", Value::Bool(lz4));
        self.insert("brotli", Value::Bool(brotli));
    }

    /// Challenge response carried by a retried `hello`.
    #[must_use]
    pub fn challenge_response(&self) -> Option<&str> {
        self.get("challenge_response").and_then(Value::as_text)
    }

    /// Attach a challenge response to this `hello`.
    pub fn set_challenge_response(&mut self, response: impl Into<String>) {
        self.insert("challenge_response", Value::text(response));
    }

    /// Advertise this side's cipher parameters.
    pub fn set_cipher(&mut self, spec: &CipherSpec) {
        self.insert("cipher", Value::text("AES"));
        self.insert("cipher.mode", Value::text(spec.mode.name()));
        self.insert("cipher.key_salt", Value::bytes(spec.key_salt.clone()));
        self.insert("cipher.key_hash", Value::text(spec.key_hash.name()));
        self.insert("cipher.key_stretch_iterations", Value::Int(i64::from(spec.iterations)));
        self.insert("cipher.key_size", Value::Int(spec.key_size as i64));
        self.insert("cipher.padding", Value::text("PKCS#7"));
        if let Some(iv) = &spec.iv {
            self.insert("cipher.iv", Value::bytes(iv.clone()));
        }
    }

    /// Cipher parameters advertised by this map, if any.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::Auth`] when a `cipher` key is present but the
    /// parameter family is incomplete or unusable — a peer that claims
    /// encryption and cannot be decrypted must not slip through as
    /// cleartext.
    pub fn cipher(&self) -> Result<Option<CipherSpec>> {
        let Some(algo) = self.get("cipher").and_then(Value::as_text) else {
            return Ok(None);
        };
        if !algo.eq_ignore_ascii_case("AES") {
            return Err(ConnectionError::Auth(format!("unsupported cipher '{algo}'")));
        }

        let mode = self
            .get("cipher.mode")
            .and_then(Value::as_text)
            .ok_or_else(|| ConnectionError::Auth("cipher.mode missing".into()))?;
        let mode = CipherMode::parse(mode)?;

        let key_salt = self
            .get("cipher.key_salt")
            .and_then(Value::as_bytes)
            .ok_or_else(|| ConnectionError::Auth("cipher.key_salt missing".into()))?
            .to_vec();

        let key_hash = match self.get("cipher.key_hash").and_then(Value::as_text) {
            Some(name) => KeyHash::parse(name)?,
            None => KeyHash::Sha1,
        };

        let iterations = match self.get("cipher.key_stretch_iterations").and_then(Value::as_int) {
            Some(n) => u32::try_from(n).map_err(|_| {
                ConnectionError::Auth(format!("cipher.key_stretch_iterations {n} out of range"))
            })?,
            None => DEFAULT_ITERATIONS,
        };

        let key_size = match self.get("cipher.key_size").and_then(Value::as_int) {
            Some(n) => usize::try_from(n)
                .map_err(|_| ConnectionError::Auth(format!("cipher.key_size {n} out of range")))?,
            None => DEFAULT_KEY_SIZE,
        };

        if let Some(padding) = self.get("cipher.padding").and_then(Value::as_text) {
            if padding != "PKCS#7" {
                return Err(ConnectionError::Auth(format!("unsupported padding '{padding}'")));
            }
        }

        let iv = self.get("cipher.iv").and_then(Value::as_bytes).map(|iv| iv.to_vec());
        if mode.needs_stream_iv() && iv.is_none() {
            return Err(ConnectionError::Auth("CTR mode advertised without cipher.iv".into()));
        }

        Ok(Some(CipherSpec { mode, key_salt, key_hash, iterations, key_size, iv }))
    }
}
