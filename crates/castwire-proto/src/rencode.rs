//! The rencodeplus structural codec.
//!
//! Self-describing binary encoding for heterogeneous value trees: the first
//! byte of every value is a typecode, with small integers, short strings,
//! short lists and small maps folded directly into the typecode byte.
//! Multi-byte integers and floats are big-endian. Long lists and maps are
//! bracketed by `CHR_LIST`/`CHR_DICT` openers and a `CHR_TERM` closer.
//!
//! Text and byte strings are distinct on the wire: text is always UTF-8 and
//! uses the classic string forms; opaque bytes use a dedicated `CHR_BLOB`
//! opener. Decoding the encoding of any supported value yields an equal
//! value.
//!
//! Decoding is strict: every read is bounds-checked, nesting depth is
//! bounded, duplicate map keys are rejected, and trailing bytes after the
//! top-level value are an error.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes};

use crate::errors::{ProtocolError, Result};

/// List opener for lists of 64 elements or more.
pub const CHR_LIST: u8 = 59;
/// Map opener for maps of 25 entries or more.
pub const CHR_DICT: u8 = 60;
/// Arbitrary-precision integer: ASCII decimal terminated by [`CHR_TERM`].
pub const CHR_INT: u8 = 61;
/// 1-byte signed integer.
pub const CHR_INT1: u8 = 62;
/// 2-byte signed big-endian integer.
pub const CHR_INT2: u8 = 63;
/// 4-byte signed big-endian integer.
pub const CHR_INT4: u8 = 64;
/// 8-byte signed big-endian integer.
pub const CHR_INT8: u8 = 65;
/// 4-byte big-endian float. Decoded for compatibility, never emitted.
pub const CHR_FLOAT32: u8 = 66;
/// 8-byte big-endian float.
pub const CHR_FLOAT64: u8 = 44;
/// Boolean true.
pub const CHR_TRUE: u8 = 67;
/// Boolean false.
pub const CHR_FALSE: u8 = 68;
/// The none sentinel.
pub const CHR_NONE: u8 = 69;
/// Terminator for [`CHR_LIST`], [`CHR_DICT`] and [`CHR_INT`].
pub const CHR_TERM: u8 = 127;
/// Opener for opaque byte strings: `CHR_BLOB <decimal-length> ':' <bytes>`.
pub const CHR_BLOB: u8 = 58;

/// First typecode of the embedded positive integer range (`0..=43`).
pub const INT_POS_START: u8 = 0;
/// Number of embedded positive integer typecodes.
pub const INT_POS_COUNT: u8 = 44;
/// First typecode of the embedded negative integer range (`-1..=-32`).
pub const INT_NEG_START: u8 = 70;
/// Number of embedded negative integer typecodes.
pub const INT_NEG_COUNT: u8 = 32;
/// First typecode of the embedded map range (lengths `0..=24`).
pub const DICT_FIXED_START: u8 = 102;
/// Number of embedded map typecodes.
pub const DICT_FIXED_COUNT: u8 = 25;
/// First typecode of the embedded text range (UTF-8 lengths `0..=63`).
pub const STR_FIXED_START: u8 = 128;
/// Number of embedded text typecodes.
pub const STR_FIXED_COUNT: u8 = 64;
/// First typecode of the embedded list range (lengths `0..=63`).
pub const LIST_FIXED_START: u8 = 192;
/// Number of embedded list typecodes.
pub const LIST_FIXED_COUNT: u8 = 64;

/// Maximum characters in a [`CHR_INT`] decimal body.
pub const MAX_INT_DIGITS: usize = 64;

/// Maximum nesting depth accepted by the decoder.
pub const MAX_DEPTH: usize = 100;

/// A single rencodeplus value.
///
/// The packet payload domain: packets are lists of these. `Int` covers the
/// native 64-bit range; `BigInt` carries the arbitrary-precision decimal
/// tail (bounded to i128 — the 64-character wire form is rejected if it
/// overflows that). The decoder folds any integer that fits into `Int`, and
/// numeric comparison treats `Int` and `BigInt` as one domain, so round
/// trips are equality-preserving.
#[derive(Debug, Clone)]
pub enum Value {
    /// Signed integer in the native 64-bit range.
    Int(i64),
    /// Integer outside the 64-bit range.
    BigInt(i128),
    /// Boolean.
    Bool(bool),
    /// The absence sentinel.
    None,
    /// 64-bit float.
    F64(f64),
    /// Opaque byte string.
    Bytes(Bytes),
    /// UTF-8 text.
    Text(String),
    /// Ordered sequence of values.
    List(Vec<Value>),
    /// Mapping with unique keys and deterministic (sorted) iteration.
    Map(BTreeMap<Value, Value>),
}

impl Value {
    /// Build a text value.
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Build a byte-string value.
    pub fn bytes(b: impl Into<Bytes>) -> Self {
        Self::Bytes(b.into())
    }

    /// Build an integer value, folding into the native range when possible.
    #[must_use]
    pub fn int(i: i128) -> Self {
        match i64::try_from(i) {
            Ok(v) => Self::Int(v),
            Err(_) => Self::BigInt(i),
        }
    }

    /// Numeric view of `Int`/`BigInt`. `None` for other variants.
    #[must_use]
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Self::Int(i) => Some(i128::from(*i)),
            Self::BigInt(i) => Some(*i),
            _ => None,
        }
    }

    /// Integer in the native range. `None` for other variants or overflow.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        self.as_i128().and_then(|i| i64::try_from(i).ok())
    }

    /// Boolean view. `None` for other variants.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Text view. `None` for other variants.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Byte-string view. `None` for other variants.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// List view. `None` for other variants.
    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Map view. `None` for other variants.
    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<Value, Value>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Look up a text key in a map value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|map| map.get(&Value::text(key)))
    }

    /// Human-readable name of the variant, for error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Int(_) | Self::BigInt(_) => "int",
            Self::Bool(_) => "bool",
            Self::None => "none",
            Self::F64(_) => "float",
            Self::Bytes(_) => "bytes",
            Self::Text(_) => "text",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    /// Serialize this value into `dst`.
    pub fn encode(&self, dst: &mut impl BufMut) {
        match self {
            Self::Int(i) => encode_int(i128::from(*i), dst),
            Self::BigInt(i) => encode_int(*i, dst),
            Self::Bool(true) => dst.put_u8(CHR_TRUE),
            Self::Bool(false) => dst.put_u8(CHR_FALSE),
            Self::None => dst.put_u8(CHR_NONE),
            Self::F64(f) => {
                dst.put_u8(CHR_FLOAT64);
                dst.put_slice(&f.to_be_bytes());
            },
            Self::Bytes(b) => {
                dst.put_u8(CHR_BLOB);
                dst.put_slice(b.len().to_string().as_bytes());
                dst.put_u8(b':');
                dst.put_slice(b);
            },
            Self::Text(s) => {
                let utf8 = s.as_bytes();
                if utf8.len() < STR_FIXED_COUNT as usize {
                    dst.put_u8(STR_FIXED_START + utf8.len() as u8);
                    dst.put_slice(utf8);
                } else {
                    dst.put_slice(utf8.len().to_string().as_bytes());
                    dst.put_u8(b':');
                    dst.put_slice(utf8);
                }
            },
            Self::List(items) => {
                if items.len() < LIST_FIXED_COUNT as usize {
                    dst.put_u8(LIST_FIXED_START + items.len() as u8);
                    for item in items {
                        item.encode(dst);
                    }
                } else {
                    dst.put_u8(CHR_LIST);
                    for item in items {
                        item.encode(dst);
                    }
                    dst.put_u8(CHR_TERM);
                }
            },
            Self::Map(map) => {
                if map.len() < DICT_FIXED_COUNT as usize {
                    dst.put_u8(DICT_FIXED_START + map.len() as u8);
                    for (key, value) in map {
                        key.encode(dst);
                        value.encode(dst);
                    }
                } else {
                    dst.put_u8(CHR_DICT);
                    for (key, value) in map {
                        key.encode(dst);
                        value.encode(dst);
                    }
                    dst.put_u8(CHR_TERM);
                }
            },
        }
    }

    /// Serialize this value into a fresh buffer.
    #[must_use]
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }

    /// Decode exactly one value from `bytes`.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::MalformedPayload`] on unknown typecodes, truncation,
    /// invalid UTF-8 in text, duplicate map keys, excessive nesting, or
    /// trailing bytes after the value.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut decoder = Decoder { buf: bytes, pos: 0 };
        let value = decoder.value(0)?;
        if decoder.pos != bytes.len() {
            return Err(ProtocolError::payload(
                decoder.pos,
                format!("{} trailing bytes after value", bytes.len() - decoder.pos),
            ));
        }
        Ok(value)
    }

    /// Decode a top-level list, as used for main packet payloads.
    ///
    /// # Errors
    ///
    /// As [`Value::decode`], plus [`ProtocolError::MalformedPayload`] when
    /// the top-level value is not a list.
    pub fn decode_list(bytes: &[u8]) -> Result<Vec<Self>> {
        match Self::decode(bytes)? {
            Self::List(items) => Ok(items),
            other => Err(ProtocolError::payload(
                0,
                format!("expected a packet list, found {}", other.type_name()),
            )),
        }
    }
}

fn encode_int(i: i128, dst: &mut impl BufMut) {
    if (0..i128::from(INT_POS_COUNT)).contains(&i) {
        dst.put_u8(INT_POS_START + i as u8);
    } else if (-i128::from(INT_NEG_COUNT)..0).contains(&i) {
        dst.put_u8(INT_NEG_START + (-1 - i) as u8);
    } else if let Ok(v) = i8::try_from(i) {
        dst.put_u8(CHR_INT1);
        dst.put_i8(v);
    } else if let Ok(v) = i16::try_from(i) {
        dst.put_u8(CHR_INT2);
        dst.put_i16(v);
    } else if let Ok(v) = i32::try_from(i) {
        dst.put_u8(CHR_INT4);
        dst.put_i32(v);
    } else if let Ok(v) = i64::try_from(i) {
        dst.put_u8(CHR_INT8);
        dst.put_i64(v);
    } else {
        dst.put_u8(CHR_INT);
        dst.put_slice(i.to_string().as_bytes());
        dst.put_u8(CHR_TERM);
    }
}

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn take(&mut self) -> Result<u8> {
        let byte = *self.buf.get(self.pos).ok_or(ProtocolError::UnexpectedEof {
            expected: self.pos + 1,
            actual: self.buf.len(),
        })?;
        self.pos += 1;
        Ok(byte)
    }

    fn slice(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or_else(|| {
            ProtocolError::payload(self.pos, "length overflows the address space")
        })?;
        let slice = self.buf.get(self.pos..end).ok_or(ProtocolError::UnexpectedEof {
            expected: end,
            actual: self.buf.len(),
        })?;
        self.pos = end;
        Ok(slice)
    }

    fn value(&mut self, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(ProtocolError::payload(self.pos, "nesting too deep"));
        }

        let start = self.pos;
        let typecode = self.take()?;
        match typecode {
            _ if typecode < INT_POS_START + INT_POS_COUNT => {
                Ok(Value::Int(i64::from(typecode - INT_POS_START)))
            },
            _ if (INT_NEG_START..INT_NEG_START + INT_NEG_COUNT).contains(&typecode) => {
                Ok(Value::Int(-1 - i64::from(typecode - INT_NEG_START)))
            },
            CHR_INT1 => {
                let bytes = self.slice(1)?;
                Ok(Value::Int(i64::from(bytes[0] as i8)))
            },
            CHR_INT2 => {
                let bytes = self.slice(2)?;
                Ok(Value::Int(i64::from(i16::from_be_bytes([bytes[0], bytes[1]]))))
            },
            CHR_INT4 => {
                let bytes = self.slice(4)?;
                Ok(Value::Int(i64::from(i32::from_be_bytes([
                    bytes[0], bytes[1], bytes[2], bytes[3],
                ]))))
            },
            CHR_INT8 => {
                let bytes = self.slice(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                Ok(Value::Int(i64::from_be_bytes(raw)))
            },
            CHR_INT => self.decimal_int(start),
            CHR_FLOAT64 => {
                let bytes = self.slice(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                Ok(Value::F64(f64::from_be_bytes(raw)))
            },
            CHR_FLOAT32 => {
                let bytes = self.slice(4)?;
                let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
                Ok(Value::F64(f64::from(f32::from_be_bytes(raw))))
            },
            CHR_TRUE => Ok(Value::Bool(true)),
            CHR_FALSE => Ok(Value::Bool(false)),
            CHR_NONE => Ok(Value::None),
            CHR_BLOB => {
                let len = self.decimal_length()?;
                let bytes = self.slice(len)?;
                Ok(Value::Bytes(Bytes::copy_from_slice(bytes)))
            },
            _ if (STR_FIXED_START..STR_FIXED_START + STR_FIXED_COUNT).contains(&typecode) => {
                let len = usize::from(typecode - STR_FIXED_START);
                self.text(len, start)
            },
            b'1'..=b'9' => {
                let len = self.long_length(typecode)?;
                self.text(len, start)
            },
            _ if typecode >= LIST_FIXED_START => {
                let count = usize::from(typecode - LIST_FIXED_START);
                let mut items = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    items.push(self.value(depth + 1)?);
                }
                Ok(Value::List(items))
            },
            CHR_LIST => {
                let mut items = Vec::new();
                while self.peek()? != CHR_TERM {
                    items.push(self.value(depth + 1)?);
                }
                self.pos += 1;
                Ok(Value::List(items))
            },
            _ if (DICT_FIXED_START..DICT_FIXED_START + DICT_FIXED_COUNT).contains(&typecode) => {
                let count = usize::from(typecode - DICT_FIXED_START);
                let mut map = BTreeMap::new();
                for _ in 0..count {
                    self.map_entry(&mut map, depth)?;
                }
                Ok(Value::Map(map))
            },
            CHR_DICT => {
                let mut map = BTreeMap::new();
                while self.peek()? != CHR_TERM {
                    self.map_entry(&mut map, depth)?;
                }
                self.pos += 1;
                Ok(Value::Map(map))
            },
            other => Err(ProtocolError::payload(start, format!("unknown typecode {other}"))),
        }
    }

    fn peek(&self) -> Result<u8> {
        self.buf.get(self.pos).copied().ok_or(ProtocolError::UnexpectedEof {
            expected: self.pos + 1,
            actual: self.buf.len(),
        })
    }

    fn map_entry(&mut self, map: &mut BTreeMap<Value, Value>, depth: usize) -> Result<()> {
        let key_start = self.pos;
        let key = self.value(depth + 1)?;
        let value = self.value(depth + 1)?;
        if map.insert(key, value).is_some() {
            return Err(ProtocolError::payload(key_start, "duplicate map key"));
        }
        Ok(())
    }

    fn text(&mut self, len: usize, start: usize) -> Result<Value> {
        let bytes = self.slice(len)?;
        let text = std::str::from_utf8(bytes)
            .map_err(|_| ProtocolError::payload(start, "text is not valid UTF-8"))?;
        Ok(Value::Text(text.to_owned()))
    }

    /// Parse the decimal body of a [`CHR_INT`] value up to [`CHR_TERM`].
    fn decimal_int(&mut self, start: usize) -> Result<Value> {
        let digits_start = self.pos;
        loop {
            let byte = self.take()?;
            if byte == CHR_TERM {
                break;
            }
            let is_sign = byte == b'-' && self.pos == digits_start + 1;
            if !byte.is_ascii_digit() && !is_sign {
                return Err(ProtocolError::payload(start, "invalid character in integer body"));
            }
        }
        let body = &self.buf[digits_start..self.pos - 1];
        if body.is_empty() || body == b"-" {
            return Err(ProtocolError::payload(start, "empty integer body"));
        }
        if body.len() > MAX_INT_DIGITS {
            return Err(ProtocolError::payload(start, "integer body exceeds 64 characters"));
        }
        // Charset was validated above, so from_utf8 cannot fail; parse only
        // rejects overflow past i128.
        let text = std::str::from_utf8(body)
            .map_err(|_| ProtocolError::payload(start, "invalid integer body"))?;
        let parsed: i128 = text
            .parse()
            .map_err(|_| ProtocolError::payload(start, "integer overflows 128 bits"))?;
        Ok(Value::int(parsed))
    }

    /// Parse `<digits> ':'` for a blob length. A bare `0:` is the empty
    /// blob; other leading zeroes are rejected.
    fn decimal_length(&mut self) -> Result<usize> {
        let start = self.pos;
        let first = self.take()?;
        if first == b'0' {
            return match self.take()? {
                b':' => Ok(0),
                _ => Err(ProtocolError::payload(start, "length has a leading zero")),
            };
        }
        if !first.is_ascii_digit() {
            return Err(ProtocolError::payload(start, "length is not a decimal number"));
        }
        self.long_length(first)
    }

    /// Parse the remainder of a decimal length whose first digit was the
    /// typecode byte, up to the `':'` separator.
    fn long_length(&mut self, first: u8) -> Result<usize> {
        let start = self.pos - 1;
        let mut len = usize::from(first - b'0');
        loop {
            let byte = self.take()?;
            match byte {
                b'0'..=b'9' => {
                    len = len
                        .checked_mul(10)
                        .and_then(|n| n.checked_add(usize::from(byte - b'0')))
                        .ok_or_else(|| ProtocolError::payload(start, "length overflows"))?;
                },
                b':' => return Ok(len),
                _ => {
                    return Err(ProtocolError::payload(
                        start,
                        "length is not terminated by ':'",
                    ));
                },
            }
        }
    }
}

/// Total order over value kinds: none < bool < int < float < bytes < text
/// < list < map, with `Int`/`BigInt` compared numerically as one domain and
/// floats ordered by `total_cmp`. This is what makes `Value` usable as a
/// deterministic map key.
impl Ord for Value {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use std::cmp::Ordering;

        fn rank(value: &Value) -> u8 {
            match value {
                Value::None => 0,
                Value::Bool(_) => 1,
                Value::Int(_) | Value::BigInt(_) => 2,
                Value::F64(_) => 3,
                Value::Bytes(_) => 4,
                Value::Text(_) => 5,
                Value::List(_) => 6,
                Value::Map(_) => 7,
            }
        }

        match (self, other) {
            (Self::None, Self::None) => Ordering::Equal,
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int(_) | Self::BigInt(_), Self::Int(_) | Self::BigInt(_)) => {
                // as_i128 is Some for both by construction
                self.as_i128().cmp(&other.as_i128())
            },
            (Self::F64(a), Self::F64(b)) => a.total_cmp(b),
            (Self::Bytes(a), Self::Bytes(b)) => a.cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::List(a), Self::List(b)) => a.cmp(b),
            (Self::Map(a), Self::Map(b)) => a.cmp(b),
            _ => rank(self).cmp(&rank(other)),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for Value {}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::F64(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Self::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

impl From<BTreeMap<Value, Value>> for Value {
    fn from(map: BTreeMap<Value, Value>) -> Self {
        Self::Map(map)
    }
}
