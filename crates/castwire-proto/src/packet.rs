//! The logical packet model.
//!
//! A packet is an ordered list of values whose first item names the packet
//! type; the rest are arguments. On the wire the type may travel as a small
//! integer alias after `hello`, but handlers always observe the string
//! form — alias resolution happens before a [`Packet`] is constructed.
//!
//! Argument access goes through the typed accessors, which turn arity and
//! type mismatches into uniform [`ProtocolError::MalformedPayload`] errors
//! so that subsystem handlers do not have to hand-roll validation.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::{
    errors::{ProtocolError, Result},
    rencode::Value,
};

/// A decoded packet: type string plus arguments.
///
/// Chunk substitution happens on the full wire item list before this is
/// built, so argument `i` here is wire position `i + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    packet_type: String,
    args: Vec<Value>,
}

impl Packet {
    /// Build a packet from its type and arguments.
    pub fn new(packet_type: impl Into<String>, args: Vec<Value>) -> Self {
        Self { packet_type: packet_type.into(), args }
    }

    /// The packet-type string.
    #[must_use]
    pub fn packet_type(&self) -> &str {
        &self.packet_type
    }

    /// All arguments.
    #[must_use]
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Number of arguments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// Packet has no arguments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Argument at `index`, validating arity.
    pub fn arg(&self, index: usize) -> Result<&Value> {
        self.args.get(index).ok_or_else(|| {
            ProtocolError::payload(
                0,
                format!(
                    "packet '{}' has {} arguments, wanted index {index}",
                    self.packet_type,
                    self.args.len()
                ),
            )
        })
    }

    /// Integer argument at `index`.
    pub fn arg_int(&self, index: usize) -> Result<i64> {
        let value = self.arg(index)?;
        value.as_int().ok_or_else(|| self.type_mismatch(index, "int", value))
    }

    /// Boolean argument at `index`.
    pub fn arg_bool(&self, index: usize) -> Result<bool> {
        let value = self.arg(index)?;
        value.as_bool().ok_or_else(|| self.type_mismatch(index, "bool", value))
    }

    /// Text argument at `index`.
    pub fn arg_text(&self, index: usize) -> Result<&str> {
        let value = self.arg(index)?;
        value.as_text().ok_or_else(|| self.type_mismatch(index, "text", value))
    }

    /// Byte-string argument at `index`.
    pub fn arg_bytes(&self, index: usize) -> Result<&Bytes> {
        let value = self.arg(index)?;
        value.as_bytes().ok_or_else(|| self.type_mismatch(index, "bytes", value))
    }

    /// Sequence argument at `index`.
    pub fn arg_seq(&self, index: usize) -> Result<&[Value]> {
        let value = self.arg(index)?;
        value.as_list().ok_or_else(|| self.type_mismatch(index, "list", value))
    }

    /// Mapping argument at `index`.
    pub fn arg_map(&self, index: usize) -> Result<&BTreeMap<Value, Value>> {
        let value = self.arg(index)?;
        value.as_map().ok_or_else(|| self.type_mismatch(index, "map", value))
    }

    /// Turn this packet into its wire item list.
    ///
    /// With `alias` set, the type travels as that integer instead of the
    /// string form.
    #[must_use]
    pub fn into_items(self, alias: Option<i64>) -> Vec<Value> {
        let type_item = match alias {
            Some(n) => Value::Int(n),
            None => Value::Text(self.packet_type),
        };
        let mut items = Vec::with_capacity(self.args.len() + 1);
        items.push(type_item);
        items.extend(self.args);
        items
    }

    fn type_mismatch(&self, index: usize, wanted: &str, got: &Value) -> ProtocolError {
        ProtocolError::payload(
            0,
            format!(
                "packet '{}' argument {index}: expected {wanted}, found {}",
                self.packet_type,
                got.type_name()
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Packet {
        Packet::new(
            "ping",
            vec![Value::Int(42), Value::text("label"), Value::bytes(vec![1u8, 2])],
        )
    }

    #[test]
    fn typed_accessors() {
        let packet = sample();
        assert_eq!(packet.arg_int(0).unwrap(), 42);
        assert_eq!(packet.arg_text(1).unwrap(), "label");
        assert_eq!(packet.arg_bytes(2).unwrap().as_ref(), &[1, 2]);
    }

    #[test]
    fn arity_is_validated() {
        let packet = sample();
        assert!(matches!(
            packet.arg_int(3),
            Err(ProtocolError::MalformedPayload { .. })
        ));
    }

    #[test]
    fn type_mismatch_is_uniform() {
        let packet = sample();
        let err = packet.arg_int(1).unwrap_err();
        assert!(err.to_string().contains("expected int"));
    }

    #[test]
    fn alias_replaces_type_item() {
        let items = sample().into_items(Some(7));
        assert_eq!(items[0], Value::Int(7));
        let items = sample().into_items(None);
        assert_eq!(items[0], Value::text("ping"));
    }
}
