//! Packet-type dispatch and alias tables.
//!
//! Subsystems register handlers by packet-type string before the connection
//! starts; the reader task routes every established-state packet through
//! the registry. Unknown packet types are logged and discarded — never
//! fatal. A handler failure, on the other hand, is a local error and tears
//! the connection down.
//!
//! Dispatch is serialised on the reader task: at most one handler runs at a
//! time per connection. A handler registered as reentrant is spawned onto
//! the runtime instead, and its failures are logged rather than propagated.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use castwire_proto::Packet;
use tracing::{error, warn};

use crate::error::{ConnectionError, Result};

/// What a handler reports back: `Err` is a local error and closes the
/// connection.
pub type HandlerResult = std::result::Result<(), String>;

/// A packet handler. Receives the decoded packet with its string-form type,
/// regardless of how the type travelled on the wire.
pub type Handler = Arc<dyn Fn(Packet) -> HandlerResult + Send + Sync>;

struct Entry {
    handler: Handler,
    reentrant: bool,
}

/// Registry mapping packet-type strings to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Entry>,
    sealed: bool,
}

impl HandlerRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `packet_type`.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::Local`] when the connection has already started
    /// or the type already has a handler.
    pub fn register(
        &mut self,
        packet_type: &str,
        handler: impl Fn(Packet) -> HandlerResult + Send + Sync + 'static,
    ) -> Result<()> {
        self.insert(packet_type, Arc::new(handler), false)
    }

    /// Register a handler that may run concurrently with later dispatches.
    ///
    /// Reentrant handlers are spawned onto the runtime; their failures are
    /// logged, not fatal.
    pub fn register_reentrant(
        &mut self,
        packet_type: &str,
        handler: impl Fn(Packet) -> HandlerResult + Send + Sync + 'static,
    ) -> Result<()> {
        self.insert(packet_type, Arc::new(handler), true)
    }

    fn insert(&mut self, packet_type: &str, handler: Handler, reentrant: bool) -> Result<()> {
        if self.sealed {
            return Err(ConnectionError::Local {
                packet_type: packet_type.to_owned(),
                reason: "handlers must be registered before the connection starts".into(),
            });
        }
        if self.handlers.contains_key(packet_type) {
            return Err(ConnectionError::Local {
                packet_type: packet_type.to_owned(),
                reason: "a handler is already registered for this type".into(),
            });
        }
        self.handlers.insert(packet_type.to_owned(), Entry { handler, reentrant });
        Ok(())
    }

    /// Freeze the registry; called when the connection starts.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Route one packet. Order of dispatch equals order of arrival.
    pub fn dispatch(&self, packet: Packet) -> Result<()> {
        let Some(entry) = self.handlers.get(packet.packet_type()) else {
            warn!(packet_type = packet.packet_type(), "discarding unknown packet type");
            return Ok(());
        };

        if entry.reentrant {
            let handler = Arc::clone(&entry.handler);
            tokio::spawn(async move {
                let packet_type = packet.packet_type().to_owned();
                if let Err(reason) = handler(packet) {
                    error!(packet_type = %packet_type, reason = %reason, "reentrant handler failed");
                }
            });
            return Ok(());
        }

        let packet_type = packet.packet_type().to_owned();
        entry.handler.as_ref()(packet)
            .map_err(|reason| ConnectionError::Local { packet_type, reason })
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.handlers.len())
            .field("sealed", &self.sealed)
            .finish()
    }
}

/// Bidirectional packet-type alias table.
///
/// Installed exactly once per direction and immutable afterwards: the
/// aliases a side advertises in its `hello` bind for the lifetime of the
/// connection.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    by_name: HashMap<String, i64>,
    by_number: HashMap<i64, String>,
}

impl AliasTable {
    /// Build a table from an `aliases` capability map.
    #[must_use]
    pub fn from_map(aliases: &BTreeMap<String, i64>) -> Self {
        let mut table = Self::default();
        for (name, number) in aliases {
            table.by_name.insert(name.clone(), *number);
            table.by_number.insert(*number, name.clone());
        }
        table
    }

    /// Alias for an outgoing packet-type string, when the peer knows one.
    #[must_use]
    pub fn number_for(&self, name: &str) -> Option<i64> {
        self.by_name.get(name).copied()
    }

    /// Packet-type string for a received alias.
    #[must_use]
    pub fn name_for(&self, number: i64) -> Option<&str> {
        self.by_number.get(&number).map(String::as_str)
    }

    /// Number of aliased types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Table has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use castwire_proto::Value;

    use super::*;

    #[test]
    fn dispatch_invokes_registered_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        let seen = Arc::clone(&calls);
        registry
            .register("ping", move |packet| {
                assert_eq!(packet.arg_int(0), Ok(42));
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        registry.seal();

        registry.dispatch(Packet::new("ping", vec![Value::Int(42)])).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_type_is_discarded_not_fatal() {
        let registry = HandlerRegistry::new();
        assert!(registry.dispatch(Packet::new("mystery", vec![])).is_ok());
    }

    #[test]
    fn handler_error_is_local_error() {
        let mut registry = HandlerRegistry::new();
        registry.register("bad", |_| Err("boom".to_string())).unwrap();

        let err = registry.dispatch(Packet::new("bad", vec![])).unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Local { packet_type, reason }
                if packet_type == "bad" && reason == "boom"
        ));
    }

    #[test]
    fn registration_after_seal_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.seal();
        assert!(registry.register("late", |_| Ok(())).is_err());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register("ping", |_| Ok(())).unwrap();
        assert!(registry.register("ping", |_| Ok(())).is_err());
    }

    #[test]
    fn dispatch_order_equals_arrival_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        let seen = Arc::clone(&order);
        registry
            .register("seq", move |packet| {
                seen.lock().unwrap().push(packet.arg_int(0).unwrap_or(-1));
                Ok(())
            })
            .unwrap();

        for i in 0..10 {
            registry.dispatch(Packet::new("seq", vec![Value::Int(i)])).unwrap();
        }
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn alias_table_is_bidirectional() {
        let mut map = BTreeMap::new();
        map.insert("ping".to_string(), 1);
        map.insert("pong".to_string(), 2);
        let table = AliasTable::from_map(&map);

        assert_eq!(table.number_for("ping"), Some(1));
        assert_eq!(table.name_for(2), Some("pong"));
        assert_eq!(table.number_for("draw"), None);
        assert_eq!(table.name_for(9), None);
        assert_eq!(table.len(), 2);
    }
}
