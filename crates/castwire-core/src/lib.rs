//! Castwire protocol core.
//!
//! The connection engine of the castwire remote-display protocol: the
//! `hello` handshake with optional challenge-response authentication, the
//! reader/writer task pair over any byte stream, the priority outbound
//! queue, packet-type dispatch with integer aliasing, and the error and
//! lifecycle policy.
//!
//! The wire format itself lives in `castwire-proto`; the AES envelope and
//! key stretching in `castwire-crypto`. This crate ties them to a
//! transport:
//!
//! ```text
//!            send()                           handler
//!              │                                 ▲
//!              ▼                                 │ dispatch
//!      ┌──────────────┐  encode → compress  ┌─────────┐
//!      │ OutboundQueue │ → encrypt → frame  │ Session │
//!      └──────────────┘        │            └─────────┘
//!              │               ▼                 ▲
//!         writer task ──► byte stream ──► reader task
//! ```
//!
//! The core never interprets subsystem payloads; it routes packets by type
//! and hands the decoded argument list to whatever handler registered for
//! it.

pub mod caps;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod queue;
pub mod session;
pub mod stream;

pub use caps::{Capabilities, CipherSpec};
pub use config::ProtocolConfig;
pub use dispatch::{AliasTable, HandlerRegistry, HandlerResult};
pub use engine::{Protocol, ProtocolHandle, ProtocolStats, SendOptions};
pub use error::{ConnectionError, Result};
pub use queue::Priority;
pub use session::{Session, SessionAction, SessionConfig, SessionState};
pub use stream::Bytestream;
