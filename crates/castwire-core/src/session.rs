//! Handshake state machine.
//!
//! Pure state machine with no I/O: inputs are decoded packets, outputs are
//! actions the engine executes (send a control packet, install cipher or
//! alias state, deliver to dispatch, close). This keeps the handshake
//! logic deterministic and directly testable.
//!
//! # State machine
//!
//! ```text
//!            start                    hello accepted
//! ┌─────────┐      ┌────────────┐                      ┌─────────────┐
//! │ Opening │─────>│ HelloSent  │─────────────────────>│ Established │
//! └─────────┘      └────────────┘                      └─────────────┘
//!      │               │    ^                               │
//!      │ peer hello    │ challenge received / resent hello  │ disconnect
//!      │ before start  v    │                               v
//!      │           ┌────────────┐   close/error        ┌─────────┐
//!      └──────────>│ Challenged │────────────────────> │ Closing │──> Closed
//!                  └────────────┘                      └─────────┘
//! ```
//!
//! A side that requires challenge-response authentication defers its own
//! `hello`: it answers the peer's first `hello` with a `challenge` and only
//! sends its capabilities once a valid response arrives.

use std::collections::BTreeMap;

use castwire_crypto::ChallengeDigest;
use castwire_proto::{Packet, Value};
use rand::RngCore;

use crate::{
    caps::{Capabilities, CipherSpec},
    error::ConnectionError,
};

/// The `hello` packet type.
pub const PACKET_HELLO: &str = "hello";
/// The `challenge` packet type.
pub const PACKET_CHALLENGE: &str = "challenge";
/// The `disconnect` packet type.
pub const PACKET_DISCONNECT: &str = "disconnect";

/// Connection state, one copy per side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created; nothing sent yet.
    Opening,
    /// Our `hello` is on the wire; waiting for the peer's.
    HelloSent,
    /// Peer's `hello` accepted before we sent ours.
    HelloReceived,
    /// A challenge is pending resolution (issued or being answered).
    Challenged,
    /// Both directions exchanged valid `hello`s; packets flow to dispatch.
    Established,
    /// Shutting down; only urgent writes drain.
    Closing,
    /// Reader and writer have stopped.
    Closed,
}

/// Actions the engine executes on behalf of the machine.
#[derive(Debug)]
pub enum SessionAction {
    /// Send this control packet at urgent priority.
    Send(Packet),
    /// Install the outgoing alias table from the peer's `hello.aliases`.
    InstallAliasesOut(BTreeMap<String, i64>),
    /// Peer will encrypt its packets with these parameters; build the
    /// reader-side decryptor.
    InstallDecryptor(CipherSpec),
    /// Handshake is complete in both directions; `caps` are the peer's.
    Established(Capabilities),
    /// Hand this packet to dispatch.
    Deliver(Packet),
    /// Tear the connection down. `error` is `None` for an orderly close.
    Close {
        /// Human-readable reason, also used for the `disconnect` packet.
        reason: String,
        /// The fatal error, when the close is not orderly.
        error: Option<ConnectionError>,
    },
}

/// Handshake configuration, fixed at construction.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Capabilities advertised in our `hello`.
    pub local_caps: Capabilities,
    /// Shared secret for answering and verifying challenges.
    pub password: Option<Vec<u8>>,
    /// When set, this side demands challenge-response authentication with
    /// the given digest before accepting any `hello`.
    pub require_challenge: Option<ChallengeDigest>,
    /// Additional `hello` attempts tolerated before `AuthFailed`.
    pub retry_limit: u8,
}

/// The handshake state machine for one side of a connection.
#[derive(Debug)]
pub struct Session {
    state: SessionState,
    config: SessionConfig,
    /// Salt of the challenge we issued, awaiting its response.
    issued_salt: Option<Vec<u8>>,
    /// Challenges this side has answered.
    challenges_answered: u8,
    /// Additional `hello` attempts received while gatekeeping.
    hello_attempts: u8,
    hello_sent: bool,
    peer_authenticated: bool,
    decryptor_installed: bool,
    /// Peer capabilities accepted before our own hello went out.
    peer_caps: Option<Capabilities>,
}

impl Session {
    /// New machine in [`SessionState::Opening`].
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            state: SessionState::Opening,
            config,
            issued_salt: None,
            challenges_answered: 0,
            hello_attempts: 0,
            hello_sent: false,
            peer_authenticated: false,
            decryptor_installed: false,
            peer_caps: None,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Begin the handshake.
    ///
    /// A side without an authentication requirement sends its `hello`
    /// immediately; a gatekeeper waits for the peer's `hello` and
    /// challenges it instead.
    pub fn start(&mut self) -> Vec<SessionAction> {
        if self.config.require_challenge.is_some() {
            // hello deferred until the peer authenticates
            return Vec::new();
        }
        let mut actions = vec![SessionAction::Send(self.hello_packet(None))];
        self.hello_sent = true;
        match self.state {
            SessionState::Opening => self.state = SessionState::HelloSent,
            SessionState::HelloReceived => {
                self.state = SessionState::Established;
                if let Some(caps) = self.peer_caps.take() {
                    actions.push(SessionAction::Established(caps));
                }
            },
            _ => {},
        }
        actions
    }

    /// Feed one decoded packet through the machine.
    pub fn handle_packet(&mut self, packet: Packet) -> Vec<SessionAction> {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return Vec::new();
        }
        match packet.packet_type() {
            PACKET_HELLO => self.on_hello(&packet),
            PACKET_CHALLENGE => self.on_challenge(&packet),
            PACKET_DISCONNECT => self.on_disconnect(&packet),
            _ if self.state == SessionState::Established => {
                vec![SessionAction::Deliver(packet)]
            },
            other => self.fail(ConnectionError::UnexpectedPacket {
                state: self.state,
                packet_type: other.to_owned(),
            }),
        }
    }

    /// Locally requested orderly close. Idempotent.
    pub fn close(&mut self, reason: &str) -> Vec<SessionAction> {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return Vec::new();
        }
        self.state = SessionState::Closing;
        vec![
            SessionAction::Send(Packet::new(
                PACKET_DISCONNECT,
                vec![Value::text(reason)],
            )),
            SessionAction::Close { reason: reason.to_owned(), error: None },
        ]
    }

    /// Mark the connection fully stopped.
    pub fn mark_closed(&mut self) {
        self.state = SessionState::Closed;
    }

    fn on_hello(&mut self, packet: &Packet) -> Vec<SessionAction> {
        let caps = match packet.arg(0).map_err(ConnectionError::from).and_then(Capabilities::from_value) {
            Ok(caps) => caps,
            Err(err) => return self.fail(err),
        };

        let mut actions = Vec::new();

        // The peer's cipher parameters apply to everything it sends after
        // this hello, including a retried hello — install them before any
        // authentication verdict, and only once.
        if !self.decryptor_installed {
            match caps.cipher() {
                Ok(Some(spec)) => {
                    self.decryptor_installed = true;
                    actions.push(SessionAction::InstallDecryptor(spec));
                },
                Ok(None) => {},
                Err(err) => {
                    actions.extend(self.fail(err));
                    return actions;
                },
            }
        }

        if let Some(digest) = self.config.require_challenge {
            if !self.peer_authenticated {
                let issued_salt = self.issued_salt.clone();
                match (caps.challenge_response(), issued_salt) {
                    (Some(response), Some(salt)) => {
                        let password = self.config.password.clone().unwrap_or_default();
                        if digest.verify(&password, &salt, response) {
                            self.peer_authenticated = true;
                        } else {
                            actions.extend(self.rechallenge(digest, "challenge response rejected"));
                            return actions;
                        }
                    },
                    _ => {
                        actions.extend(self.rechallenge(digest, "authentication required"));
                        return actions;
                    },
                }
            }
        }

        actions.extend(self.accept_hello(&caps));
        actions
    }

    fn rechallenge(&mut self, digest: ChallengeDigest, why: &str) -> Vec<SessionAction> {
        self.hello_attempts += 1;
        if self.hello_attempts > self.config.retry_limit {
            return self.fail(ConnectionError::Auth(format!(
                "{why} after {} hello attempts",
                self.hello_attempts
            )));
        }
        let mut salt = vec![0u8; castwire_crypto::SALT_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        self.issued_salt = Some(salt.clone());
        self.state = SessionState::Challenged;
        vec![SessionAction::Send(Packet::new(
            PACKET_CHALLENGE,
            vec![Value::bytes(salt), Value::text(digest.name())],
        ))]
    }

    fn accept_hello(&mut self, caps: &Capabilities) -> Vec<SessionAction> {
        if caps.version().is_none() {
            return self.fail(ConnectionError::Auth("hello is missing a version".into()));
        }

        let mut actions = Vec::new();
        let aliases = caps.aliases();
        if !aliases.is_empty() {
            actions.push(SessionAction::InstallAliasesOut(aliases));
        }

        if self.hello_sent {
            self.state = SessionState::Established;
            actions.push(SessionAction::Established(caps.clone()));
        } else if self.config.require_challenge.is_some() {
            // Gatekeeper: the peer is authenticated, release our deferred
            // hello and complete the handshake.
            actions.push(SessionAction::Send(self.hello_packet(None)));
            self.hello_sent = true;
            self.state = SessionState::Established;
            actions.push(SessionAction::Established(caps.clone()));
        } else {
            // Peer beat us to it; hold its capabilities until start().
            self.state = SessionState::HelloReceived;
            self.peer_caps = Some(caps.clone());
        }
        actions
    }

    fn on_challenge(&mut self, packet: &Packet) -> Vec<SessionAction> {
        let Some(password) = self.config.password.clone() else {
            return self.fail(ConnectionError::Auth(
                "peer demands authentication but no password is configured".into(),
            ));
        };

        self.challenges_answered += 1;
        if self.challenges_answered > self.config.retry_limit {
            return self.fail(ConnectionError::Auth(format!(
                "peer rejected {} challenge responses",
                self.config.retry_limit
            )));
        }

        let parsed = packet
            .arg_bytes(0)
            .map_err(ConnectionError::from)
            .and_then(|salt| {
                let digest = ChallengeDigest::parse(packet.arg_text(1)?)?;
                Ok((salt.to_vec(), digest))
            });
        let (salt, digest) = match parsed {
            Ok(pair) => pair,
            Err(err) => return self.fail(err),
        };

        let response = digest.respond(&password, &salt);
        self.state = SessionState::Challenged;
        self.hello_sent = true;
        vec![SessionAction::Send(self.hello_packet(Some(response)))]
    }

    fn on_disconnect(&mut self, packet: &Packet) -> Vec<SessionAction> {
        let reason = packet
            .arg_text(0)
            .map(str::to_owned)
            .unwrap_or_else(|_| "peer disconnected".to_owned());
        self.state = SessionState::Closing;
        vec![SessionAction::Close { reason, error: None }]
    }

    fn fail(&mut self, error: ConnectionError) -> Vec<SessionAction> {
        let reason = error.disconnect_reason();
        self.state = SessionState::Closing;
        vec![
            SessionAction::Send(Packet::new(
                PACKET_DISCONNECT,
                vec![Value::text(reason.clone())],
            )),
            SessionAction::Close { reason, error: Some(error) },
        ]
    }

    fn hello_packet(&self, challenge_response: Option<String>) -> Packet {
        let mut caps = self.config.local_caps.clone();
        if let Some(response) = challenge_response {
            caps.set_challenge_response(response);
        }
        Packet::new(PACKET_HELLO, vec![caps.to_value()])
    }
}
