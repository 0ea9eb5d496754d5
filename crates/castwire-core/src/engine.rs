//! The protocol engine.
//!
//! One reader task and one writer task per connection, each making
//! independent forward progress over the two halves of the byte stream.
//! The writer drains the priority queue, serialising every packet fully
//! into one contiguous buffer before any bytes reach the stream; the
//! reader runs the header → payload → decrypt → decompress → decode →
//! dispatch pipeline and feeds the handshake machine.
//!
//! Construction is two-phase: [`Protocol`] collects handlers, cipher and
//! authentication configuration, then [`Protocol::start`] seals the
//! registry, spawns the tasks, and hands back a [`ProtocolHandle`] — the
//! only surface subsystems touch afterwards.

use std::{
    collections::BTreeMap,
    ops::ControlFlow,
    sync::{
        Arc, Mutex, OnceLock, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use castwire_crypto::{ChallengeDigest, CipherMode, Decryptor, Encryptor, stretch_key};
use castwire_proto::{
    Chunk, CompressionPolicy, Compressor, Packet, PacketHeader, ProtocolError, Reassembler, Value,
    header::{FLAG_FLUSH, HEADER_SIZE},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::watch,
    time::{Instant, timeout, timeout_at},
};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::{
    caps::{Capabilities, CipherSpec},
    config::ProtocolConfig,
    dispatch::{AliasTable, HandlerRegistry, HandlerResult},
    error::{ConnectionError, Result},
    queue::{OutboundQueue, Priority},
    session::{PACKET_DISCONNECT, PACKET_HELLO, Session, SessionAction, SessionConfig, SessionState},
    stream::Bytestream,
};

/// Options for [`ProtocolHandle::send`].
pub struct SendOptions {
    /// Queue class; defaults to [`Priority::Normal`].
    pub priority: Priority,
    /// Raw chunks emitted ahead of the main packet.
    pub chunks: Vec<Chunk>,
    /// Producer hint: set to `false` for payloads that are already
    /// compressed. Defaults to `true`.
    pub compressible: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl SendOptions {
    /// Default options: normal priority, no chunks, compressible.
    #[must_use]
    pub fn new() -> Self {
        Self { priority: Priority::Normal, chunks: Vec::new(), compressible: true }
    }

    /// Select a queue class.
    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Attach raw chunks.
    #[must_use]
    pub fn chunks(mut self, chunks: Vec<Chunk>) -> Self {
        self.chunks = chunks;
        self
    }

    /// Mark the payload as not worth compressing.
    #[must_use]
    pub fn incompressible(mut self) -> Self {
        self.compressible = false;
        self
    }
}

/// Snapshot of the observable connection state, for tests and diagnostics.
#[derive(Debug, Clone)]
pub struct ProtocolStats {
    /// Current handshake state.
    pub state: SessionState,
    /// Bytes written to the stream, headers included.
    pub bytes_sent: u64,
    /// Bytes read from the stream, headers included.
    pub bytes_received: u64,
    /// Packets fully written.
    pub packets_sent: u64,
    /// Main packets fully decoded.
    pub packets_received: u64,
    /// Packets currently queued outbound.
    pub queue_len: usize,
    /// Cipher protecting the packets this side sends, once active.
    pub cipher_out: Option<CipherMode>,
    /// Cipher protecting the packets the peer sends, once negotiated.
    pub cipher_in: Option<CipherMode>,
    /// The error that terminated the connection, if any.
    pub last_error: Option<ConnectionError>,
}

struct Shared {
    state: watch::Sender<SessionState>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    last_error: Mutex<Option<ConnectionError>>,
    aliases_out: OnceLock<AliasTable>,
    aliases_in: OnceLock<AliasTable>,
    compression: OnceLock<CompressionPolicy>,
    cipher_out: OnceLock<CipherMode>,
    cipher_in: OnceLock<CipherMode>,
    /// Writer-side cipher, armed at start and activated once the first
    /// `hello` (which carries its parameters) has been written.
    pending_encryptor: Mutex<Option<Encryptor>>,
}

impl Shared {
    fn new() -> Self {
        let (state, _) = watch::channel(SessionState::Opening);
        Self {
            state,
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            last_error: Mutex::new(None),
            aliases_out: OnceLock::new(),
            aliases_in: OnceLock::new(),
            compression: OnceLock::new(),
            cipher_out: OnceLock::new(),
            cipher_in: OnceLock::new(),
            pending_encryptor: Mutex::new(None),
        }
    }

    /// Move the state forward; `Closing` only yields to `Closed`, and
    /// `Closed` is final.
    fn set_state(&self, new: SessionState) {
        self.state.send_if_modified(|current| {
            let allowed = match (*current, new) {
                (SessionState::Closed, _) => false,
                (SessionState::Closing, SessionState::Closed) => true,
                (SessionState::Closing, _) => false,
                (from, to) => from != to,
            };
            if allowed {
                *current = new;
            }
            allowed
        });
    }

    fn record_error(&self, error: ConnectionError) {
        let mut slot = self.last_error.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    fn last_error(&self) -> Option<ConnectionError> {
        self.last_error.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn take_pending_encryptor(&self) -> Option<Encryptor> {
        self.pending_encryptor.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

struct OutboundItem {
    packet: Packet,
    chunks: Vec<Chunk>,
    no_compress: bool,
    /// Install this encryptor after the packet is written (the packet
    /// carrying the cipher parameters itself travels in clear).
    activate_cipher: Option<Encryptor>,
}

fn enqueue_control(shared: &Shared, queue: &OutboundQueue<OutboundItem>, packet: Packet) {
    let activate_cipher = if packet.packet_type() == PACKET_HELLO {
        shared.take_pending_encryptor()
    } else {
        None
    };
    let item = OutboundItem { packet, chunks: Vec::new(), no_compress: false, activate_cipher };
    if queue.push(item, Priority::Urgent).is_err() {
        debug!("control packet dropped, queue is shut down");
    }
}

/// Connection builder: everything that must be in place before the first
/// byte moves.
pub struct Protocol<T> {
    transport: T,
    config: ProtocolConfig,
    registry: HandlerRegistry,
    extra_caps: Vec<(String, Value)>,
    aliases_in: Option<BTreeMap<String, i64>>,
    password: Option<Zeroizing<Vec<u8>>>,
    require_challenge: Option<ChallengeDigest>,
    cipher: Option<(Zeroizing<Vec<u8>>, CipherMode)>,
}

impl<T: Bytestream> Protocol<T> {
    /// Wrap a transport with the given configuration.
    pub fn new(transport: T, config: ProtocolConfig) -> Self {
        Self {
            transport,
            config,
            registry: HandlerRegistry::new(),
            extra_caps: Vec::new(),
            aliases_in: None,
            password: None,
            require_challenge: None,
            cipher: None,
        }
    }

    /// Register a subsystem handler; see [`HandlerRegistry::register`].
    pub fn register_handler(
        &mut self,
        packet_type: &str,
        handler: impl Fn(Packet) -> HandlerResult + Send + Sync + 'static,
    ) -> Result<()> {
        self.registry.register(packet_type, handler)
    }

    /// Register a reentrant handler; see
    /// [`HandlerRegistry::register_reentrant`].
    pub fn register_handler_reentrant(
        &mut self,
        packet_type: &str,
        handler: impl Fn(Packet) -> HandlerResult + Send + Sync + 'static,
    ) -> Result<()> {
        self.registry.register_reentrant(packet_type, handler)
    }

    /// Shared secret for answering (and, with
    /// [`Protocol::require_challenge`], verifying) challenges. Also serves
    /// as cipher key material when no dedicated key is set — the
    /// documented weaker mode.
    pub fn set_password(&mut self, password: &[u8]) {
        self.password = Some(Zeroizing::new(password.to_vec()));
    }

    /// Demand challenge-response authentication from the peer before
    /// completing the handshake.
    pub fn require_challenge(&mut self, password: &[u8], digest: ChallengeDigest) {
        self.password = Some(Zeroizing::new(password.to_vec()));
        self.require_challenge = Some(digest);
    }

    /// Encrypt this side's packets with AES in `mode`, keyed from
    /// `key_material` via PBKDF2. One-shot, before `start`.
    pub fn set_cipher(&mut self, key_material: &[u8], mode: CipherMode) {
        self.cipher = Some((Zeroizing::new(key_material.to_vec()), mode));
    }

    /// Packet-type aliases this side advertises (and therefore accepts
    /// inbound).
    pub fn set_aliases_in(&mut self, aliases: BTreeMap<String, i64>) {
        self.aliases_in = Some(aliases);
    }

    /// Attach an opaque subsystem capability to our `hello`.
    pub fn add_capability(&mut self, key: &str, value: Value) {
        self.extra_caps.push((key.to_owned(), value));
    }

    /// Seal the registry, spawn the reader and writer tasks, and begin the
    /// handshake. Must run inside a tokio runtime.
    pub fn start(mut self) -> Result<ProtocolHandle> {
        let mut local_caps = Capabilities::new(self.config.version.clone());
        local_caps.set_compression(self.config.advertise_lz4, self.config.advertise_brotli);
        if let Some(aliases) = &self.aliases_in {
            local_caps.set_aliases(aliases);
        }
        for (key, value) in &self.extra_caps {
            local_caps.insert(key, value.clone());
        }

        let shared = Arc::new(Shared::new());

        if let Some(aliases) = &self.aliases_in {
            let _ = shared.aliases_in.set(AliasTable::from_map(aliases));
        }

        // Key material priority: dedicated cipher key, then the password
        // (the documented weaker mode).
        let key_material = match (&self.cipher, &self.password) {
            (Some((key, _)), _) => Some(key.clone()),
            (None, Some(password)) => Some(password.clone()),
            (None, None) => None,
        };

        if let Some((material, mode)) = &self.cipher {
            let spec = CipherSpec::generate(*mode);
            local_caps.set_cipher(&spec);
            let key =
                stretch_key(material, &spec.key_salt, spec.key_hash, spec.iterations, spec.key_size)?;
            let encryptor = Encryptor::new(spec.mode, &key, spec.iv.as_deref())?;
            *shared.pending_encryptor.lock().unwrap_or_else(PoisonError::into_inner) =
                Some(encryptor);
        }

        self.registry.seal();
        let registry = Arc::new(self.registry);
        let queue = Arc::new(OutboundQueue::new(self.config.queue_high_water));

        let mut session = Session::new(SessionConfig {
            local_caps,
            password: self.password.as_ref().map(|p| p.to_vec()),
            require_challenge: self.require_challenge,
            retry_limit: self.config.hello_retry_limit,
        });

        for action in session.start() {
            if let SessionAction::Send(packet) = action {
                enqueue_control(&shared, &queue, packet);
            }
        }
        shared.set_state(session.state());

        let (read_half, write_half) = tokio::io::split(self.transport);

        let reader = ReaderTask {
            io: read_half,
            shared: Arc::clone(&shared),
            queue: Arc::clone(&queue),
            registry,
            session,
            reassembler: Reassembler::new(),
            decryptor: None,
            key_material,
            config: self.config.clone(),
        };
        let writer = WriterTask {
            io: write_half,
            shared: Arc::clone(&shared),
            queue: Arc::clone(&queue),
            config: self.config,
            encryptor: None,
        };

        let reader_task = tokio::spawn(reader.run());
        let writer_task = tokio::spawn(writer.run());
        {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                let _ = reader_task.await;
                let _ = writer_task.await;
                shared.set_state(SessionState::Closing);
                shared.set_state(SessionState::Closed);
            });
        }

        let state_rx = shared.state.subscribe();
        Ok(ProtocolHandle { shared, queue, state_rx })
    }
}

/// Handle to a running connection.
#[derive(Clone)]
pub struct ProtocolHandle {
    shared: Arc<Shared>,
    queue: Arc<OutboundQueue<OutboundItem>>,
    state_rx: watch::Receiver<SessionState>,
}

impl ProtocolHandle {
    /// Enqueue a packet. Returns once queued, not once written.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::Closed`] when the connection is shutting down
    /// - [`ConnectionError::PeerTooSlow`] when the queue is at its
    ///   high-water mark; the connection is failed as a side effect
    pub fn send(&self, packet: Packet, options: SendOptions) -> Result<()> {
        if matches!(self.state(), SessionState::Closing | SessionState::Closed) {
            return Err(ConnectionError::Closed("connection is shutting down".into()));
        }
        let item = OutboundItem {
            packet,
            chunks: options.chunks,
            no_compress: !options.compressible,
            activate_cipher: None,
        };
        match self.queue.push(item, options.priority) {
            Ok(()) => Ok(()),
            Err(error @ ConnectionError::PeerTooSlow { .. }) => {
                warn!(%error, "outbound queue overflow, failing the connection");
                self.shared.record_error(error.clone());
                self.initiate_close("peer too slow");
                Err(error)
            },
            Err(other) => Err(other),
        }
    }

    /// Enqueue a control packet at urgent priority.
    pub fn send_now(&self, packet: Packet) -> Result<()> {
        self.send(packet, SendOptions::new().priority(Priority::Urgent))
    }

    /// Orderly shutdown: send `disconnect`, drain urgent writes, close the
    /// stream. Idempotent.
    pub fn close(&self, reason: &str) {
        self.initiate_close(reason);
    }

    fn initiate_close(&self, reason: &str) {
        if matches!(self.state(), SessionState::Closing | SessionState::Closed) {
            return;
        }
        info!(reason, "closing connection");
        let disconnect = OutboundItem {
            packet: Packet::new(PACKET_DISCONNECT, vec![Value::text(reason)]),
            chunks: Vec::new(),
            no_compress: false,
            activate_cipher: None,
        };
        let _ = self.queue.push(disconnect, Priority::Urgent);
        self.queue.drain_urgent_only();
        self.shared.set_state(SessionState::Closing);
    }

    /// Current handshake state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Wait until the handshake completes.
    ///
    /// # Errors
    ///
    /// The connection's terminal error if it closes first.
    pub async fn wait_established(&self) -> Result<()> {
        let mut rx = self.state_rx.clone();
        loop {
            match *rx.borrow_and_update() {
                SessionState::Established => return Ok(()),
                SessionState::Closing | SessionState::Closed => {
                    return Err(self
                        .last_error()
                        .unwrap_or_else(|| ConnectionError::Closed("closed during handshake".into())));
                },
                _ => {},
            }
            if rx.changed().await.is_err() {
                return Err(ConnectionError::Closed("engine dropped".into()));
            }
        }
    }

    /// Wait until both tasks have stopped; returns the terminal error, or
    /// `None` for an orderly close.
    pub async fn wait_closed(&self) -> Option<ConnectionError> {
        let mut rx = self.state_rx.clone();
        loop {
            if *rx.borrow_and_update() == SessionState::Closed {
                return self.last_error();
            }
            if rx.changed().await.is_err() {
                return self.last_error();
            }
        }
    }

    /// The error that terminated the connection, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<ConnectionError> {
        self.shared.last_error()
    }

    /// Packets currently queued outbound.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Install the outgoing alias table by hand, for the rare subsystem
    /// that negotiates aliases itself. Install-once: returns `false` when
    /// a table is already in place.
    pub fn set_aliases_out(&self, aliases: &BTreeMap<String, i64>) -> bool {
        self.shared.aliases_out.set(AliasTable::from_map(aliases)).is_ok()
    }

    /// Snapshot of the observable state.
    #[must_use]
    pub fn stats(&self) -> ProtocolStats {
        ProtocolStats {
            state: self.state(),
            bytes_sent: self.shared.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.shared.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.shared.packets_sent.load(Ordering::Relaxed),
            packets_received: self.shared.packets_received.load(Ordering::Relaxed),
            queue_len: self.queue.len(),
            cipher_out: self.shared.cipher_out.get().copied(),
            cipher_in: self.shared.cipher_in.get().copied(),
            last_error: self.last_error(),
        }
    }
}

struct ReaderTask<T> {
    io: ReadHalf<T>,
    shared: Arc<Shared>,
    queue: Arc<OutboundQueue<OutboundItem>>,
    registry: Arc<HandlerRegistry>,
    session: Session,
    reassembler: Reassembler,
    decryptor: Option<Decryptor>,
    key_material: Option<Zeroizing<Vec<u8>>>,
    config: ProtocolConfig,
}

impl<T: Bytestream> ReaderTask<T> {
    async fn run(mut self) {
        if let Err(error) = self.run_inner().await {
            warn!(%error, "connection failed");
            self.shared.record_error(error.clone());
            // Best-effort disconnect with a human-readable reason.
            enqueue_control(
                &self.shared,
                &self.queue,
                Packet::new(PACKET_DISCONNECT, vec![Value::text(error.disconnect_reason())]),
            );
        }
        self.shared.set_state(SessionState::Closing);
        self.queue.drain_urgent_only();
    }

    async fn run_inner(&mut self) -> Result<()> {
        let handshake_deadline = Instant::now() + self.config.handshake_timeout;
        loop {
            let in_handshake = !matches!(
                self.session.state(),
                SessionState::Established | SessionState::Closing | SessionState::Closed
            );

            let frame = if in_handshake {
                timeout_at(handshake_deadline, self.read_frame()).await.map_err(|_| {
                    ConnectionError::Timeout {
                        operation: "handshake",
                        elapsed: self.config.handshake_timeout,
                    }
                })??
            } else if self.reassembler.is_empty() {
                self.read_frame().await?
            } else {
                timeout(self.config.chunk_timeout, self.read_frame()).await.map_err(|_| {
                    ConnectionError::Timeout {
                        operation: "chunk reassembly",
                        elapsed: self.config.chunk_timeout,
                    }
                })??
            };

            let Some((header, payload)) = frame else {
                if !self.reassembler.is_empty() {
                    return Err(castwire_proto::ProtocolError::Framing(
                        "stream ended with chunks awaiting their main packet".into(),
                    )
                    .into());
                }
                debug!("end of stream");
                return Ok(());
            };

            if self.process_frame(header, payload)?.is_break() {
                return Ok(());
            }
        }
    }

    /// Read one frame: header, then exactly `payload_size` bytes.
    ///
    /// `None` is an orderly end-of-stream on a frame boundary; EOF inside
    /// a header or payload is `UnexpectedEof`.
    async fn read_frame(&mut self) -> Result<Option<(PacketHeader, Vec<u8>)>> {
        let mut header_buf = [0u8; HEADER_SIZE];
        let mut filled = 0;
        while filled < HEADER_SIZE {
            let n = self.io.read(&mut header_buf[filled..]).await.map_err(ConnectionError::from)?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(ProtocolError::UnexpectedEof {
                    expected: HEADER_SIZE,
                    actual: filled,
                }
                .into());
            }
            filled += n;
        }

        // The oversize check happens in the header parse, before the
        // payload buffer exists.
        let header = PacketHeader::parse(&header_buf, self.config.payload_limit)?;
        let size = header.payload_size as usize;
        let mut payload = vec![0u8; size];
        self.io.read_exact(&mut payload).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                ConnectionError::Protocol(ProtocolError::UnexpectedEof {
                    expected: size,
                    actual: 0,
                })
            } else {
                ConnectionError::Transport(e.to_string())
            }
        })?;

        self.shared.bytes_received.fetch_add((HEADER_SIZE + size) as u64, Ordering::Relaxed);
        Ok(Some((header, payload)))
    }

    fn process_frame(
        &mut self,
        header: PacketHeader,
        payload: Vec<u8>,
    ) -> Result<ControlFlow<()>> {
        let payload = if header.has_cipher() {
            let decryptor = self.decryptor.as_mut().ok_or_else(|| {
                ConnectionError::Auth("cipher flag on a packet but no cipher negotiated".into())
            })?;
            decryptor.open(&payload)?
        } else {
            if self.decryptor.is_some() {
                return Err(ConnectionError::Auth(
                    "cleartext packet after cipher negotiation".into(),
                ));
            }
            payload
        };

        if !header.is_main() {
            debug!(index = header.chunk_index, size = payload.len(), "chunk buffered");
            self.reassembler.store(header.chunk_index, Bytes::from(payload))?;
            return Ok(ControlFlow::Continue(()));
        }

        let codec = Compressor::from_header(header.compression)?;
        let permitted = match codec {
            Compressor::None => true,
            Compressor::Lz4 => self.config.advertise_lz4,
            Compressor::Brotli => self.config.advertise_brotli,
        };
        if !permitted {
            return Err(ProtocolError::Compression(format!(
                "peer sent {} which this side never advertised",
                codec.name()
            ))
            .into());
        }
        let payload = match codec {
            Compressor::None => payload,
            other => other.decompress(&payload, self.config.payload_limit)?,
        };

        let mut items = Value::decode_list(&payload)?;
        self.reassembler.substitute(&mut items)?;
        if items.is_empty() {
            return Err(ProtocolError::MalformedPayload {
                offset: 0,
                reason: "empty packet list".into(),
            }
            .into());
        }

        let packet_type = match items.remove(0) {
            Value::Text(name) => name,
            Value::Int(alias) => {
                match self.shared.aliases_in.get().and_then(|t| t.name_for(alias)) {
                    Some(name) => name.to_owned(),
                    None => {
                        warn!(alias, "discarding packet with unknown alias");
                        return Ok(ControlFlow::Continue(()));
                    },
                }
            },
            other => {
                return Err(ProtocolError::MalformedPayload {
                    offset: 0,
                    reason: format!("packet type must be text or alias, found {}", other.type_name()),
                }
                .into());
            },
        };

        self.shared.packets_received.fetch_add(1, Ordering::Relaxed);
        let actions = self.session.handle_packet(Packet::new(packet_type, items));
        self.execute(actions)
    }

    fn execute(&mut self, actions: Vec<SessionAction>) -> Result<ControlFlow<()>> {
        for action in actions {
            match action {
                SessionAction::Send(packet) => {
                    enqueue_control(&self.shared, &self.queue, packet);
                },
                SessionAction::InstallAliasesOut(map) => {
                    if self.shared.aliases_out.set(AliasTable::from_map(&map)).is_err() {
                        warn!("peer re-sent aliases, keeping the original table");
                    }
                },
                SessionAction::InstallDecryptor(spec) => self.install_decryptor(&spec)?,
                SessionAction::Established(caps) => {
                    info!(version = caps.version().unwrap_or("?"), "connection established");
                    let _ = self.shared.compression.set(CompressionPolicy {
                        threshold: self.config.compression_threshold,
                        lz4: caps.lz4(),
                        brotli: caps.brotli(),
                        level: self.config.compression_level,
                    });
                },
                SessionAction::Deliver(packet) => self.registry.dispatch(packet)?,
                SessionAction::Close { reason, error } => {
                    if let Some(error) = error {
                        self.shared.record_error(error);
                    }
                    info!(reason = %reason, "connection closing");
                    self.shared.set_state(SessionState::Closing);
                    return Ok(ControlFlow::Break(()));
                },
            }
        }
        self.shared.set_state(self.session.state());
        Ok(ControlFlow::Continue(()))
    }

    fn install_decryptor(&mut self, spec: &CipherSpec) -> Result<()> {
        let material = self.key_material.as_ref().ok_or_else(|| {
            ConnectionError::Auth("peer negotiated encryption but no key material is set".into())
        })?;
        let key =
            stretch_key(material, &spec.key_salt, spec.key_hash, spec.iterations, spec.key_size)?;
        self.decryptor = Some(Decryptor::new(spec.mode, &key, spec.iv.as_deref())?);
        let _ = self.shared.cipher_in.set(spec.mode);
        debug!(mode = spec.mode.name(), "inbound cipher installed");
        Ok(())
    }
}

struct WriterTask<T> {
    io: WriteHalf<T>,
    shared: Arc<Shared>,
    queue: Arc<OutboundQueue<OutboundItem>>,
    config: ProtocolConfig,
    encryptor: Option<Encryptor>,
}

impl<T: Bytestream> WriterTask<T> {
    async fn run(mut self) {
        while let Some((mut item, queue_empty)) = self.queue.pop().await {
            let activate = item.activate_cipher.take();

            let frame = match self.serialize(item, queue_empty) {
                Ok(frame) => frame,
                Err(error) => {
                    warn!(%error, "failed to serialize outbound packet");
                    self.shared.record_error(error);
                    self.shared.set_state(SessionState::Closing);
                    self.queue.close();
                    break;
                },
            };

            if let Err(error) = self.io.write_all(&frame).await {
                debug!(%error, "stream write failed");
                self.shared.record_error(ConnectionError::Transport(error.to_string()));
                self.shared.set_state(SessionState::Closing);
                self.queue.close();
                break;
            }

            self.shared.bytes_sent.fetch_add(frame.len() as u64, Ordering::Relaxed);
            self.shared.packets_sent.fetch_add(1, Ordering::Relaxed);

            if let Some(encryptor) = activate {
                let _ = self.shared.cipher_out.set(encryptor.mode());
                debug!(mode = encryptor.mode().name(), "outbound cipher active");
                self.encryptor = Some(encryptor);
            }
        }
        let _ = self.io.shutdown().await;
    }

    /// Serialize a packet and its chunks into one contiguous buffer —
    /// cancellation can never half-write a packet.
    fn serialize(&mut self, item: OutboundItem, queue_empty: bool) -> Result<Vec<u8>> {
        let alias = self
            .shared
            .aliases_out
            .get()
            .and_then(|table| table.number_for(item.packet.packet_type()));
        let encoded = Value::List(item.packet.into_items(alias)).to_wire();

        let policy = self.shared.compression.get();
        let codec = policy
            .map_or(Compressor::None, |p| p.choose(encoded.len(), !item.no_compress));
        let level = policy.map_or(0, |p| p.level);
        let (payload, compression) = match codec {
            Compressor::None => (encoded, 0),
            other => {
                let packed = other.compress(&encoded, level)?;
                // Incompressible data can grow; send it raw instead.
                if packed.len() < encoded.len() {
                    (packed, other.header_byte(level))
                } else {
                    (encoded, 0)
                }
            },
        };

        let cipher = self.encryptor.is_some();
        let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());

        for chunk in &item.chunks {
            let data = match self.encryptor.as_mut() {
                Some(encryptor) => encryptor.seal(&chunk.data)?,
                None => chunk.data.to_vec(),
            };
            self.check_size(data.len())?;
            out.extend_from_slice(
                &PacketHeader::chunk(chunk.index, cipher, data.len() as u32).to_bytes(),
            );
            out.extend_from_slice(&data);
        }

        let mut flags = 0;
        if queue_empty {
            flags |= FLAG_FLUSH;
        }
        let payload = match self.encryptor.as_mut() {
            Some(encryptor) => {
                flags |= castwire_proto::FLAG_CIPHER;
                encryptor.seal(&payload)?
            },
            None => payload,
        };
        self.check_size(payload.len())?;
        out.extend_from_slice(
            &PacketHeader::main(flags, compression, payload.len() as u32).to_bytes(),
        );
        out.extend_from_slice(&payload);
        Ok(out)
    }

    fn check_size(&self, size: usize) -> Result<()> {
        if size > self.config.payload_limit || size > u32::MAX as usize {
            return Err(ProtocolError::OversizedPacket {
                size,
                limit: self.config.payload_limit,
            }
            .into());
        }
        Ok(())
    }
}
