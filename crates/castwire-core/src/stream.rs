//! The bytestream adapter seam.
//!
//! The engine sees a transport as nothing more than a duplex byte stream:
//! reads that may return partially, writes that may apply backpressure,
//! an orderly end-of-stream, and a write-side shutdown. TLS, WebSocket
//! framing, SSH tunnelling and QUIC all live behind this seam.
//!
//! In tokio terms that contract is `AsyncRead + AsyncWrite`: `read` is the
//! adapter's `read_into` (zero means end-of-stream), `write`/`write_all`
//! apply backpressure, and `shutdown` is `shutdown_write`. Dropping both
//! halves closes the stream.

use tokio::io::{AsyncRead, AsyncWrite};

/// Anything the protocol engine can run over.
///
/// Blanket-implemented; `tokio::net::TcpStream`, unix sockets, TLS streams
/// and `tokio::io::duplex` (the in-memory transport used by the tests) all
/// qualify.
pub trait Bytestream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Bytestream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
