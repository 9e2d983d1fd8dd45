//! Peer-to-peer stream transport.
//!
//! Sessions only need a full-duplex byte stream to a peer, opened or
//! accepted under a protocol identifier. This module provides:
//! - [`IrohTransport`]: QUIC streams over iroh (hole punching, relays)
//! - [`MemoryTransport`]: in-process streams, for tests and local use

pub mod memory;
pub mod quic;

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

pub use memory::MemoryTransport;
pub use quic::{IrohConfig, IrohStream, IrohTransport};

/// Errors from the transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer could not be reached or refused the protocol.
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    /// The local endpoint could not be created or cannot listen.
    #[error("failed to bind endpoint: {0}")]
    Bind(String),

    /// The transport has been shut down.
    #[error("transport closed")]
    Closed,
}

/// A full-duplex byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// A stream whose concrete type depends on the transport.
pub type BoxedStream = Box<dyn AsyncStream>;

/// An accepted stream and the identifier of the peer that opened it.
pub type IncomingStream = (String, BoxedStream);

/// Something that can open streams to peers and accept streams from them.
pub trait Transport: Send + Sync {
    /// Open a stream to `peer` for `protocol`.
    fn open_stream<'a>(
        &'a self,
        peer: &'a str,
        protocol: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<BoxedStream, TransportError>> + Send + 'a>>;

    /// Start accepting streams for `protocol`.
    fn listen<'a>(
        &'a self,
        protocol: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn StreamListener>, TransportError>> + Send + 'a>>;

    /// Identifier other peers use to reach this one.
    fn local_peer_id(&self) -> String;
}

/// Incoming streams for one protocol.
pub trait StreamListener: Send {
    /// The next stream, or `None` once the transport is closed.
    fn accept<'a>(
        &'a mut self,
    ) -> Pin<Box<dyn Future<Output = Option<IncomingStream>> + Send + 'a>>;
}

/// Listener fed by a background accept task.
pub struct QueuedListener {
    rx: mpsc::Receiver<IncomingStream>,
}

impl QueuedListener {
    pub(crate) fn new(rx: mpsc::Receiver<IncomingStream>) -> Self {
        Self { rx }
    }
}

impl StreamListener for QueuedListener {
    fn accept<'a>(
        &'a mut self,
    ) -> Pin<Box<dyn Future<Output = Option<IncomingStream>> + Send + 'a>> {
        Box::pin(self.rx.recv())
    }
}
