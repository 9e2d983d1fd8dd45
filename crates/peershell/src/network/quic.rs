//! QUIC transport over iroh.
//!
//! Each session stream is one bidirectional QUIC stream on a connection
//! negotiated with the protocol identifier as ALPN. iroh handles hole
//! punching and falls back to a relay when a direct path is not possible.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::Duration;

use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::{Endpoint, NodeAddr, NodeId, RelayMap, RelayMode, RelayUrl, SecretKey};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use super::{BoxedStream, IncomingStream, QueuedListener, StreamListener, Transport, TransportError};

/// Default timeout for connection establishment.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Accepted streams queued before the accept loop waits.
const ACCEPT_BACKLOG: usize = 16;

/// Configuration for the iroh endpoint.
#[derive(Debug, Clone)]
pub struct IrohConfig {
    /// ALPN protocols the endpoint accepts.
    pub protocols: Vec<String>,
    /// Relay to use instead of the default relay set.
    pub relay_url: Option<RelayUrl>,
    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,
    /// Disable relays and discovery; peers must be given direct addresses.
    pub local_only: bool,
}

impl Default for IrohConfig {
    fn default() -> Self {
        Self {
            protocols: vec![protocol::PROTOCOL_ID.to_string()],
            relay_url: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            local_only: false,
        }
    }
}

impl IrohConfig {
    /// Use a specific relay server.
    pub fn with_relay(mut self, relay_url: RelayUrl) -> Self {
        self.relay_url = Some(relay_url);
        self
    }

    /// Sets the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Streams to and from iroh nodes, addressed by node id.
pub struct IrohTransport {
    endpoint: Endpoint,
    config: IrohConfig,
    /// Addresses learned out of band, used when dialing by node id.
    known_addrs: Mutex<HashMap<NodeId, NodeAddr>>,
}

impl IrohTransport {
    /// Bind an endpoint with a persistent identity.
    pub async fn bind(secret_key: SecretKey, config: IrohConfig) -> Result<Self, TransportError> {
        let alpns = config
            .protocols
            .iter()
            .map(|p| p.as_bytes().to_vec())
            .collect();
        let mut builder = Endpoint::builder().secret_key(secret_key).alpns(alpns);

        if config.local_only {
            builder = builder.relay_mode(RelayMode::Disabled).clear_discovery();
        } else {
            builder = builder.discovery_n0();
            if let Some(ref relay_url) = config.relay_url {
                tracing::debug!("Using relay: {}", relay_url);
                let relays = RelayMap::from_url(relay_url.clone());
                builder = builder.relay_mode(RelayMode::Custom(relays));
            }
        }

        let endpoint = builder
            .bind()
            .await
            .map_err(|e| TransportError::Bind(format!("failed to create iroh endpoint: {}", e)))?;

        tracing::info!(node_id = %endpoint.node_id(), "Endpoint bound");
        Ok(Self {
            endpoint,
            config,
            known_addrs: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the node ID (public key) of this endpoint.
    pub fn node_id(&self) -> NodeId {
        self.endpoint.node_id()
    }

    /// Returns the node address: node id, relay URL and direct addresses.
    pub async fn node_addr(&self) -> Result<NodeAddr, TransportError> {
        self.endpoint
            .node_addr()
            .await
            .map_err(|e| TransportError::Bind(format!("failed to get node address: {}", e)))
    }

    /// Remember addresses for a peer, used by later `open_stream` calls.
    pub fn add_node_addr(&self, addr: NodeAddr) {
        if let Ok(mut known) = self.known_addrs.lock() {
            known.insert(addr.node_id, addr);
        }
    }

    /// Returns the underlying iroh endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Close every connection and release the sockets.
    pub async fn close(&self) {
        tracing::debug!("Closing endpoint");
        let _ = self.endpoint.close().await;
    }

    fn resolve(&self, peer: &str) -> Result<NodeAddr, TransportError> {
        let node_id: NodeId = peer
            .parse()
            .map_err(|e| TransportError::Unreachable(format!("invalid node id {}: {}", peer, e)))?;
        let known = self
            .known_addrs
            .lock()
            .ok()
            .and_then(|known| known.get(&node_id).cloned());
        Ok(known.unwrap_or_else(|| NodeAddr::new(node_id)))
    }
}

impl Transport for IrohTransport {
    fn open_stream<'a>(
        &'a self,
        peer: &'a str,
        protocol: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<BoxedStream, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let node_addr = self.resolve(peer)?;

            let connection = tokio::time::timeout(
                self.config.connect_timeout,
                self.endpoint.connect(node_addr, protocol.as_bytes()),
            )
            .await
            .map_err(|_| TransportError::Unreachable("connection timed out".to_string()))?
            .map_err(|e| TransportError::Unreachable(format!("failed to connect: {}", e)))?;

            let (send, recv) = connection
                .open_bi()
                .await
                .map_err(|e| TransportError::Unreachable(format!("failed to open stream: {}", e)))?;

            tracing::info!(peer = %peer, "Connected to peer");
            Ok(Box::new(IrohStream::new(connection, send, recv)) as BoxedStream)
        })
    }

    fn listen<'a>(
        &'a self,
        protocol: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn StreamListener>, TransportError>> + Send + 'a>>
    {
        Box::pin(async move {
            if !self.config.protocols.iter().any(|p| p == protocol) {
                return Err(TransportError::Bind(format!(
                    "endpoint was not bound for {}",
                    protocol
                )));
            }

            let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
            tokio::spawn(accept_loop(self.endpoint.clone(), tx));
            Ok(Box::new(QueuedListener::new(rx)) as Box<dyn StreamListener>)
        })
    }

    fn local_peer_id(&self) -> String {
        self.node_id().to_string()
    }
}

/// Accept connections until the endpoint closes or the listener is dropped.
async fn accept_loop(endpoint: Endpoint, tx: mpsc::Sender<IncomingStream>) {
    loop {
        let incoming = tokio::select! {
            _ = tx.closed() => return,
            incoming = endpoint.accept() => match incoming {
                Some(incoming) => incoming,
                None => {
                    tracing::debug!("Endpoint closed, accept loop stopping");
                    return;
                }
            },
        };

        let tx = tx.clone();
        tokio::spawn(async move {
            let connection = match incoming.await {
                Ok(connection) => connection,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept connection");
                    return;
                }
            };
            let peer = match connection.remote_node_id() {
                Ok(node_id) => node_id.to_string(),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to get remote node id");
                    return;
                }
            };
            tracing::info!(peer = %peer, "Accepted connection");
            accept_streams(connection, peer, tx).await;
        });
    }
}

/// Hand every stream a peer opens on `connection` to the listener.
async fn accept_streams(connection: Connection, peer: String, tx: mpsc::Sender<IncomingStream>) {
    loop {
        let (send, recv) = match connection.accept_bi().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::debug!(peer = %peer, error = %e, "Connection closed");
                return;
            }
        };
        let stream = IrohStream::new(connection.clone(), send, recv);
        if tx.send((peer.clone(), Box::new(stream))).await.is_err() {
            connection.close(0u32.into(), b"listener closed");
            return;
        }
    }
}

/// One QUIC bidirectional stream as an `AsyncRead + AsyncWrite`.
///
/// Holds its connection so the connection lives as long as the stream.
pub struct IrohStream {
    send: SendStream,
    recv: RecvStream,
    _connection: Connection,
}

impl IrohStream {
    fn new(connection: Connection, send: SendStream, recv: RecvStream) -> Self {
        Self {
            send,
            recv,
            _connection: connection,
        }
    }
}

impl AsyncRead for IrohStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for IrohStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.send).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.send).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn local_config() -> IrohConfig {
        IrohConfig {
            local_only: true,
            connect_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    #[test]
    fn test_config_default() {
        let config = IrohConfig::default();
        assert!(config.relay_url.is_none());
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.protocols, vec![protocol::PROTOCOL_ID.to_string()]);
    }

    #[tokio::test]
    async fn test_bind_with_secret_key() {
        let secret_key = SecretKey::generate(rand::rngs::OsRng);
        let expected = secret_key.public();

        let transport = IrohTransport::bind(secret_key, local_config()).await.unwrap();
        assert_eq!(transport.node_id(), expected);
        assert_eq!(transport.local_peer_id(), expected.to_string());
    }

    #[tokio::test]
    async fn test_invalid_node_id_unreachable() {
        let transport = IrohTransport::bind(SecretKey::generate(rand::rngs::OsRng), local_config())
            .await
            .unwrap();
        let result = transport.open_stream("not-a-node-id", protocol::PROTOCOL_ID).await;
        assert!(matches!(result, Err(TransportError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_listen_requires_bound_protocol() {
        let transport = IrohTransport::bind(SecretKey::generate(rand::rngs::OsRng), local_config())
            .await
            .unwrap();
        assert!(matches!(
            transport.listen("/other/1.0.0").await,
            Err(TransportError::Bind(_))
        ));
    }

    #[tokio::test]
    #[ignore = "requires network connectivity, run with --ignored"]
    async fn test_stream_over_loopback() {
        let server = IrohTransport::bind(SecretKey::generate(rand::rngs::OsRng), local_config())
            .await
            .unwrap();
        let client = IrohTransport::bind(SecretKey::generate(rand::rngs::OsRng), local_config())
            .await
            .unwrap();

        let bound_sockets = server.endpoint().bound_sockets();
        let mut direct_addrs: Vec<std::net::SocketAddr> = vec![bound_sockets.0];
        if let Some(addr) = bound_sockets.1 {
            direct_addrs.push(addr);
        }
        client.add_node_addr(NodeAddr::from_parts(server.node_id(), None, direct_addrs));

        let mut listener = server.listen(protocol::PROTOCOL_ID).await.unwrap();
        let peer = server.node_id().to_string();
        let mut stream = client.open_stream(&peer, protocol::PROTOCOL_ID).await.unwrap();
        stream.write_all(b"SSH-2.0-test\r\n").await.unwrap();

        let (remote, mut accepted) = listener.accept().await.unwrap();
        assert_eq!(remote, client.node_id().to_string());

        let mut buf = [0u8; 14];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"SSH-2.0-test\r\n");
    }
}
