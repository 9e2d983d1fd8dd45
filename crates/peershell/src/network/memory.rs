//! In-process transport.
//!
//! Peers are names in a shared registry; a stream is one end of a
//! `tokio::io::duplex`. Lets the whole SSH and PTY stack run in a test
//! without sockets.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::{BoxedStream, IncomingStream, QueuedListener, StreamListener, Transport, TransportError};
use crate::channel::DEFAULT_WINDOW_SIZE;

/// Pending streams a listener may have before openers wait.
const BACKLOG: usize = 16;

type Registry = HashMap<(String, String), mpsc::Sender<IncomingStream>>;

/// One named peer on an in-process network.
#[derive(Clone)]
pub struct MemoryTransport {
    name: String,
    registry: Arc<Mutex<Registry>>,
}

impl MemoryTransport {
    /// First peer on a new, empty network.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Another peer on the same network.
    pub fn peer(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            registry: Arc::clone(&self.registry),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lookup(&self, peer: &str, protocol: &str) -> Option<mpsc::Sender<IncomingStream>> {
        let registry = self.registry.lock().ok()?;
        registry
            .get(&(peer.to_string(), protocol.to_string()))
            .cloned()
    }
}

impl Transport for MemoryTransport {
    fn open_stream<'a>(
        &'a self,
        peer: &'a str,
        protocol: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<BoxedStream, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let listener = self.lookup(peer, protocol).ok_or_else(|| {
                TransportError::Unreachable(format!("no listener for {} on {}", protocol, peer))
            })?;

            let (local, remote) = tokio::io::duplex(DEFAULT_WINDOW_SIZE);
            listener
                .send((self.name.clone(), Box::new(remote)))
                .await
                .map_err(|_| TransportError::Unreachable(format!("{} stopped listening", peer)))?;

            tracing::debug!(peer = %peer, protocol = %protocol, "Opened in-memory stream");
            Ok(Box::new(local) as BoxedStream)
        })
    }

    fn listen<'a>(
        &'a self,
        protocol: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn StreamListener>, TransportError>> + Send + 'a>>
    {
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(BACKLOG);
            let mut registry = self
                .registry
                .lock()
                .map_err(|_| TransportError::Bind("registry poisoned".to_string()))?;

            let key = (self.name.clone(), protocol.to_string());
            if registry.get(&key).is_some_and(|existing| !existing.is_closed()) {
                return Err(TransportError::Bind(format!(
                    "{} already listening on {}",
                    self.name, protocol
                )));
            }
            registry.insert(key, tx);
            Ok(Box::new(QueuedListener::new(rx)) as Box<dyn StreamListener>)
        })
    }

    fn local_peer_id(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_open_and_accept() {
        let server = MemoryTransport::new("server");
        let client = server.peer("client");

        let mut listener = server.listen("/test/1").await.unwrap();
        let mut stream = client.open_stream("server", "/test/1").await.unwrap();
        let (peer, mut accepted) = listener.accept().await.unwrap();
        assert_eq!(peer, "client");

        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_unknown_peer_unreachable() {
        let client = MemoryTransport::new("client");
        let result = client.open_stream("nobody", "/test/1").await;
        assert!(matches!(result, Err(TransportError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_wrong_protocol_unreachable() {
        let server = MemoryTransport::new("server");
        let client = server.peer("client");
        let _listener = server.listen("/test/1").await.unwrap();

        let result = client.open_stream("server", "/other/1").await;
        assert!(matches!(result, Err(TransportError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_dropped_listener_unreachable() {
        let server = MemoryTransport::new("server");
        let client = server.peer("client");
        drop(server.listen("/test/1").await.unwrap());

        let result = client.open_stream("server", "/test/1").await;
        assert!(matches!(result, Err(TransportError::Unreachable(_))));

        // The slot can be taken again once the old listener is gone.
        assert!(server.listen("/test/1").await.is_ok());
    }

    #[tokio::test]
    async fn test_double_listen_rejected() {
        let server = MemoryTransport::new("server");
        let _listener = server.listen("/test/1").await.unwrap();
        assert!(matches!(
            server.listen("/test/1").await,
            Err(TransportError::Bind(_))
        ));
    }
}
