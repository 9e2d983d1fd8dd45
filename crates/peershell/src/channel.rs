//! Session channel, detached from the SSH engine.
//!
//! A [`SessionChannel`] is what the session bridge talks to: a duplex data
//! stream, an extended-data (stderr) stream, a queue of incoming out-of-band
//! requests and a sender for outgoing ones. The engine adapters own the
//! other end of a [`pair`] and pump it to and from the wire; tests connect
//! two bridge ends back to back.

use bytes::Bytes;
use protocol::RequestKind;
use thiserror::Error;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot};

/// Bytes buffered in each direction of a channel pair.
pub const DEFAULT_WINDOW_SIZE: usize = 64 * 1024;

/// Requests that may be queued before the sender waits.
const REQUEST_QUEUE_DEPTH: usize = 32;

/// Errors from channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The other end of the channel is gone.
    #[error("channel closed")]
    Closed,

    /// I/O error on the data stream.
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An out-of-band request travelling over a channel.
#[derive(Debug)]
pub struct ChannelRequest {
    kind: RequestKind,
    payload: Bytes,
    reply: Option<oneshot::Sender<bool>>,
}

impl ChannelRequest {
    /// A request that does not expect an answer.
    pub fn notification(kind: RequestKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
            reply: None,
        }
    }

    /// A request whose answer arrives on the returned receiver.
    pub fn with_reply(
        kind: RequestKind,
        payload: impl Into<Bytes>,
    ) -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            kind,
            payload: payload.into(),
            reply: Some(tx),
        };
        (request, rx)
    }

    pub fn kind(&self) -> &RequestKind {
        &self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn want_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Answer the request. A no-op for notifications.
    pub fn reply(self, ok: bool) {
        if let Some(tx) = self.reply {
            let _ = tx.send(ok);
        }
    }

    /// Split into kind, payload and reply slot, for engine adapters.
    pub fn into_parts(self) -> (RequestKind, Bytes, Option<oneshot::Sender<bool>>) {
        (self.kind, self.payload, self.reply)
    }
}

/// Sending side of a channel's request queue.
#[derive(Debug, Clone)]
pub struct RequestSender {
    tx: mpsc::Sender<ChannelRequest>,
}

impl RequestSender {
    /// Send a request and wait for the answer.
    ///
    /// A request dropped without an answer counts as refused.
    pub async fn request(
        &self,
        kind: RequestKind,
        payload: impl Into<Bytes>,
    ) -> Result<bool, ChannelError> {
        let (request, reply) = ChannelRequest::with_reply(kind, payload);
        self.tx
            .send(request)
            .await
            .map_err(|_| ChannelError::Closed)?;
        Ok(reply.await.unwrap_or(false))
    }

    /// Send a request without waiting for an answer.
    pub async fn notify(
        &self,
        kind: RequestKind,
        payload: impl Into<Bytes>,
    ) -> Result<(), ChannelError> {
        self.tx
            .send(ChannelRequest::notification(kind, payload))
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Forward an already-built request.
    pub async fn forward(&self, request: ChannelRequest) -> Result<(), ChannelError> {
        self.tx.send(request).await.map_err(|_| ChannelError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One end of a session channel.
#[derive(Debug)]
pub struct SessionChannel {
    /// Channel data. Reads yield what the other end wrote.
    pub data: DuplexStream,
    /// Extended data (stderr).
    pub extended: DuplexStream,
    /// Requests sent by the other end.
    pub requests: mpsc::Receiver<ChannelRequest>,
    /// Requests towards the other end.
    pub control: RequestSender,
}

/// Two channel ends connected back to back.
pub fn pair(window: usize) -> (SessionChannel, SessionChannel) {
    let (data_a, data_b) = tokio::io::duplex(window);
    let (ext_a, ext_b) = tokio::io::duplex(window);
    let (a_to_b, b_requests) = mpsc::channel(REQUEST_QUEUE_DEPTH);
    let (b_to_a, a_requests) = mpsc::channel(REQUEST_QUEUE_DEPTH);

    let a = SessionChannel {
        data: data_a,
        extended: ext_a,
        requests: a_requests,
        control: RequestSender { tx: a_to_b },
    };
    let b = SessionChannel {
        data: data_b,
        extended: ext_b,
        requests: b_requests,
        control: RequestSender { tx: b_to_a },
    };
    (a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_pair_carries_data_both_ways() {
        let (mut a, mut b) = pair(1024);

        a.data.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b.data.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        b.data.write_all(b"pong").await.unwrap();
        a.data.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_request_reply_roundtrip() {
        let (a, mut b) = pair(1024);

        let responder = tokio::spawn(async move {
            let request = b.requests.recv().await.unwrap();
            assert_eq!(request.kind(), &RequestKind::Shell);
            assert!(request.want_reply());
            request.reply(true);
        });

        let ok = a.control.request(RequestKind::Shell, Bytes::new()).await.unwrap();
        assert!(ok);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_request_counts_as_refused() {
        let (a, mut b) = pair(1024);

        let responder = tokio::spawn(async move {
            let request = b.requests.recv().await.unwrap();
            drop(request);
        });

        let ok = a.control.request(RequestKind::PtyReq, Bytes::new()).await.unwrap();
        assert!(!ok);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_notification_has_no_reply() {
        let (a, mut b) = pair(1024);
        a.control
            .notify(RequestKind::WindowChange, vec![0u8; 8])
            .await
            .unwrap();

        let request = b.requests.recv().await.unwrap();
        assert!(!request.want_reply());
        assert_eq!(request.payload().len(), 8);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (a, b) = pair(1024);
        drop(b);
        assert!(a.control.is_closed());
        let result = a.control.notify(RequestKind::Shell, Bytes::new()).await;
        assert!(matches!(result, Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn test_shutdown_is_seen_as_eof() {
        let (mut a, mut b) = pair(1024);
        a.data.shutdown().await.unwrap();

        let mut buf = Vec::new();
        let n = b.data.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
