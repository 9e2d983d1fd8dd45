//! russh client adapter.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use protocol::{ExitStatus, PtyRequest, Request, RequestKind, WindowChange};
use russh::client::{self, AuthResult, Handle, Msg};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, ChannelMsg};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::Instrument;
use zeroize::Zeroizing;

use super::modes_to_russh;
use crate::auth::fingerprint;
use crate::channel::{pair, ChannelRequest, SessionChannel, DEFAULT_WINDOW_SIZE};
use crate::error::{Result, SessionError};
use crate::network::BoxedStream;

const READ_BUFFER_SIZE: usize = 4096;

/// What the client authenticates with.
pub enum ClientCredential {
    Password(Zeroizing<String>),
    Key(PrivateKey),
}

impl ClientCredential {
    pub fn password(secret: impl Into<String>) -> Self {
        Self::Password(Zeroizing::new(secret.into()))
    }

    /// Load an unencrypted OpenSSH private key.
    pub fn load_key(path: &Path) -> Result<Self> {
        let key = russh::keys::load_secret_key(path, None).map_err(|e| {
            SessionError::AuthenticationFailed(format!(
                "cannot load identity {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Self::Key(key))
    }
}

impl std::fmt::Debug for ClientCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(..)"),
            Self::Key(key) => write!(f, "Key({})", fingerprint(key.public_key())),
        }
    }
}

/// Accepts any host key and logs its fingerprint.
///
/// The peer is already authenticated by its node id on the transport.
pub struct ClientHandler {
    peer: String,
}

impl ClientHandler {
    pub fn new(peer: impl Into<String>) -> Self {
        Self { peer: peer.into() }
    }
}

impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        tracing::debug!(
            peer = %self.peer,
            host_key = %fingerprint(server_public_key),
            "Server host key"
        );
        Ok(true)
    }
}

/// Run the SSH handshake over `stream` and authenticate as `user`.
pub async fn handshake(
    stream: BoxedStream,
    peer: &str,
    user: &str,
    credential: ClientCredential,
) -> Result<Handle<ClientHandler>> {
    let config = Arc::new(client::Config::default());
    let mut handle = client::connect_stream(config, stream, ClientHandler::new(peer))
        .await
        .map_err(|e| SessionError::AuthenticationFailed(format!("handshake failed: {}", e)))?;

    let result = match credential {
        ClientCredential::Password(secret) => handle
            .authenticate_password(user, secret.as_str())
            .await,
        ClientCredential::Key(key) => {
            let key = PrivateKeyWithHashAlg::new(Arc::new(key), None);
            handle.authenticate_publickey(user, key).await
        }
    }
    .map_err(|e| SessionError::AuthenticationFailed(e.to_string()))?;

    match result {
        AuthResult::Success => {
            tracing::debug!(peer = %peer, user = %user, "Authenticated");
            Ok(handle)
        }
        AuthResult::Failure {
            remaining_methods, ..
        } => Err(SessionError::AuthenticationFailed(format!(
            "rejected by server, remaining methods: {:?}",
            remaining_methods
        ))),
    }
}

/// Open the session channel and start pumping it.
pub async fn open_session(handle: &Handle<ClientHandler>) -> Result<SessionChannel> {
    let channel = handle
        .channel_open_session()
        .await
        .map_err(|e| SessionError::ChannelRejected(e.to_string()))?;
    tracing::debug!(channel = ?channel.id(), "Session channel open");

    let (bridge_end, engine_end) = pair(DEFAULT_WINDOW_SIZE);
    tokio::spawn(pump(channel, engine_end).instrument(tracing::Span::current()));
    Ok(bridge_end)
}

/// Move messages between the russh channel and the engine end of a pair
/// until the server closes the channel.
async fn pump(mut channel: Channel<Msg>, engine: SessionChannel) {
    let SessionChannel {
        data,
        mut extended,
        mut requests,
        control,
    } = engine;
    let (mut data_rd, mut data_wr) = tokio::io::split(data);
    let mut pending: VecDeque<oneshot::Sender<bool>> = VecDeque::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut input_open = true;
    let mut requests_open = true;

    loop {
        tokio::select! {
            msg = channel.wait() => {
                let Some(msg) = msg else { break };
                match msg {
                    ChannelMsg::Data { data } => {
                        if let Err(e) = data_wr.write_all(&data).await {
                            tracing::debug!(error = %e, "Dropping channel data");
                        }
                    }
                    ChannelMsg::ExtendedData { data, .. } => {
                        let _ = extended.write_all(&data).await;
                    }
                    ChannelMsg::ExitStatus { exit_status } => {
                        let _ = control
                            .notify(RequestKind::ExitStatus, ExitStatus(exit_status).encode())
                            .await;
                    }
                    ChannelMsg::ExitSignal { signal_name, .. } => {
                        tracing::info!(signal = ?signal_name, "Remote shell killed by signal");
                    }
                    ChannelMsg::Success => {
                        if let Some(reply) = pending.pop_front() {
                            let _ = reply.send(true);
                        }
                    }
                    ChannelMsg::Failure => {
                        if let Some(reply) = pending.pop_front() {
                            let _ = reply.send(false);
                        }
                    }
                    ChannelMsg::Eof => {
                        tracing::debug!("Server sent EOF");
                        let _ = data_wr.shutdown().await;
                        let _ = extended.shutdown().await;
                    }
                    ChannelMsg::Close => break,
                    other => tracing::trace!(msg = ?other, "Ignoring channel message"),
                }
            }
            read = data_rd.read(&mut buf), if input_open => match read {
                Ok(0) | Err(_) => {
                    input_open = false;
                    let _ = channel.eof().await;
                }
                Ok(n) => {
                    if channel.data(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            },
            request = requests.recv(), if requests_open => match request {
                Some(request) => send_request(&channel, request, &mut pending).await,
                None => requests_open = false,
            },
        }
    }

    tracing::debug!("Session channel closed");
    // Unanswered requests count as refused once their reply slots drop.
    drop(pending);
}

/// Send one bridge request on the russh channel.
async fn send_request(
    channel: &Channel<Msg>,
    request: ChannelRequest,
    pending: &mut VecDeque<oneshot::Sender<bool>>,
) {
    let (kind, payload, reply) = request.into_parts();
    let want_reply = reply.is_some();

    let sent = match &kind {
        RequestKind::PtyReq => match PtyRequest::decode(&payload) {
            Ok(pty) => {
                channel
                    .request_pty(
                        want_reply,
                        &pty.term,
                        pty.dimensions.width as u32,
                        pty.dimensions.height as u32,
                        pty.pixel_width,
                        pty.pixel_height,
                        &modes_to_russh(&pty.modes),
                    )
                    .await
            }
            Err(e) => {
                tracing::warn!(error = %e, "Malformed pty-req from session");
                return;
            }
        },
        RequestKind::Shell => channel.request_shell(want_reply).await,
        RequestKind::Exec => match Request::decode(&kind, &payload) {
            Ok(Request::Exec(command)) => channel.exec(want_reply, command).await,
            _ => return,
        },
        RequestKind::WindowChange => match WindowChange::decode(&payload) {
            Ok(change) => {
                let sent = channel
                    .window_change(
                        change.dimensions.width as u32,
                        change.dimensions.height as u32,
                        change.pixel_width,
                        change.pixel_height,
                    )
                    .await;
                // window-change never gets an answer on the wire.
                if let Some(reply) = reply {
                    let _ = reply.send(sent.is_ok());
                }
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Malformed window-change from session");
                return;
            }
        },
        other => {
            tracing::debug!(request = %other, "Not forwarding request");
            return;
        }
    };

    match (sent, reply) {
        (Ok(()), Some(reply)) => pending.push_back(reply),
        (Err(e), _) => tracing::debug!(request = %kind, error = %e, "Failed to send request"),
        (Ok(()), None) => {}
    }
}
