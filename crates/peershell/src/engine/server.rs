//! russh server adapter.
//!
//! One [`ServerHandler`] per accepted stream. After authentication it
//! accepts a single "session" channel, spawns the login PTY and runs a
//! [`ServerSession`] on the bridge end of a [`pair`]. The engine
//! end is pumped to and from russh:
//!
//! ```text
//!  russh callbacks ──data──> inbound writer ──> bridge
//!                  ──reqs──> RequestSender  ──> bridge dispatch
//!  russh Handle   <──data─── outbound pump  <── bridge
//!                 <─replies─ reply queue    <── bridge dispatch
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use protocol::wire::put_string;
use protocol::{ExitStatus, PtyRequest, Request, RequestKind, TerminalDimensions, WindowChange};
use russh::keys::{PrivateKey, PublicKey};
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodKind, MethodSet, Pty, Sig};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::modes_from_russh;
use crate::auth::{fingerprint, CredentialVerifier};
use crate::channel::{pair, ChannelRequest, RequestSender, SessionChannel, DEFAULT_WINDOW_SIZE};
use crate::network::BoxedStream;
use crate::session::{PtyHost, ServerSession, ServerSessionOptions};

const READ_BUFFER_SIZE: usize = 4096;

/// Client data chunks buffered ahead of the PTY.
const INBOUND_QUEUE_DEPTH: usize = 64;

/// Everything a connection handler needs, shared by all connections.
pub struct ServerContext {
    pub verifier: CredentialVerifier,
    pub pty_host: PtyHost,
    pub session_options: ServerSessionOptions,
    pub password_auth: bool,
    pub publickey_auth: bool,
    /// Cancelled on server shutdown; tears down every running session.
    pub cancel: CancellationToken,
}

impl ServerContext {
    /// Authentication methods offered to clients.
    fn methods(&self) -> MethodSet {
        let mut kinds = Vec::new();
        if self.publickey_auth {
            kinds.push(MethodKind::PublicKey);
        }
        if self.password_auth {
            kinds.push(MethodKind::Password);
        }
        MethodSet::from(&kinds[..])
    }
}

/// russh server configuration with `host_key` as the only host key.
pub fn server_config(host_key: PrivateKey, max_auth_attempts: usize) -> russh::server::Config {
    russh::server::Config {
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        max_auth_attempts,
        keys: vec![host_key],
        ..Default::default()
    }
}

/// Run the SSH server side of one accepted stream until it disconnects.
pub async fn serve_connection(
    ctx: Arc<ServerContext>,
    config: Arc<russh::server::Config>,
    peer: String,
    stream: BoxedStream,
) -> anyhow::Result<()> {
    let handler = ServerHandler::new(ctx, peer);
    let running = russh::server::run_stream(config, stream, handler).await?;
    running.await?;
    Ok(())
}

/// The session channel of a connection, as seen from the engine.
struct ActiveChannel {
    id: ChannelId,
    /// Client data towards the bridge. Dropped on client EOF.
    input: Option<mpsc::Sender<Bytes>>,
    /// Requests towards the bridge dispatcher.
    requests: RequestSender,
    /// Pending replies, answered to the client in request order.
    replies: mpsc::UnboundedSender<oneshot::Receiver<bool>>,
}

/// Per-connection russh handler.
pub struct ServerHandler {
    ctx: Arc<ServerContext>,
    peer: String,
    user: Option<String>,
    channel: Option<ActiveChannel>,
    session_opened: bool,
}

impl ServerHandler {
    pub fn new(ctx: Arc<ServerContext>, peer: impl Into<String>) -> Self {
        Self {
            ctx,
            peer: peer.into(),
            user: None,
            channel: None,
            session_opened: false,
        }
    }

    fn reject(&self) -> Auth {
        Auth::Reject {
            proceed_with_methods: Some(self.ctx.methods()),
            partial_success: false,
        }
    }

    async fn key_is_authorized(&self, user: &str, key: &PublicKey) -> bool {
        let ctx = self.ctx.clone();
        let user = user.to_string();
        let key = key.clone();
        let checked =
            tokio::task::spawn_blocking(move || ctx.verifier.verify_public_key(&user, &key)).await;
        match checked {
            Ok(Ok(listed)) => listed,
            Ok(Err(e)) => {
                tracing::warn!(peer = %self.peer, error = %e, "Public key check failed");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "Public key check task failed");
                false
            }
        }
    }

    /// Pass a channel request to the bridge, keeping reply order.
    async fn forward(
        &mut self,
        channel: ChannelId,
        kind: RequestKind,
        payload: Vec<u8>,
        want_reply: bool,
        session: &mut Session,
    ) {
        let Some(active) = self.channel.as_ref().filter(|active| active.id == channel) else {
            tracing::debug!(channel = ?channel, request = %kind, "Request for unknown channel");
            if want_reply {
                let _ = session.channel_failure(channel);
            }
            return;
        };

        if want_reply {
            let (request, reply) = ChannelRequest::with_reply(kind, payload);
            // A request the bridge never sees drops its reply slot, which
            // the reply queue answers as a failure.
            let _ = active.requests.forward(request).await;
            let _ = active.replies.send(reply);
        } else {
            let _ = active
                .requests
                .forward(ChannelRequest::notification(kind, payload))
                .await;
        }
    }

    /// Spawn the PTY and the session bridge for a newly opened channel.
    fn start_session(&mut self, user: String, channel: Channel<Msg>, handle: Handle) -> bool {
        let pty = match self.ctx.pty_host.spawn(&user, TerminalDimensions::default()) {
            Ok(pty) => pty,
            Err(e) => {
                tracing::error!(user = %user, error = %e, "Failed to spawn login process");
                return false;
            }
        };

        // russh mirrors every message into the Channel's own bounded buffer.
        // Nothing reads it here, so drop it rather than let it fill up.
        let id = channel.id();
        drop(channel);
        let (bridge_end, engine_end) = pair(DEFAULT_WINDOW_SIZE);
        let session = ServerSession::new(user.clone(), self.ctx.session_options.clone())
            .with_cancellation(&self.ctx.cancel);
        let span = tracing::info_span!(
            "session",
            session_id = %session.id(),
            user = %user,
            peer = %self.peer
        );

        tokio::spawn(
            async move {
                match session.run(bridge_end, pty).await {
                    Ok(outcome) => {
                        tracing::debug!(reason = %outcome.reason, "Session finished");
                    }
                    Err(e) => tracing::error!(error = %e, "Session failed"),
                }
            }
            .instrument(span.clone()),
        );

        let SessionChannel {
            data,
            extended,
            requests,
            control,
        } = engine_end;
        let (data_rd, data_wr) = tokio::io::split(data);

        let input_tx = spawn_inbound(data_wr, span.clone());

        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        tokio::spawn(answer_replies(handle.clone(), id, reply_rx).instrument(span.clone()));
        tokio::spawn(pump_outbound(handle, id, data_rd, extended, requests).instrument(span));

        self.channel = Some(ActiveChannel {
            id,
            input: Some(input_tx),
            requests: control,
            replies: reply_tx,
        });
        true
    }
}

impl Handler for ServerHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if !self.ctx.password_auth {
            return Ok(self.reject());
        }

        let ctx = self.ctx.clone();
        let name = user.to_string();
        let secret = zeroize::Zeroizing::new(password.to_string());
        let verified =
            tokio::task::spawn_blocking(move || ctx.verifier.verify_password(&name, &secret))
                .await?;

        match verified {
            Ok(()) => {
                tracing::info!(peer = %self.peer, user = %user, "Password authentication accepted");
                self.user = Some(user.to_string());
                Ok(Auth::Accept)
            }
            Err(e) => {
                tracing::warn!(
                    peer = %self.peer,
                    user = %user,
                    error = %e,
                    "Password authentication rejected"
                );
                Ok(self.reject())
            }
        }
    }

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.ctx.publickey_auth && self.key_is_authorized(user, public_key).await {
            Ok(Auth::Accept)
        } else {
            Ok(self.reject())
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if !self.ctx.publickey_auth || !self.key_is_authorized(user, public_key).await {
            tracing::warn!(peer = %self.peer, user = %user, "Public key authentication rejected");
            return Ok(self.reject());
        }

        tracing::info!(
            peer = %self.peer,
            user = %user,
            pubkey_fp = %fingerprint(public_key),
            "Public key authentication accepted"
        );
        self.user = Some(user.to_string());
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.session_opened {
            tracing::warn!(peer = %self.peer, "Rejecting second session channel");
            return Ok(false);
        }
        let Some(user) = self.user.clone() else {
            return Ok(false);
        };

        self.session_opened = true;
        Ok(self.start_session(user, channel, session.handle()))
    }

    async fn channel_open_x11(
        &mut self,
        _channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(peer = %self.peer, "Rejecting x11 channel");
        Ok(false)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(peer = %self.peer, "Rejecting direct-tcpip channel");
        Ok(false)
    }

    async fn tcpip_forward(
        &mut self,
        _address: &str,
        _port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(peer = %self.peer, "Ignoring tcpip-forward request");
        Ok(false)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = PtyRequest {
            term: term.to_string(),
            dimensions: TerminalDimensions::from_wire(col_width, row_height),
            pixel_width: pix_width,
            pixel_height: pix_height,
            modes: modes_from_russh(modes),
        };
        self.forward(channel, RequestKind::PtyReq, request.encode(), true, session)
            .await;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, RequestKind::Shell, Vec::new(), true, session)
            .await;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, RequestKind::Exec, Request::encode_exec(data), true, session)
            .await;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let change = WindowChange {
            dimensions: TerminalDimensions::from_wire(col_width, row_height),
            pixel_width: pix_width,
            pixel_height: pix_height,
        };
        self.forward(channel, RequestKind::WindowChange, change.encode(), false, session)
            .await;
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut payload = BytesMut::new();
        put_string(&mut payload, format!("{:?}", signal).as_bytes());
        self.forward(channel, RequestKind::Signal, payload.to_vec(), false, session)
            .await;
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(active) = self.channel.as_ref().filter(|active| active.id == channel) {
            if let Some(input) = &active.input {
                // Blocks the connection while the shell is not reading.
                let _ = input.send(Bytes::copy_from_slice(data)).await;
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(active) = self.channel.as_mut().filter(|active| active.id == channel) {
            tracing::debug!(channel = ?channel, "Client sent EOF");
            active.input = None;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.channel.as_ref().is_some_and(|active| active.id == channel) {
            tracing::debug!(channel = ?channel, "Client closed channel");
            self.channel = None;
        }
        Ok(())
    }
}

/// Feed client data into the bridge through a bounded queue.
fn spawn_inbound<W>(mut writer: W, span: tracing::Span) -> mpsc::Sender<Bytes>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (input_tx, mut input_rx) = mpsc::channel::<Bytes>(INBOUND_QUEUE_DEPTH);
    tokio::spawn(
        async move {
            while let Some(chunk) = input_rx.recv().await {
                if writer.write_all(&chunk).await.is_err() {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        }
        .instrument(span),
    );
    input_tx
}

/// Answer channel requests in the order they arrived.
async fn answer_replies(
    handle: Handle,
    channel: ChannelId,
    mut replies: mpsc::UnboundedReceiver<oneshot::Receiver<bool>>,
) {
    while let Some(reply) = replies.recv().await {
        let ok = reply.await.unwrap_or(false);
        let sent = if ok {
            handle.channel_success(channel).await
        } else {
            handle.channel_failure(channel).await
        };
        if sent.is_err() {
            break;
        }
    }
}

/// Bridge output to the client: data, then EOF, plus the exit status;
/// the channel closes once both are done.
async fn pump_outbound<R>(
    handle: Handle,
    channel: ChannelId,
    data: R,
    extended: tokio::io::DuplexStream,
    mut requests: mpsc::Receiver<ChannelRequest>,
) where
    R: AsyncRead + Unpin,
{
    let output = async {
        tokio::join!(
            copy_to_channel(&handle, channel, data, None),
            copy_to_channel(&handle, channel, extended, Some(1)),
        );
        let _ = handle.eof(channel).await;
    };

    let control = async {
        while let Some(request) = requests.recv().await {
            match request.kind() {
                RequestKind::ExitStatus => match ExitStatus::decode(request.payload()) {
                    Ok(ExitStatus(code)) => {
                        let _ = handle.exit_status_request(channel, code).await;
                        request.reply(true);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Malformed exit-status from session");
                        request.reply(false);
                    }
                },
                other => {
                    tracing::debug!(request = %other, "Dropping outbound request");
                    request.reply(false);
                }
            }
        }
    };

    tokio::join!(output, control);
    let _ = handle.close(channel).await;
    tracing::debug!(channel = ?channel, "Channel closed");
}

/// Copy a bridge stream into channel data, or extended data of type `ext`.
async fn copy_to_channel<R>(handle: &Handle, channel: ChannelId, mut source: R, ext: Option<u32>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = match source.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        let chunk = CryptoVec::from_slice(&buf[..n]);
        let sent = match ext {
            Some(ext) => handle.extended_data(channel, ext, chunk).await,
            None => handle.data(channel, chunk).await,
        };
        if sent.is_err() {
            return;
        }
    }
}
