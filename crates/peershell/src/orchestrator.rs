//! Connect and listen orchestrators.
//!
//! These wire the components together. [`connect`] drives one client
//! session from stream to shell exit. A [`Server`] accepts streams and
//! serves each one on its own task. Every connection runs inside a
//! `tracing` span created here.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use russh::client::Handle;
use russh::keys::PrivateKey;
use russh::Disconnect;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument};

use crate::auth::CredentialVerifier;
use crate::config::{Config, ServerConfig};
use crate::engine::server::server_config;
use crate::engine::{
    handshake, open_session, serve_connection, ClientCredential, ClientHandler, ServerContext,
};
use crate::error::Result;
use crate::identity::{load_or_generate_host_key, load_or_generate_node_key};
use crate::network::{IrohConfig, IrohTransport, Transport};
use crate::session::{
    os_interrupts, ClientSession, ClientSessionConfig, CloseReason, LocalIo, LoginCommand,
    PtyHost, ServerSessionOptions, SessionOutcome,
};
use crate::terminal::{local_terminal, Terminal};

/// How long [`Server::shutdown`] waits for running connections.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Who to connect to, as whom, and how the session should look.
#[derive(Debug)]
pub struct ConnectRequest {
    pub peer: String,
    pub user: String,
    pub credential: ClientCredential,
    pub protocol_id: String,
    pub session: ClientSessionConfig,
}

impl ConnectRequest {
    pub fn new(
        peer: impl Into<String>,
        user: impl Into<String>,
        credential: ClientCredential,
    ) -> Self {
        Self {
            peer: peer.into(),
            user: user.into(),
            credential,
            protocol_id: protocol::PROTOCOL_ID.to_string(),
            session: ClientSessionConfig::default(),
        }
    }

    /// Take the protocol id and session settings from `config`.
    pub fn from_config(
        config: &Config,
        peer: impl Into<String>,
        credential: ClientCredential,
    ) -> Self {
        Self {
            peer: peer.into(),
            user: config.client.user.clone(),
            credential,
            protocol_id: config.network.protocol_id.clone(),
            session: ClientSessionConfig {
                term: config.client.term.clone(),
                poll_interval: config.resize_poll_interval(),
                ..Default::default()
            },
        }
    }
}

/// The local side a client session is attached to.
pub struct LocalAttachment {
    pub terminal: Arc<dyn Terminal>,
    pub io: LocalIo,
    pub interrupts: mpsc::Receiver<()>,
}

impl LocalAttachment {
    /// This process's terminal, stdio and SIGINT.
    pub fn process(cancel: &CancellationToken) -> Result<Self> {
        Ok(Self {
            terminal: local_terminal()?,
            io: LocalIo::stdio(),
            interrupts: os_interrupts(cancel.child_token()),
        })
    }
}

/// Connect to `request.peer` and run an interactive session until it ends.
///
/// Setup errors are returned before the local terminal is touched.
/// Cancelling `cancel` ends the session at any stage; the outcome then
/// reports [`CloseReason::Cancelled`].
pub async fn connect(
    transport: &dyn Transport,
    request: ConnectRequest,
    local: LocalAttachment,
    cancel: &CancellationToken,
) -> Result<SessionOutcome> {
    let span = tracing::info_span!("connect", peer = %request.peer, user = %request.user);

    async move {
        let ConnectRequest {
            peer,
            user,
            credential,
            protocol_id,
            session,
        } = request;

        let setup = async {
            debug!(protocol = %protocol_id, "Connecting");
            let stream = transport.open_stream(&peer, &protocol_id).await?;
            let handle = handshake(stream, &peer, &user, credential).await?;
            match open_session(&handle).await {
                Ok(channel) => Ok((handle, channel)),
                Err(e) => {
                    disconnect(&handle).await;
                    Err(e)
                }
            }
        };

        let (handle, channel) = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Cancelled before the session started");
                return Ok(SessionOutcome {
                    exit_status: None,
                    reason: CloseReason::Cancelled,
                });
            }
            setup = setup => setup?,
        };

        let session = ClientSession::new(local.terminal, session, cancel);
        debug!(session_id = %session.id(), "Starting session");
        let outcome = session.run(channel, local.io, local.interrupts).await;
        disconnect(&handle).await;
        outcome
    }
    .instrument(span)
    .await
}

async fn disconnect(handle: &Handle<ClientHandler>) {
    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, "session closed", "en")
        .await
    {
        debug!(error = %e, "Disconnect failed");
    }
}

/// Accepts session streams and serves each on its own task.
pub struct Server {
    ctx: Arc<ServerContext>,
    ssh_config: Arc<russh::server::Config>,
    protocol_id: String,
    tracker: TaskTracker,
}

impl Server {
    pub fn new(
        ctx: ServerContext,
        host_key: PrivateKey,
        max_auth_attempts: usize,
        protocol_id: impl Into<String>,
    ) -> Self {
        Self {
            ctx: Arc::new(ctx),
            ssh_config: Arc::new(server_config(host_key, max_auth_attempts)),
            protocol_id: protocol_id.into(),
            tracker: TaskTracker::new(),
        }
    }

    /// Build a server from the `[server]` section, loading or generating
    /// the host key.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let host_key = load_or_generate_host_key(&config.host_key_path())?;
        let login = LoginCommand::new(config.server.login_command.clone())
            .context("Invalid login command")?;

        let ctx = ServerContext {
            verifier: CredentialVerifier::new(
                config.server.shadow_path.clone(),
                config.server.authorized_keys_path.clone(),
            ),
            pty_host: PtyHost::new(login),
            session_options: ServerSessionOptions {
                motd: load_motd(&config.server),
                ..Default::default()
            },
            password_auth: config.server.password_auth,
            publickey_auth: config.server.publickey_auth,
            cancel: CancellationToken::new(),
        };

        Ok(Self::new(
            ctx,
            host_key,
            config.server.max_auth_attempts,
            config.network.protocol_id.clone(),
        ))
    }

    /// Cancelled when the server shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.ctx.cancel.clone()
    }

    /// Accept streams from `transport` until shutdown or until the
    /// transport closes.
    pub async fn listen(&self, transport: &dyn Transport) -> Result<()> {
        let mut listener = transport.listen(&self.protocol_id).await?;
        info!(
            protocol = %self.protocol_id,
            local_peer = %transport.local_peer_id(),
            "Listening for sessions"
        );

        loop {
            let incoming = tokio::select! {
                _ = self.ctx.cancel.cancelled() => break,
                incoming = listener.accept() => incoming,
            };
            let Some((peer, stream)) = incoming else {
                info!("Transport closed, no more streams");
                break;
            };

            let span = tracing::info_span!("connection", peer = %peer);
            let ctx = Arc::clone(&self.ctx);
            let ssh_config = Arc::clone(&self.ssh_config);
            self.tracker.spawn(
                async move {
                    info!("Accepted stream");
                    match serve_connection(ctx, ssh_config, peer, stream).await {
                        Ok(()) => debug!("Connection closed"),
                        Err(e) => warn!(error = %e, "Connection ended with error"),
                    }
                }
                .instrument(span),
            );
        }

        Ok(())
    }

    /// Stop accepting, tear down running sessions and wait up to `grace`
    /// for their connections to finish.
    pub async fn shutdown(&self, grace: Duration) {
        info!(active = self.tracker.len(), "Shutting down server");
        self.ctx.cancel.cancel();
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(remaining = self.tracker.len(), "Connections still open after shutdown grace");
        }
    }
}

/// The message of the day, when enabled and readable.
fn load_motd(server: &ServerConfig) -> Option<Vec<u8>> {
    if !server.print_motd {
        return None;
    }
    read_motd(&server.motd_path)
}

fn read_motd(path: &Path) -> Option<Vec<u8>> {
    match std::fs::read(path) {
        Ok(contents) if contents.is_empty() => None,
        Ok(contents) => Some(contents),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot read motd");
            None
        }
    }
}

/// Bind an iroh endpoint with the persistent node key and the `[network]`
/// settings.
pub async fn bind_iroh(config: &Config) -> anyhow::Result<IrohTransport> {
    let secret_key = load_or_generate_node_key(&config.node_key_path())?;
    let iroh_config = IrohConfig {
        protocols: vec![config.network.protocol_id.clone()],
        relay_url: config.relay_url(),
        connect_timeout: config.connect_timeout(),
        local_only: false,
    };
    IrohTransport::bind(secret_key, iroh_config)
        .await
        .context("Failed to bind iroh endpoint")
}
