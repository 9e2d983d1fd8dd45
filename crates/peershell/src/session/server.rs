//! Server side of the session bridge: channel on one end, PTY on the other.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use protocol::{ExitStatus, PtyRequest, RequestKind, TerminalDimensions, WindowChange};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::pty::{PtyHandle, PtyResizer};
use super::state::{
    CloseReason, Role, SessionOutcome, SessionState, SharedDimensions, StateCell, TeardownGuard,
};
use crate::channel::{ChannelRequest, SessionChannel};
use crate::error::Result;

/// Buffer size for reads from either side.
const READ_BUFFER_SIZE: usize = 4096;

/// Chunks buffered between the PTY threads and the async copy tasks.
const COPY_QUEUE_DEPTH: usize = 64;

/// Tunables for a server session.
#[derive(Debug, Clone)]
pub struct ServerSessionOptions {
    /// Written to the channel before any PTY output.
    pub motd: Option<Vec<u8>>,
    /// How long output may keep draining after the process exits.
    pub drain_timeout: Duration,
    /// How long to wait for the child to exit before killing it.
    pub reap_grace: Duration,
}

impl Default for ServerSessionOptions {
    fn default() -> Self {
        Self {
            motd: None,
            drain_timeout: Duration::from_millis(500),
            reap_grace: Duration::from_millis(500),
        }
    }
}

/// One interactive session served from a PTY.
pub struct ServerSession {
    id: String,
    user: String,
    state: StateCell,
    guard: Arc<TeardownGuard>,
    dims: Arc<SharedDimensions>,
    options: ServerSessionOptions,
}

impl ServerSession {
    pub fn new(user: impl Into<String>, options: ServerSessionOptions) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user: user.into(),
            state: StateCell::new(),
            guard: Arc::new(TeardownGuard::new()),
            dims: Arc::new(SharedDimensions::new(TerminalDimensions::default())),
            options,
        }
    }

    /// Tear the session down when `token` is cancelled.
    pub fn with_cancellation(mut self, token: &CancellationToken) -> Self {
        self.guard = Arc::new(TeardownGuard::with_token(token.child_token()));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        Role::Server
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Last dimensions applied to the PTY.
    pub fn dimensions(&self) -> watch::Receiver<TerminalDimensions> {
        self.dims.subscribe()
    }

    /// Bridge `channel` and `pty` until either side ends.
    pub async fn run(self, channel: SessionChannel, mut pty: PtyHandle) -> Result<SessionOutcome> {
        tracing::info!(user = %self.user, pid = ?pty.pid(), "Session started");

        let SessionChannel {
            data,
            extended,
            requests,
            control,
        } = channel;
        // PTY output already interleaves stderr.
        drop(extended);
        let (mut chan_rd, mut chan_wr) = tokio::io::split(data);

        let resizer = pty.resizer();
        let (pty_reader, pty_writer) = pty.take_io()?;
        let mut waiter = pty.start_waiter()?;
        self.state.advance(SessionState::Active);

        if let Some(motd) = &self.options.motd {
            if let Err(e) = chan_wr.write_all(motd).await {
                tracing::debug!(error = %e, "Failed to write MOTD");
            }
        }

        let span = tracing::Span::current();

        // PTY -> channel
        let output_rx = spawn_pty_reader(pty_reader);
        let output = tokio::spawn(
            {
                let guard = self.guard.clone();
                async move {
                    let mut output_rx = output_rx;
                    while let Some(chunk) = output_rx.recv().await {
                        if let Err(e) = chan_wr.write_all(&chunk).await {
                            tracing::debug!(error = %e, "Channel write failed");
                            guard.fire(CloseReason::RemoteEof);
                            return;
                        }
                    }
                    tracing::debug!("PTY output reached EOF");
                    let _ = chan_wr.shutdown().await;
                    guard.fire(CloseReason::LocalEof);
                }
            }
            .instrument(span.clone()),
        );

        // channel -> PTY
        let input_tx = spawn_pty_writer(pty_writer, self.guard.clone());
        let input = tokio::spawn(
            {
                let guard = self.guard.clone();
                async move {
                    let mut buf = vec![0u8; READ_BUFFER_SIZE];
                    loop {
                        tokio::select! {
                            _ = guard.fired() => break,
                            read = chan_rd.read(&mut buf) => match read {
                                Ok(0) => {
                                    tracing::debug!("Channel input reached EOF");
                                    guard.fire(CloseReason::RemoteEof);
                                    break;
                                }
                                Ok(n) => {
                                    if input_tx.send(buf[..n].to_vec()).await.is_err() {
                                        guard.fire(CloseReason::LocalEof);
                                        break;
                                    }
                                }
                                Err(e) => {
                                    tracing::debug!(error = %e, "Channel read failed");
                                    guard.fire(CloseReason::RemoteEof);
                                    break;
                                }
                            }
                        }
                    }
                    chan_rd
                }
            }
            .instrument(span.clone()),
        );

        let dispatch = tokio::spawn(
            dispatch_requests(requests, resizer.clone(), self.dims.clone(), self.guard.clone())
                .instrument(span.clone()),
        );

        tokio::select! {
            _ = self.guard.fired() => {}
            _ = waiter.exited() => {
                self.guard.fire(CloseReason::ProcessExited);
            }
        }
        let reason = self.guard.reason().unwrap_or(CloseReason::Cancelled);
        self.state.advance(SessionState::Closing);
        tracing::debug!(reason = %reason, "Session closing");

        // Stop control dispatch.
        dispatch.abort();
        let _ = dispatch.await;

        // Let buffered output reach the client when the process ended on its
        // own, then close the data stream.
        let output = if matches!(reason, CloseReason::ProcessExited | CloseReason::LocalEof) {
            drain(output, self.options.drain_timeout).await
        } else {
            output
        };
        output.abort();
        let _ = output.await;
        let chan_rd = input.await.ok();
        drop(chan_rd);

        // Reap the child, then report its status before the channel closes.
        let exit_status = match waiter.reap(self.options.reap_grace).await {
            Ok(code) => {
                if code != 0 {
                    tracing::warn!(exit_code = code, "Shell exited with non-zero status");
                }
                Some(code)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to reap shell process");
                None
            }
        };
        if let Some(code) = exit_status {
            if let Err(e) = control
                .notify(RequestKind::ExitStatus, ExitStatus(code).encode())
                .await
            {
                tracing::debug!(error = %e, "Could not send exit status");
            }
        }
        drop(control);

        // The PTY master goes last.
        drop(resizer);
        drop(pty);

        self.state.advance(SessionState::Closed);
        tracing::info!(reason = %reason, exit_status = ?exit_status, "Session closed");

        Ok(SessionOutcome {
            exit_status,
            reason,
        })
    }
}

/// Wait up to `timeout` for `task` to finish by itself.
async fn drain(mut task: JoinHandle<()>, timeout: Duration) -> JoinHandle<()> {
    if tokio::time::timeout(timeout, &mut task).await.is_err() {
        tracing::debug!("Output drain timed out");
    }
    task
}

/// Move blocking PTY reads onto a thread and surface them as a stream.
fn spawn_pty_reader(mut reader: Box<dyn Read + Send>) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel(COPY_QUEUE_DEPTH);
    let spawned = std::thread::Builder::new()
        .name("pty-reader".to_string())
        .spawn(move || {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    // EIO once the slave side is closed.
                    Err(_) => break,
                }
            }
        });
    if let Err(e) = spawned {
        tracing::error!(error = %e, "Failed to start PTY reader thread");
    }
    rx
}

/// Move blocking PTY writes onto a thread.
fn spawn_pty_writer(
    mut writer: Box<dyn Write + Send>,
    guard: Arc<TeardownGuard>,
) -> mpsc::Sender<Vec<u8>> {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(COPY_QUEUE_DEPTH);
    let spawned = std::thread::Builder::new()
        .name("pty-writer".to_string())
        .spawn(move || {
            while let Some(chunk) = rx.blocking_recv() {
                if let Err(e) = writer.write_all(&chunk).and_then(|_| writer.flush()) {
                    tracing::debug!(error = %e, "PTY write failed");
                    guard.fire(CloseReason::LocalEof);
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        tracing::error!(error = %e, "Failed to start PTY writer thread");
    }
    tx
}

/// Handle out-of-band requests in arrival order until teardown.
async fn dispatch_requests(
    mut requests: mpsc::Receiver<ChannelRequest>,
    resizer: PtyResizer,
    dims: Arc<SharedDimensions>,
    guard: Arc<TeardownGuard>,
) {
    loop {
        let request = tokio::select! {
            _ = guard.fired() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        handle_request(request, &resizer, &dims);
    }
}

fn handle_request(request: ChannelRequest, resizer: &PtyResizer, dims: &SharedDimensions) {
    match request.kind() {
        RequestKind::Shell => {
            if request.payload().is_empty() {
                tracing::debug!("Shell request accepted");
                request.reply(true);
            } else {
                tracing::warn!("Rejecting shell request with a command payload");
                request.reply(false);
            }
        }
        RequestKind::Exec => {
            tracing::warn!("Rejecting exec request, only the default shell is supported");
            request.reply(false);
        }
        RequestKind::PtyReq => match PtyRequest::decode(request.payload()) {
            Ok(pty_req) => {
                tracing::debug!(term = %pty_req.term, size = %pty_req.dimensions, "PTY request");
                apply_resize(resizer, dims, pty_req.dimensions);
                request.reply(true);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Malformed pty-req");
                request.reply(false);
            }
        },
        RequestKind::WindowChange => match WindowChange::decode(request.payload()) {
            Ok(change) => {
                apply_resize(resizer, dims, change.dimensions);
                request.reply(true);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Malformed window-change");
                request.reply(false);
            }
        },
        other => {
            tracing::debug!(request = %other, "Ignoring unsupported request");
            request.reply(false);
        }
    }
}

/// Resize the PTY. Failures are logged and never end the session.
fn apply_resize(resizer: &PtyResizer, dims: &SharedDimensions, new: TerminalDimensions) {
    if !new.is_valid() {
        tracing::warn!(size = %new, "Ignoring resize to an empty terminal");
        return;
    }
    match resizer.resize(new) {
        Ok(()) => {
            if dims.update(new) {
                tracing::debug!(size = %new, "Resized PTY");
            }
        }
        Err(e) => tracing::warn!(error = %e, size = %new, "Failed to resize PTY"),
    }
}
