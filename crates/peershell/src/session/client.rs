//! Client side of the session bridge: local terminal on one end, channel
//! on the other.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use protocol::{
    ExitStatus, PtyRequest, RequestKind, TerminalDimensions, TerminalModes, WindowChange,
    DEFAULT_TERM, INTERRUPT_BYTE,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::state::{
    CloseReason, Role, SessionOutcome, SessionState, SharedDimensions, StateCell, TeardownGuard,
};
use crate::channel::{ChannelRequest, RequestSender, SessionChannel};
use crate::error::{Result, SessionError};
use crate::terminal::{RawModeGuard, Terminal};

const READ_BUFFER_SIZE: usize = 4096;

/// Chunks of local input queued for the channel writer.
const INPUT_QUEUE_DEPTH: usize = 64;

/// How long teardown waits for output and a trailing exit status.
const FLUSH_TIMEOUT: Duration = Duration::from_millis(200);

/// Local byte streams a client session is attached to.
pub struct LocalIo {
    pub stdin: Box<dyn AsyncRead + Send + Unpin>,
    pub stdout: Box<dyn AsyncWrite + Send + Unpin>,
    pub stderr: Box<dyn AsyncWrite + Send + Unpin>,
}

impl LocalIo {
    /// The process's own stdin, stdout and stderr.
    pub fn stdio() -> Self {
        Self {
            stdin: Box::new(tokio::io::stdin()),
            stdout: Box::new(tokio::io::stdout()),
            stderr: Box::new(tokio::io::stderr()),
        }
    }
}

/// Settings for a client session.
#[derive(Debug, Clone)]
pub struct ClientSessionConfig {
    /// Terminal type requested for the remote PTY.
    pub term: String,
    /// Terminal modes sent with the PTY request.
    pub modes: TerminalModes,
    /// How often the local terminal size is checked.
    pub poll_interval: Duration,
}

impl Default for ClientSessionConfig {
    fn default() -> Self {
        Self {
            term: DEFAULT_TERM.to_string(),
            modes: TerminalModes::default_session(),
            poll_interval: Duration::from_millis(1),
        }
    }
}

/// One interactive session attached to the local terminal.
pub struct ClientSession {
    id: String,
    config: ClientSessionConfig,
    terminal: Arc<dyn Terminal>,
    state: StateCell,
    guard: Arc<TeardownGuard>,
    dims: Arc<SharedDimensions>,
}

/// Background tasks of a running client session.
struct Tasks {
    writer: JoinHandle<()>,
    stdin: JoinHandle<()>,
    stdout: JoinHandle<()>,
    stderr: JoinHandle<()>,
    requests: JoinHandle<()>,
    resize: Option<JoinHandle<()>>,
    interrupt: Option<JoinHandle<()>>,
}

impl ClientSession {
    /// `cancel` aborts the session from outside; cancelling it makes
    /// [`run`](Self::run) return within one poll interval.
    pub fn new(
        terminal: Arc<dyn Terminal>,
        config: ClientSessionConfig,
        cancel: &CancellationToken,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            config,
            terminal,
            state: StateCell::new(),
            guard: Arc::new(TeardownGuard::with_token(cancel.child_token())),
            dims: Arc::new(SharedDimensions::new(TerminalDimensions::default())),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        Role::Client
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Run the session until the remote ends it, local input ends, or the
    /// caller cancels.
    ///
    /// Raw mode is never left enabled when this returns.
    pub async fn run(
        self,
        channel: SessionChannel,
        io: LocalIo,
        interrupts: mpsc::Receiver<()>,
    ) -> Result<SessionOutcome> {
        let SessionChannel {
            data,
            extended,
            requests,
            control,
        } = channel;
        let exit_status = Arc::new(Mutex::new(None));
        let (input_tx, mut tasks) = self.wire(data, extended, requests, io, exit_status.clone());

        let raw = match self.setup(&control, &mut tasks, &input_tx, interrupts).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                // Torn down before the shell started.
                let reason = self.guard.reason().unwrap_or(CloseReason::Cancelled);
                self.teardown(tasks, input_tx, None).await;
                return Ok(SessionOutcome {
                    exit_status: None,
                    reason,
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "Session setup failed");
                self.guard.fire(CloseReason::SetupFailed);
                self.teardown(tasks, input_tx, None).await;
                return Err(e);
            }
        };

        self.state.advance(SessionState::Active);
        tracing::debug!(size = %self.dims.get(), "Session active");

        self.guard.fired().await;
        let reason = self.guard.reason().unwrap_or(CloseReason::Cancelled);
        drop(control);
        self.teardown(tasks, input_tx, Some(raw)).await;

        let exit_status = exit_status.lock().ok().and_then(|status| *status);
        tracing::debug!(reason = %reason, exit_status = ?exit_status, "Session closed");
        Ok(SessionOutcome {
            exit_status,
            reason,
        })
    }

    /// Start the copy tasks. Local input is queued until the shell starts.
    fn wire(
        &self,
        data: tokio::io::DuplexStream,
        extended: tokio::io::DuplexStream,
        requests: mpsc::Receiver<ChannelRequest>,
        io: LocalIo,
        exit_status: Arc<Mutex<Option<u32>>>,
    ) -> (mpsc::Sender<Vec<u8>>, Tasks) {
        let span = tracing::Span::current();
        let (mut chan_rd, mut chan_wr) = tokio::io::split(data);
        let LocalIo {
            mut stdin,
            mut stdout,
            mut stderr,
        } = io;
        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(INPUT_QUEUE_DEPTH);

        // Single writer into the channel, fed by stdin and the interrupt task.
        let writer = {
            let guard = self.guard.clone();
            tokio::spawn(
                async move {
                    while let Some(chunk) = input_rx.recv().await {
                        if let Err(e) = chan_wr.write_all(&chunk).await {
                            tracing::debug!(error = %e, "Channel write failed");
                            guard.fire(CloseReason::RemoteEof);
                            return;
                        }
                    }
                    let _ = chan_wr.shutdown().await;
                }
                .instrument(span.clone()),
            )
        };

        let stdin = {
            let guard = self.guard.clone();
            let input_tx = input_tx.clone();
            tokio::spawn(
                async move {
                    let mut buf = vec![0u8; READ_BUFFER_SIZE];
                    loop {
                        let read = tokio::select! {
                            _ = guard.fired() => return,
                            read = stdin.read(&mut buf) => read,
                        };
                        match read {
                            Ok(0) => {
                                tracing::debug!("Local input reached EOF");
                                guard.fire(CloseReason::LocalEof);
                                return;
                            }
                            Ok(n) => {
                                if input_tx.send(buf[..n].to_vec()).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                tracing::debug!(error = %e, "Local input failed");
                                guard.fire(CloseReason::LocalEof);
                                return;
                            }
                        }
                    }
                }
                .instrument(span.clone()),
            )
        };

        let stdout = {
            let guard = self.guard.clone();
            tokio::spawn(
                async move {
                    match copy_flushing(&mut chan_rd, &mut stdout).await {
                        Ok(()) => tracing::debug!("Remote output reached EOF"),
                        Err(e) => tracing::debug!(error = %e, "Remote output failed"),
                    }
                    guard.fire(CloseReason::RemoteEof);
                }
                .instrument(span.clone()),
            )
        };

        let stderr = tokio::spawn(
            async move {
                let mut extended = extended;
                if let Err(e) = copy_flushing(&mut extended, &mut stderr).await {
                    tracing::debug!(error = %e, "Remote stderr failed");
                }
            }
            .instrument(span.clone()),
        );

        let requests = tokio::spawn(
            handle_remote_requests(requests, exit_status).instrument(span.clone()),
        );

        let tasks = Tasks {
            writer,
            stdin,
            stdout,
            stderr,
            requests,
            resize: None,
            interrupt: None,
        };
        (input_tx, tasks)
    }

    /// PTY request, resize polling, raw mode, shell request.
    ///
    /// Returns `Ok(None)` if cancelled first.
    async fn setup(
        &self,
        control: &RequestSender,
        tasks: &mut Tasks,
        input_tx: &mpsc::Sender<Vec<u8>>,
        interrupts: mpsc::Receiver<()>,
    ) -> Result<Option<RawModeGuard>> {
        let dims = self.terminal.size()?;
        if !dims.is_valid() {
            return Err(SessionError::NoTerminalAvailable);
        }
        self.dims.update(dims);

        let pty_req = PtyRequest::new(self.config.term.clone(), dims)
            .with_modes(self.config.modes.clone());
        let granted = tokio::select! {
            _ = self.guard.fired() => return Ok(None),
            granted = control.request(RequestKind::PtyReq, pty_req.encode()) => granted?,
        };
        if !granted {
            return Err(SessionError::PtyRequestRejected);
        }
        tracing::debug!(term = %self.config.term, size = %dims, "PTY granted");

        tasks.resize = Some(tokio::spawn(
            poll_resize(
                self.terminal.clone(),
                self.dims.clone(),
                control.clone(),
                self.config.poll_interval,
                self.guard.token().clone(),
            )
            .instrument(tracing::Span::current()),
        ));

        let raw = RawModeGuard::enable(self.terminal.clone())?;

        let started = tokio::select! {
            _ = self.guard.fired() => return Ok(None),
            started = control.request(RequestKind::Shell, Vec::new()) => started?,
        };
        if !started {
            return Err(SessionError::ShellRejected);
        }

        tasks.interrupt = Some(tokio::spawn(
            forward_interrupts(interrupts, input_tx.clone(), self.guard.clone())
                .instrument(tracing::Span::current()),
        ));

        Ok(Some(raw))
    }

    /// Release everything in order: control tasks, channel, terminal mode.
    async fn teardown(
        &self,
        tasks: Tasks,
        input_tx: mpsc::Sender<Vec<u8>>,
        raw: Option<RawModeGuard>,
    ) {
        self.state.advance(SessionState::Closing);
        let Tasks {
            writer,
            stdin,
            stdout,
            stderr,
            requests,
            resize,
            interrupt,
        } = tasks;

        for task in [resize, interrupt].into_iter().flatten() {
            task.abort();
            let _ = task.await;
        }

        stdin.abort();
        let _ = stdin.await;
        drop(input_tx);

        if self.guard.reason() == Some(CloseReason::Cancelled) {
            // The engine keeps the channel open until we return, so none of
            // these would finish on their own.
            for task in [writer, stdout, stderr, requests] {
                task.abort();
                let _ = task.await;
            }
        } else {
            // Closing our input half lets the writer send EOF. Output already
            // in flight still reaches the user, and an exit status that
            // trails the data is still recorded.
            let deadline = tokio::time::Instant::now() + FLUSH_TIMEOUT;
            tokio::join!(
                finish(writer, deadline),
                finish(stdout, deadline),
                finish(stderr, deadline),
                finish(requests, deadline),
            );
        }

        if let Some(raw) = raw {
            if let Err(e) = raw.restore() {
                tracing::warn!(error = %e, "Failed to restore terminal mode");
            }
        }

        self.state.advance(SessionState::Closed);
    }
}

/// Wait until `deadline` for `task`, then abort it.
async fn finish(mut task: JoinHandle<()>, deadline: tokio::time::Instant) {
    if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
        task.abort();
        let _ = task.await;
    }
}

/// Copy until EOF, flushing after every chunk so output shows up as it is
/// produced.
async fn copy_flushing<R, W>(reader: &mut R, writer: &mut W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
    }
}

/// Record the exit status; refuse everything else.
async fn handle_remote_requests(
    mut requests: mpsc::Receiver<ChannelRequest>,
    exit_status: Arc<Mutex<Option<u32>>>,
) {
    while let Some(request) = requests.recv().await {
        match request.kind() {
            RequestKind::ExitStatus => match ExitStatus::decode(request.payload()) {
                Ok(ExitStatus(code)) => {
                    tracing::debug!(exit_status = code, "Remote shell exited");
                    if let Ok(mut slot) = exit_status.lock() {
                        *slot = Some(code);
                    }
                    request.reply(true);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Malformed exit-status");
                    request.reply(false);
                }
            },
            other => {
                tracing::debug!(request = %other, "Ignoring request from server");
                request.reply(false);
            }
        }
    }
}

/// Send a window-change whenever the local terminal size changes.
async fn poll_resize(
    terminal: Arc<dyn Terminal>,
    dims: Arc<SharedDimensions>,
    control: RequestSender,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let current = match terminal.size() {
            Ok(current) if current.is_valid() => current,
            Ok(_) => continue,
            Err(e) => {
                tracing::trace!(error = %e, "Terminal size query failed");
                continue;
            }
        };
        if dims.update(current) {
            tracing::debug!(size = %current, "Local terminal resized");
            let payload = WindowChange::new(current).encode();
            if control
                .notify(RequestKind::WindowChange, payload)
                .await
                .is_err()
            {
                return;
            }
        }
    }
}

/// Turn local interrupts into the interrupt byte on the remote input.
async fn forward_interrupts(
    mut interrupts: mpsc::Receiver<()>,
    input_tx: mpsc::Sender<Vec<u8>>,
    guard: Arc<TeardownGuard>,
) {
    loop {
        tokio::select! {
            _ = guard.fired() => return,
            interrupt = interrupts.recv() => {
                if interrupt.is_none() {
                    return;
                }
            }
        }
        tracing::trace!("Forwarding interrupt");
        if input_tx.send(vec![INTERRUPT_BYTE]).await.is_err() {
            guard.fire(CloseReason::Interrupt);
            return;
        }
    }
}

/// Local interrupt signals (SIGINT) as a stream, until `cancel` fires.
///
/// In raw mode Ctrl-C arrives as a plain input byte; this covers signals
/// delivered from outside the terminal.
#[cfg(unix)]
pub fn os_interrupts(cancel: CancellationToken) -> mpsc::Receiver<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(sigint) => sigint,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGINT handler");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                received = sigint.recv() => {
                    if received.is_none() || tx.send(()).await.is_err() {
                        return;
                    }
                }
            }
        }
    });
    rx
}

#[cfg(not(unix))]
pub fn os_interrupts(cancel: CancellationToken) -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                received = tokio::signal::ctrl_c() => {
                    if received.is_err() || tx.send(()).await.is_err() {
                        return;
                    }
                }
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::pair;
    use crate::terminal::ScriptedTerminal;
    use tokio::time::timeout;

    struct Harness {
        remote: SessionChannel,
        stdin: tokio::io::DuplexStream,
        stdout: tokio::io::DuplexStream,
        interrupts: mpsc::Sender<()>,
        terminal: Arc<ScriptedTerminal>,
        cancel: CancellationToken,
        task: JoinHandle<Result<SessionOutcome>>,
    }

    fn start(terminal: ScriptedTerminal) -> Harness {
        let terminal = Arc::new(terminal);
        let (client_end, remote) = pair(64 * 1024);
        let (stdin, local_stdin) = tokio::io::duplex(1024);
        let (local_stdout, stdout) = tokio::io::duplex(64 * 1024);
        let (interrupts, interrupt_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let io = LocalIo {
            stdin: Box::new(local_stdin),
            stdout: Box::new(local_stdout),
            stderr: Box::new(tokio::io::sink()),
        };
        let session = ClientSession::new(terminal.clone(), ClientSessionConfig::default(), &cancel);
        let task = tokio::spawn(session.run(client_end, io, interrupt_rx));

        Harness {
            remote,
            stdin,
            stdout,
            interrupts,
            terminal,
            cancel,
            task,
        }
    }

    /// Accept the pty-req and shell requests like a server would.
    async fn accept_setup(remote: &mut SessionChannel) -> PtyRequest {
        let request = remote.requests.recv().await.unwrap();
        assert_eq!(request.kind(), &RequestKind::PtyReq);
        let pty_req = PtyRequest::decode(request.payload()).unwrap();
        request.reply(true);

        let request = remote.requests.recv().await.unwrap();
        assert_eq!(request.kind(), &RequestKind::Shell);
        assert!(request.payload().is_empty());
        request.reply(true);
        pty_req
    }

    #[tokio::test]
    async fn test_pty_request_carries_size_and_modes() {
        let mut h = start(ScriptedTerminal::new(TerminalDimensions::new(80, 24)));
        let pty_req = accept_setup(&mut h.remote).await;

        assert_eq!(pty_req.term, DEFAULT_TERM);
        assert_eq!(pty_req.dimensions, TerminalDimensions::new(80, 24));
        assert_eq!(pty_req.modes.get(protocol::ECHO), Some(1));
        assert_eq!(pty_req.modes.get(protocol::TTY_OP_ISPEED), Some(14400));
        assert_eq!(pty_req.modes.get(protocol::TTY_OP_OSPEED), Some(14400));

        h.cancel.cancel();
        timeout(Duration::from_secs(2), h.task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_data_flows_both_ways() {
        let mut h = start(ScriptedTerminal::new(TerminalDimensions::new(80, 24)));
        accept_setup(&mut h.remote).await;

        h.stdin.write_all(b"ls\n").await.unwrap();
        let mut buf = [0u8; 3];
        h.remote.data.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ls\n");

        h.remote.data.write_all(b"file\n").await.unwrap();
        let mut buf = [0u8; 5];
        h.stdout.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"file\n");

        h.cancel.cancel();
        let _ = timeout(Duration::from_secs(2), h.task).await.unwrap();
    }

    #[tokio::test]
    async fn test_resize_sends_window_change_once() {
        let mut h = start(ScriptedTerminal::new(TerminalDimensions::new(80, 24)));
        accept_setup(&mut h.remote).await;

        h.terminal.set_size(TerminalDimensions::new(120, 40));
        let request = timeout(Duration::from_secs(1), h.remote.requests.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.kind(), &RequestKind::WindowChange);
        assert!(!request.want_reply());
        let change = WindowChange::decode(request.payload()).unwrap();
        assert_eq!(change.dimensions, TerminalDimensions::new(120, 40));

        // Unchanged size produces no further notifications.
        let quiet = timeout(Duration::from_millis(50), h.remote.requests.recv()).await;
        assert!(quiet.is_err());

        h.cancel.cancel();
        let _ = timeout(Duration::from_secs(2), h.task).await.unwrap();
    }

    #[tokio::test]
    async fn test_interrupt_forwarded_as_byte() {
        let mut h = start(ScriptedTerminal::new(TerminalDimensions::new(80, 24)));
        accept_setup(&mut h.remote).await;

        h.interrupts.send(()).await.unwrap();
        let mut buf = [0u8; 1];
        h.remote.data.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[0], INTERRUPT_BYTE);

        h.cancel.cancel();
        let _ = timeout(Duration::from_secs(2), h.task).await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_status_recorded() {
        let mut h = start(ScriptedTerminal::new(TerminalDimensions::new(80, 24)));
        accept_setup(&mut h.remote).await;
        assert!(h.terminal.is_raw());

        h.remote
            .control
            .notify(RequestKind::ExitStatus, ExitStatus(5).encode())
            .await
            .unwrap();
        drop(h.remote);

        let outcome = timeout(Duration::from_secs(2), h.task).await.unwrap().unwrap().unwrap();
        assert_eq!(outcome.exit_status, Some(5));
        assert_eq!(outcome.reason, CloseReason::RemoteEof);
        assert!(!h.terminal.is_raw());
    }

    #[tokio::test]
    async fn test_pty_rejection_leaves_terminal_cooked() {
        let mut h = start(ScriptedTerminal::new(TerminalDimensions::new(80, 24)));
        let request = h.remote.requests.recv().await.unwrap();
        request.reply(false);

        let result = timeout(Duration::from_secs(2), h.task).await.unwrap().unwrap();
        assert!(matches!(result, Err(SessionError::PtyRequestRejected)));
        assert!(!h.terminal.is_raw());
        assert_eq!(h.terminal.mode_changes(), 0);
    }

    #[tokio::test]
    async fn test_shell_rejection_restores_terminal() {
        let mut h = start(ScriptedTerminal::new(TerminalDimensions::new(80, 24)));
        h.remote.requests.recv().await.unwrap().reply(true);
        h.remote.requests.recv().await.unwrap().reply(false);

        let result = timeout(Duration::from_secs(2), h.task).await.unwrap().unwrap();
        assert!(matches!(result, Err(SessionError::ShellRejected)));
        assert!(!h.terminal.is_raw());
    }

    #[tokio::test]
    async fn test_no_terminal() {
        let h = start(ScriptedTerminal::detached());
        let result = timeout(Duration::from_secs(2), h.task).await.unwrap().unwrap();
        assert!(matches!(result, Err(SessionError::NoTerminalAvailable)));
    }

    #[tokio::test]
    async fn test_cancel_during_setup() {
        let mut h = start(ScriptedTerminal::new(TerminalDimensions::new(80, 24)));
        let _pending = h.remote.requests.recv().await.unwrap();

        h.cancel.cancel();
        let outcome = timeout(Duration::from_secs(2), h.task).await.unwrap().unwrap().unwrap();
        assert_eq!(outcome.reason, CloseReason::Cancelled);
        assert!(!h.terminal.is_raw());
    }

    #[tokio::test]
    async fn test_cancel_returns_promptly() {
        let mut h = start(ScriptedTerminal::new(TerminalDimensions::new(80, 24)));
        accept_setup(&mut h.remote).await;
        assert!(h.terminal.is_raw());

        // The remote end stays open, so nothing ends on its own.
        let started = std::time::Instant::now();
        h.cancel.cancel();
        let outcome = timeout(Duration::from_secs(2), h.task).await.unwrap().unwrap().unwrap();
        let elapsed = started.elapsed();

        assert_eq!(outcome.reason, CloseReason::Cancelled);
        assert!(!h.terminal.is_raw());
        assert!(elapsed < FLUSH_TIMEOUT / 2, "cancel took {:?}", elapsed);
        drop(h.remote);
    }

    #[tokio::test]
    async fn test_local_eof_during_setup_reported() {
        let mut h = start(ScriptedTerminal::new(TerminalDimensions::new(80, 24)));
        let _pending = h.remote.requests.recv().await.unwrap();

        drop(h.stdin);
        let outcome = timeout(Duration::from_secs(2), h.task).await.unwrap().unwrap().unwrap();
        assert_eq!(outcome.reason, CloseReason::LocalEof);
        assert!(!h.terminal.is_raw());
        drop(h.remote);
    }
}
