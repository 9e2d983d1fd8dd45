//! End-to-end integration tests for peershell.
//!
//! These tests verify complete flows work correctly:
//! - Client and server bridges talking over a linked channel pair
//! - Resize propagation into the server PTY
//! - Terminal mode restoration on every exit path
//! - The whole SSH stack over the in-memory transport

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use peershell::auth::CredentialVerifier;
use peershell::channel::{pair, SessionChannel};
use peershell::engine::{ClientCredential, ServerContext};
use peershell::network::MemoryTransport;
use peershell::orchestrator::{connect, ConnectRequest, LocalAttachment, Server};
use peershell::session::{
    ClientSession, ClientSessionConfig, CloseReason, LocalIo, LoginCommand, PtyHandle, PtyHost,
    ServerSession, ServerSessionOptions, SessionOutcome, TeardownGuard,
};
use peershell::terminal::{ScriptedTerminal, Terminal};
use peershell::SessionError;
use protocol::{RequestKind, TerminalDimensions, PROTOCOL_ID};
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::Algorithm;
use russh::keys::PrivateKey;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// SHA-512 crypt of "Hello world!" with salt "saltstring".
const KNOWN_HASH: &str =
    "$6$saltstring$svn8UoSVapNtMuq1ukKS4tPQd8iKwSMHWjl/O817G3uBnIFNjnQJuesI68u4OTLiBFdcbYEdFCoEOfaS35inz1";
const PASSWORD: &str = "Hello world!";

const TIMEOUT: Duration = Duration::from_secs(10);

/// The test-side ends of a client's local terminal.
struct LocalEnd {
    stdin: DuplexStream,
    stdout: DuplexStream,
    terminal: Arc<ScriptedTerminal>,
    _interrupts: mpsc::Sender<()>,
}

fn local_attachment(size: TerminalDimensions) -> (LocalAttachment, LocalEnd) {
    let terminal = Arc::new(ScriptedTerminal::new(size));
    let (stdin, local_stdin) = tokio::io::duplex(1024);
    let (local_stdout, stdout) = tokio::io::duplex(64 * 1024);
    let (interrupts, interrupt_rx) = mpsc::channel(8);

    let attachment = LocalAttachment {
        terminal: terminal.clone(),
        io: LocalIo {
            stdin: Box::new(local_stdin),
            stdout: Box::new(local_stdout),
            stderr: Box::new(tokio::io::sink()),
        },
        interrupts: interrupt_rx,
    };
    let end = LocalEnd {
        stdin,
        stdout,
        terminal,
        _interrupts: interrupts,
    };
    (attachment, end)
}

/// Read from `stream` until `marker` shows up or the timeout passes.
async fn read_until(stream: &mut DuplexStream, marker: &str) -> String {
    let mut seen = String::new();
    let mut buf = [0u8; 1024];
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !seen.contains(marker) {
        match tokio::time::timeout_at(deadline, stream.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => seen.push_str(&String::from_utf8_lossy(&buf[..n])),
            _ => break,
        }
    }
    seen
}

fn spawn_sh() -> PtyHandle {
    sh_host()
        .spawn("alice", TerminalDimensions::default())
        .unwrap()
}

fn sh_host() -> PtyHost {
    PtyHost::new(LoginCommand::new(vec!["/bin/sh".to_string()]).unwrap())
}

// =============================================================================
// Bridge Tests (linked channel pair, real PTY)
// =============================================================================

struct Bridge {
    local: LocalEnd,
    cancel: CancellationToken,
    client: JoinHandle<peershell::Result<SessionOutcome>>,
    server: JoinHandle<peershell::Result<SessionOutcome>>,
    server_dims: tokio::sync::watch::Receiver<TerminalDimensions>,
}

fn start_bridge(size: TerminalDimensions) -> Bridge {
    let (client_end, server_end) = pair(64 * 1024);
    let (attachment, local) = local_attachment(size);
    let cancel = CancellationToken::new();

    let server_session = ServerSession::new("alice", ServerSessionOptions::default());
    let server_dims = server_session.dimensions();
    let server = tokio::spawn(server_session.run(server_end, spawn_sh()));

    let client_session =
        ClientSession::new(attachment.terminal, ClientSessionConfig::default(), &cancel);
    let client = tokio::spawn(client_session.run(
        client_end,
        attachment.io,
        attachment.interrupts,
    ));

    Bridge {
        local,
        cancel,
        client,
        server,
        server_dims,
    }
}

#[tokio::test]
async fn test_bridge_echo_hi() {
    let mut bridge = start_bridge(TerminalDimensions::new(80, 24));

    bridge.local.stdin.write_all(b"echo hi\n").await.unwrap();
    let seen = read_until(&mut bridge.local.stdout, "\r\nhi\r\n").await;
    assert!(seen.contains("\r\nhi\r\n"), "output was {:?}", seen);
    assert!(bridge.local.terminal.is_raw());

    bridge.local.stdin.write_all(b"exit 0\n").await.unwrap();
    let outcome = timeout(TIMEOUT, bridge.client).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome.exit_status, Some(0));
    let _ = timeout(TIMEOUT, bridge.server).await.unwrap();
}

#[tokio::test]
async fn test_bridge_resize_reaches_pty() {
    let mut bridge = start_bridge(TerminalDimensions::new(80, 24));

    bridge
        .server_dims
        .wait_for(|dims| *dims == TerminalDimensions::new(80, 24))
        .await
        .unwrap();

    bridge.local.terminal.set_size(TerminalDimensions::new(120, 40));
    timeout(
        Duration::from_secs(1),
        bridge
            .server_dims
            .wait_for(|dims| *dims == TerminalDimensions::new(120, 40)),
    )
    .await
    .unwrap()
    .unwrap();

    // The shell sees the new size too.
    bridge.local.stdin.write_all(b"stty size\n").await.unwrap();
    let seen = read_until(&mut bridge.local.stdout, "40 120").await;
    assert!(seen.contains("40 120"), "output was {:?}", seen);

    bridge.cancel.cancel();
    let outcome = timeout(TIMEOUT, bridge.client).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome.reason, CloseReason::Cancelled);
    let _ = timeout(TIMEOUT, bridge.server).await.unwrap();
}

// =============================================================================
// Terminal Mode Post-condition Tests
// =============================================================================

#[tokio::test]
async fn test_raw_mode_restored_after_remote_exit() {
    let mut bridge = start_bridge(TerminalDimensions::new(80, 24));

    bridge.local.stdin.write_all(b"exit 4\n").await.unwrap();
    let outcome = timeout(TIMEOUT, bridge.client).await.unwrap().unwrap().unwrap();

    assert_eq!(outcome.reason, CloseReason::RemoteEof);
    assert_eq!(outcome.exit_status, Some(4));
    assert!(!bridge.local.terminal.is_raw());
    assert_eq!(bridge.local.terminal.mode_changes(), 2);
}

#[tokio::test]
async fn test_raw_mode_restored_after_cancel() {
    let bridge = start_bridge(TerminalDimensions::new(80, 24));

    // Let the shell start before cancelling.
    let mut dims = bridge.server_dims.clone();
    dims.wait_for(|d| *d == TerminalDimensions::new(80, 24))
        .await
        .unwrap();
    bridge.cancel.cancel();

    let outcome = timeout(TIMEOUT, bridge.client).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome.reason, CloseReason::Cancelled);
    assert!(!bridge.local.terminal.is_raw());
    let _ = timeout(TIMEOUT, bridge.server).await.unwrap();
}

#[tokio::test]
async fn test_raw_mode_untouched_when_pty_rejected() {
    let (client_end, mut remote) = pair(64 * 1024);
    let (attachment, local) = local_attachment(TerminalDimensions::new(80, 24));
    let cancel = CancellationToken::new();
    let client = tokio::spawn(
        ClientSession::new(attachment.terminal, ClientSessionConfig::default(), &cancel).run(
            client_end,
            attachment.io,
            attachment.interrupts,
        ),
    );

    let request = remote.requests.recv().await.unwrap();
    assert_eq!(request.kind(), &RequestKind::PtyReq);
    request.reply(false);

    let result = timeout(TIMEOUT, client).await.unwrap().unwrap();
    assert!(matches!(result, Err(SessionError::PtyRequestRejected)));
    assert_eq!(local.terminal.mode_changes(), 0);
    assert!(!local.terminal.is_raw());
}

#[tokio::test]
async fn test_no_terminal_fails_before_raw_mode() {
    let (client_end, _remote): (SessionChannel, SessionChannel) = pair(64 * 1024);
    let terminal = Arc::new(ScriptedTerminal::detached());
    let (_tx, interrupts) = mpsc::channel(1);
    let io = LocalIo {
        stdin: Box::new(tokio::io::empty()),
        stdout: Box::new(tokio::io::sink()),
        stderr: Box::new(tokio::io::sink()),
    };

    let session = ClientSession::new(
        terminal.clone(),
        ClientSessionConfig::default(),
        &CancellationToken::new(),
    );
    let result = timeout(TIMEOUT, session.run(client_end, io, interrupts))
        .await
        .unwrap();
    assert!(matches!(result, Err(SessionError::NoTerminalAvailable)));
    assert_eq!(terminal.mode_changes(), 0);
}

// =============================================================================
// Teardown Guard Tests
// =============================================================================

#[tokio::test]
async fn test_teardown_runs_once_across_triggers() {
    let guard = Arc::new(TeardownGuard::new());
    let releases = Arc::new(AtomicUsize::new(0));
    let reasons = [
        CloseReason::LocalEof,
        CloseReason::RemoteEof,
        CloseReason::ProcessExited,
        CloseReason::Cancelled,
    ];

    let mut tasks = Vec::new();
    for i in 0..32 {
        let guard = guard.clone();
        let releases = releases.clone();
        let reason = reasons[i % reasons.len()];
        tasks.push(tokio::spawn(async move {
            if guard.fire(reason) {
                releases.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(releases.load(Ordering::SeqCst), 1);
    assert!(guard.is_fired());
    assert!(guard.reason().is_some());
}

// =============================================================================
// Full Stack Tests (russh over MemoryTransport)
// =============================================================================

struct TestServer {
    dir: TempDir,
    server: Arc<Server>,
    network: MemoryTransport,
    listening: JoinHandle<peershell::Result<()>>,
}

fn server_context(dir: &TempDir) -> ServerContext {
    let shadow = dir.path().join("shadow");
    std::fs::write(
        &shadow,
        format!("root:*:19000:0:99999:7:::\nalice:{}:19000:0:99999:7:::\n", KNOWN_HASH),
    )
    .unwrap();

    ServerContext {
        verifier: CredentialVerifier::new(
            shadow,
            format!("{}/{{user}}.keys", dir.path().display()),
        ),
        pty_host: sh_host(),
        session_options: ServerSessionOptions::default(),
        password_auth: true,
        publickey_auth: true,
        cancel: CancellationToken::new(),
    }
}

async fn start_server() -> TestServer {
    let dir = TempDir::new().unwrap();
    let host_key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    let server = Arc::new(Server::new(server_context(&dir), host_key, 6, PROTOCOL_ID));
    let network = MemoryTransport::new("server");

    let listening = {
        let server = server.clone();
        let transport = network.clone();
        tokio::spawn(async move { server.listen(&transport).await })
    };
    // Give the listener time to register.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        dir,
        server,
        network,
        listening,
    }
}

impl TestServer {
    fn connect(
        &self,
        credential: ClientCredential,
        size: TerminalDimensions,
    ) -> (JoinHandle<peershell::Result<SessionOutcome>>, LocalEnd, CancellationToken) {
        let client = self.network.peer("client");
        let (attachment, local) = local_attachment(size);
        let cancel = CancellationToken::new();
        let request = ConnectRequest::new("server", "alice", credential);

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { connect(&client, request, attachment, &cancel).await })
        };
        (task, local, cancel)
    }

    async fn stop(self) {
        self.server.shutdown(Duration::from_secs(2)).await;
        let _ = timeout(TIMEOUT, self.listening).await;
    }
}

#[tokio::test]
async fn test_full_stack_password_session() {
    let server = start_server().await;
    let (task, mut local, _cancel) = server.connect(
        ClientCredential::password(PASSWORD),
        TerminalDimensions::new(80, 24),
    );

    local.stdin.write_all(b"echo hi\n").await.unwrap();
    let seen = read_until(&mut local.stdout, "\r\nhi\r\n").await;
    assert!(seen.contains("\r\nhi\r\n"), "output was {:?}", seen);

    local.stdin.write_all(b"exit 5\n").await.unwrap();
    let outcome = timeout(TIMEOUT, task).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome.exit_status, Some(5));
    assert!(!local.terminal.is_raw());

    server.stop().await;
}

#[tokio::test]
async fn test_full_stack_many_input_packets() {
    let server = start_server().await;
    let (task, mut local, cancel) = server.connect(
        ClientCredential::password(PASSWORD),
        TerminalDimensions::new(80, 24),
    );

    // Separate writes so each line travels as its own data packet.
    for _ in 0..300 {
        local.stdin.write_all(b"true\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    local.stdin.write_all(b"echo done\n").await.unwrap();
    let seen = read_until(&mut local.stdout, "\r\ndone\r\n").await;
    let tail: String = seen.chars().rev().take(200).collect::<Vec<_>>().into_iter().rev().collect();
    assert!(seen.contains("\r\ndone\r\n"), "output ended with {:?}", tail);

    cancel.cancel();
    let outcome = timeout(TIMEOUT, task).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome.reason, CloseReason::Cancelled);

    server.stop().await;
}

#[tokio::test]
async fn test_full_stack_resize() {
    let server = start_server().await;
    let (task, mut local, cancel) = server.connect(
        ClientCredential::password(PASSWORD),
        TerminalDimensions::new(80, 24),
    );

    local.stdin.write_all(b"stty size\n").await.unwrap();
    let seen = read_until(&mut local.stdout, "24 80").await;
    assert!(seen.contains("24 80"), "output was {:?}", seen);

    local.terminal.set_size(TerminalDimensions::new(120, 40));
    tokio::time::sleep(Duration::from_millis(100)).await;
    local.stdin.write_all(b"stty size\n").await.unwrap();
    let seen = read_until(&mut local.stdout, "40 120").await;
    assert!(seen.contains("40 120"), "output was {:?}", seen);

    cancel.cancel();
    let outcome = timeout(TIMEOUT, task).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome.reason, CloseReason::Cancelled);
    assert!(!local.terminal.is_raw());

    server.stop().await;
}

#[tokio::test]
async fn test_full_stack_wrong_password() {
    let server = start_server().await;
    let (task, local, _cancel) = server.connect(
        ClientCredential::password("Hello world?"),
        TerminalDimensions::new(80, 24),
    );

    let result = timeout(TIMEOUT, task).await.unwrap().unwrap();
    assert!(matches!(result, Err(SessionError::AuthenticationFailed(_))));
    assert_eq!(local.terminal.mode_changes(), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_full_stack_unknown_user() {
    let server = start_server().await;
    let client = server.network.peer("client");
    let (attachment, local) = local_attachment(TerminalDimensions::new(80, 24));
    let request = ConnectRequest::new("server", "mallory", ClientCredential::password(PASSWORD));

    let result = timeout(
        TIMEOUT,
        connect(&client, request, attachment, &CancellationToken::new()),
    )
    .await
    .unwrap();
    assert!(matches!(result, Err(SessionError::AuthenticationFailed(_))));
    assert_eq!(local.terminal.mode_changes(), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_full_stack_public_key_session() {
    let server = start_server().await;
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    let line = key.public_key().to_openssh().unwrap();
    std::fs::write(server.dir.path().join("alice.keys"), format!("{} alice@test\n", line)).unwrap();

    let (task, mut local, _cancel) =
        server.connect(ClientCredential::Key(key), TerminalDimensions::new(80, 24));

    local.stdin.write_all(b"echo key_marker\n").await.unwrap();
    let seen = read_until(&mut local.stdout, "\r\nkey_marker\r\n").await;
    assert!(seen.contains("\r\nkey_marker\r\n"), "output was {:?}", seen);

    local.stdin.write_all(b"exit\n").await.unwrap();
    let outcome = timeout(TIMEOUT, task).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome.exit_status, Some(0));

    server.stop().await;
}

#[tokio::test]
async fn test_full_stack_unlisted_key_rejected() {
    let server = start_server().await;
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();

    let (task, local, _cancel) =
        server.connect(ClientCredential::Key(key), TerminalDimensions::new(80, 24));

    let result = timeout(TIMEOUT, task).await.unwrap().unwrap();
    assert!(matches!(result, Err(SessionError::AuthenticationFailed(_))));
    assert!(!local.terminal.is_raw());

    server.stop().await;
}

#[tokio::test]
async fn test_server_shutdown_ends_session() {
    let server = start_server().await;
    let (task, mut local, _cancel) = server.connect(
        ClientCredential::password(PASSWORD),
        TerminalDimensions::new(80, 24),
    );

    local.stdin.write_all(b"echo up\n").await.unwrap();
    let seen = read_until(&mut local.stdout, "\r\nup\r\n").await;
    assert!(seen.contains("\r\nup\r\n"), "output was {:?}", seen);

    let stopping = tokio::spawn(server.stop());
    let outcome = timeout(TIMEOUT, task).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome.reason, CloseReason::RemoteEof);
    assert!(!local.terminal.is_raw());
    timeout(TIMEOUT, stopping).await.unwrap().unwrap();
}
