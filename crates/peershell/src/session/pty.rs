//! PTY process host.
//!
//! Allocates a pseudo-terminal, starts the login command on its slave side
//! and hands the master side to the session bridge as blocking I/O plus a
//! resize handle. The child process is reaped through a [`ChildWaiter`].

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use protocol::{TerminalDimensions, DEFAULT_TERM};
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

/// Placeholder in the login command replaced by the authenticated user.
pub const USER_PLACEHOLDER: &str = "{user}";

/// Errors from the PTY process host.
#[derive(Error, Debug)]
pub enum PtyError {
    /// The OS could not allocate a PTY or start the process.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// The kernel rejected a resize.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Waiting for or killing the child failed.
    #[error("failed to reap child process: {0}")]
    WaitFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Command line started inside each PTY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginCommand {
    argv: Vec<String>,
}

impl LoginCommand {
    /// Build from an argument vector; `{user}` in any argument is
    /// substituted at spawn time.
    pub fn new(argv: Vec<String>) -> Result<Self, PtyError> {
        if argv.is_empty() || argv[0].is_empty() {
            return Err(PtyError::SpawnFailed("empty login command".to_string()));
        }
        Ok(Self { argv })
    }

    /// `login -f {user}` when running as root, otherwise the current
    /// user's login shell.
    pub fn platform_default() -> Self {
        Self {
            argv: default_login_argv(),
        }
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    pub fn args(&self) -> &[String] {
        &self.argv[1..]
    }

    /// The argument vector with `user` substituted.
    pub fn render(&self, user: &str) -> Vec<String> {
        self.argv
            .iter()
            .map(|arg| arg.replace(USER_PLACEHOLDER, user))
            .collect()
    }
}

/// Default login command for this process.
pub fn default_login_argv() -> Vec<String> {
    if running_as_root() {
        vec!["login".to_string(), "-f".to_string(), USER_PLACEHOLDER.to_string()]
    } else {
        vec![detect_shell(), "-l".to_string()]
    }
}

#[cfg(unix)]
fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}

/// The user's shell from `$SHELL`, or `/bin/sh`.
fn detect_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// Spawns login processes on fresh PTYs.
#[derive(Debug, Clone)]
pub struct PtyHost {
    command: LoginCommand,
    term: String,
    env: Vec<(String, String)>,
}

impl PtyHost {
    pub fn new(command: LoginCommand) -> Self {
        Self {
            command,
            term: DEFAULT_TERM.to_string(),
            env: Vec::new(),
        }
    }

    /// Extra environment for every spawned process.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn command(&self) -> &LoginCommand {
        &self.command
    }

    /// Allocate a PTY of size `dims` and start the login command for `user`.
    pub fn spawn(&self, user: &str, dims: TerminalDimensions) -> Result<PtyHandle, PtyError> {
        let id = Uuid::new_v4().to_string();
        let argv = self.command.render(user);

        let pair = native_pty_system()
            .openpty(pty_size(dims))
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.env("TERM", &self.term);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(format!("{}: {}", argv[0], e)))?;
        // The child holds its own slave descriptor; dropping ours lets the
        // master see EOF once the child exits.
        drop(pair.slave);

        let pid = child.process_id();
        tracing::debug!(pty_id = %id, pid = ?pid, program = %argv[0], "Spawned PTY process");

        Ok(PtyHandle {
            id,
            pid,
            master: Arc::new(Mutex::new(pair.master)),
            writer_taken: false,
            child: Some(child),
        })
    }
}

fn pty_size(dims: TerminalDimensions) -> PtySize {
    PtySize {
        rows: dims.height,
        cols: dims.width,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// A running PTY process.
///
/// Owns the master side of the PTY. Dropping the handle releases the
/// master descriptor, so it is dropped last during teardown.
pub struct PtyHandle {
    id: String,
    pid: Option<u32>,
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    writer_taken: bool,
    child: Option<Box<dyn Child + Send + Sync>>,
}

impl PtyHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// A handle for resizing that can move into other tasks.
    pub fn resizer(&self) -> PtyResizer {
        PtyResizer {
            master: Arc::clone(&self.master),
        }
    }

    /// Blocking reader and writer on the master side. The writer can only
    /// be taken once.
    pub fn take_io(&mut self) -> Result<(Box<dyn Read + Send>, Box<dyn Write + Send>), PtyError> {
        if self.writer_taken {
            return Err(PtyError::SpawnFailed("PTY writer already taken".to_string()));
        }
        let master = self
            .master
            .lock()
            .map_err(|_| PtyError::SpawnFailed("PTY master poisoned".to_string()))?;
        let reader = master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        let writer = master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        drop(master);
        self.writer_taken = true;
        Ok((reader, writer))
    }

    /// Start waiting for the child in the background.
    pub fn start_waiter(&mut self) -> Result<ChildWaiter, PtyError> {
        let child = self
            .child
            .take()
            .ok_or_else(|| PtyError::WaitFailed("child already taken".to_string()))?;
        Ok(ChildWaiter::spawn(child, self.id.clone()))
    }
}

/// Resizes the PTY it was taken from.
#[derive(Clone)]
pub struct PtyResizer {
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
}

impl PtyResizer {
    pub fn resize(&self, dims: TerminalDimensions) -> Result<(), PtyError> {
        let master = self
            .master
            .lock()
            .map_err(|_| PtyError::ResizeFailed("PTY master poisoned".to_string()))?;
        master
            .resize(pty_size(dims))
            .map_err(|e| PtyError::ResizeFailed(e.to_string()))
    }

    /// Size the kernel currently reports for the PTY.
    pub fn size(&self) -> Result<TerminalDimensions, PtyError> {
        let master = self
            .master
            .lock()
            .map_err(|_| PtyError::ResizeFailed("PTY master poisoned".to_string()))?;
        let size = master
            .get_size()
            .map_err(|e| PtyError::ResizeFailed(e.to_string()))?;
        Ok(TerminalDimensions::new(size.cols, size.rows))
    }
}

type WaitOutcome = Result<u32, String>;

/// Observes child exit without blocking the runtime.
///
/// A dedicated thread sits in `wait()`; its result is published through a
/// watch channel so [`exited`](Self::exited) can be raced in `select!`.
pub struct ChildWaiter {
    killer: Box<dyn ChildKiller + Send + Sync>,
    status: watch::Receiver<Option<WaitOutcome>>,
}

impl ChildWaiter {
    fn spawn(mut child: Box<dyn Child + Send + Sync>, id: String) -> Self {
        let killer = child.clone_killer();
        let (tx, status) = watch::channel(None);

        let spawned = std::thread::Builder::new()
            .name("pty-wait".to_string())
            .spawn(move || {
                let outcome = child
                    .wait()
                    .map(|status| status.exit_code())
                    .map_err(|e| e.to_string());
                tracing::debug!(pty_id = %id, outcome = ?outcome, "PTY process exited");
                let _ = tx.send(Some(outcome));
            });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "Failed to start PTY wait thread");
        }

        Self { killer, status }
    }

    /// Exit code, if the child has already exited.
    pub fn try_status(&self) -> Option<WaitOutcome> {
        self.status.borrow().clone()
    }

    /// Resolves when the child exits. Cancel-safe.
    pub async fn exited(&mut self) {
        let _ = self.status.wait_for(|s| s.is_some()).await;
    }

    /// Wait up to `grace` for a natural exit, kill the child otherwise, and
    /// return its exit code.
    pub async fn reap(mut self, grace: Duration) -> Result<u32, PtyError> {
        if tokio::time::timeout(grace, self.exited()).await.is_err() {
            tracing::debug!("PTY process still running, killing it");
            if let Err(e) = self.killer.kill() {
                tracing::debug!(error = %e, "Kill failed, process may have exited");
            }
            tokio::time::timeout(grace, self.exited())
                .await
                .map_err(|_| PtyError::WaitFailed("process did not exit after kill".to_string()))?;
        }

        match self.try_status() {
            Some(Ok(code)) => Ok(code),
            Some(Err(e)) => Err(PtyError::WaitFailed(e)),
            None => Err(PtyError::WaitFailed("wait thread ended without status".to_string())),
        }
    }
}
