//! Session lifecycle state shared by both roles.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use protocol::TerminalDimensions;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Which end of the channel a session runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

/// Lifecycle of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Channel setup, PTY allocation and shell request in progress.
    Requesting,
    /// Both copy directions are running.
    Active,
    /// Teardown has been triggered.
    Closing,
    /// Every task has returned and every resource is released.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Requesting => "requesting",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// What caused a session to close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The local input (terminal stdin or PTY output) reached EOF or failed.
    LocalEof,
    /// The channel reached EOF or failed.
    RemoteEof,
    /// The shell process exited.
    ProcessExited,
    /// The caller cancelled the session.
    Cancelled,
    /// The interrupt byte could not be delivered.
    Interrupt,
    /// The session never became active.
    SetupFailed,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloseReason::LocalEof => "local eof",
            CloseReason::RemoteEof => "remote eof",
            CloseReason::ProcessExited => "process exited",
            CloseReason::Cancelled => "cancelled",
            CloseReason::Interrupt => "interrupt",
            CloseReason::SetupFailed => "setup failed",
        };
        f.write_str(name)
    }
}

/// Publishes the session state to any number of observers.
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<SessionState>,
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SessionState::Requesting);
        Self { tx }
    }

    pub fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    /// Move to `next` if it is later than the current state.
    ///
    /// Returns whether the state changed.
    pub fn advance(&self, next: SessionState) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::debug!(state = %next, "Session state changed");
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Exactly-once trigger for session teardown.
///
/// Any task may call [`fire`](Self::fire); only the first caller gets
/// `true` and its reason is recorded. Firing also cancels the session
/// token so every task blocked on it wakes up.
#[derive(Debug)]
pub struct TeardownGuard {
    fired: AtomicBool,
    reason: OnceLock<CloseReason>,
    token: CancellationToken,
}

impl TeardownGuard {
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// A guard that is also fired when `token` (or its parent) is cancelled.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            fired: AtomicBool::new(false),
            reason: OnceLock::new(),
            token,
        }
    }

    /// Trigger teardown. Returns true for the first caller only.
    pub fn fire(&self, reason: CloseReason) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.reason.set(reason);
        tracing::debug!(reason = %reason, "Teardown triggered");
        self.token.cancel();
        true
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// The reason given by the first [`fire`](Self::fire).
    ///
    /// When the token was cancelled from outside, the reason is
    /// [`CloseReason::Cancelled`].
    pub fn reason(&self) -> Option<CloseReason> {
        self.reason.get().copied().or_else(|| {
            if self.token.is_cancelled() {
                Some(CloseReason::Cancelled)
            } else {
                None
            }
        })
    }

    /// Resolves once teardown has been triggered by any path.
    pub async fn fired(&self) {
        self.token.cancelled().await;
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Default for TeardownGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminal dimensions shared between the resize source and its consumer.
///
/// Updates that do not change the value are not published, so observers
/// only wake on real resizes.
#[derive(Debug)]
pub struct SharedDimensions {
    tx: watch::Sender<TerminalDimensions>,
}

impl SharedDimensions {
    pub fn new(initial: TerminalDimensions) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn get(&self) -> TerminalDimensions {
        *self.tx.borrow()
    }

    /// Store `dims`. Returns true if it differs from the previous value.
    pub fn update(&self, dims: TerminalDimensions) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == dims {
                false
            } else {
                *current = dims;
                true
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<TerminalDimensions> {
        self.tx.subscribe()
    }
}

/// How a session ended, as seen by its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOutcome {
    /// Exit status of the remote shell, when it was reported.
    pub exit_status: Option<u32>,
    pub reason: CloseReason,
}
