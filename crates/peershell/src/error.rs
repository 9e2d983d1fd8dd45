//! Session-level error taxonomy.
//!
//! Component errors ([`TerminalError`], [`AuthError`], [`PtyError`], ...)
//! stay in their modules. The orchestrators fold them into
//! [`SessionError`], which is what `connect` and `listen` callers see.

use thiserror::Error;

use crate::auth::AuthError;
use crate::channel::ChannelError;
use crate::network::TransportError;
use crate::session::pty::PtyError;
use crate::terminal::TerminalError;

/// Errors that abort a session before it reaches `Active`.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The peer could not be reached over the transport.
    #[error("transport unreachable: {0}")]
    TransportUnreachable(String),

    /// The SSH handshake or credential check failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The remote refused the session channel, or it has the wrong type.
    #[error("channel rejected: {0}")]
    ChannelRejected(String),

    /// The remote refused to allocate a pseudo-terminal.
    #[error("pty request rejected by remote")]
    PtyRequestRejected,

    /// The remote refused to start a shell.
    #[error("shell request rejected by remote")]
    ShellRejected,

    /// The PTY or the login process could not be created.
    #[error("failed to spawn session process: {0}")]
    SpawnFailed(String),

    /// No local terminal is available to size the remote PTY.
    #[error("no terminal available")]
    NoTerminalAvailable,

    /// A request payload could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        SessionError::TransportUnreachable(err.to_string())
    }
}

impl From<AuthError> for SessionError {
    fn from(err: AuthError) -> Self {
        SessionError::AuthenticationFailed(err.to_string())
    }
}

impl From<PtyError> for SessionError {
    fn from(err: PtyError) -> Self {
        match err {
            PtyError::Io(e) => SessionError::Io(e),
            other => SessionError::SpawnFailed(other.to_string()),
        }
    }
}

impl From<TerminalError> for SessionError {
    fn from(err: TerminalError) -> Self {
        match err {
            TerminalError::NoTerminalAvailable => SessionError::NoTerminalAvailable,
            TerminalError::Io(e) => SessionError::Io(e),
        }
    }
}

impl From<ChannelError> for SessionError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Io(e) => SessionError::Io(e),
            other => SessionError::ChannelRejected(other.to_string()),
        }
    }
}
