//! Local terminal capability.
//!
//! The rest of the crate only sees the [`Terminal`] trait: size queries and
//! raw-mode toggling. One implementation per target is picked at build time
//! by [`local_terminal`]; tests use [`ScriptedTerminal`].

use std::sync::Arc;

use protocol::TerminalDimensions;
use thiserror::Error;

mod scripted;
#[cfg(unix)]
mod unix;
#[cfg(not(unix))]
mod console;

pub use scripted::ScriptedTerminal;
#[cfg(unix)]
pub use unix::UnixTerminal;
#[cfg(not(unix))]
pub use console::ConsoleTerminal;

/// Errors from the local terminal.
#[derive(Debug, Error)]
pub enum TerminalError {
    /// Neither stdin nor the controlling TTY is a terminal.
    #[error("no terminal available")]
    NoTerminalAvailable,

    /// The terminal rejected a query or mode change.
    #[error("terminal I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Local terminal operations needed by a client session.
pub trait Terminal: Send + Sync {
    /// Current size in character cells.
    fn size(&self) -> Result<TerminalDimensions, TerminalError>;

    /// Enable or disable raw mode. Calling it twice with the same value is
    /// a no-op.
    fn set_raw_mode(&self, enabled: bool) -> Result<(), TerminalError>;

    /// Whether raw mode is currently enabled by this handle.
    fn is_raw(&self) -> bool;
}

/// The terminal implementation for this platform.
#[cfg(unix)]
pub fn local_terminal() -> Result<Arc<dyn Terminal>, TerminalError> {
    Ok(Arc::new(UnixTerminal::open()?))
}

/// The terminal implementation for this platform.
#[cfg(not(unix))]
pub fn local_terminal() -> Result<Arc<dyn Terminal>, TerminalError> {
    Ok(Arc::new(ConsoleTerminal::open()?))
}

/// Scoped raw mode: enabled on construction, restored on drop.
///
/// Drop cannot report errors, so callers that want to log a failed restore
/// call [`RawModeGuard::restore`] explicitly.
pub struct RawModeGuard {
    terminal: Arc<dyn Terminal>,
    active: bool,
}

impl RawModeGuard {
    /// Enable raw mode on `terminal`.
    pub fn enable(terminal: Arc<dyn Terminal>) -> Result<Self, TerminalError> {
        terminal.set_raw_mode(true)?;
        Ok(Self {
            terminal,
            active: true,
        })
    }

    /// Restore the previous mode now.
    pub fn restore(mut self) -> Result<(), TerminalError> {
        self.active = false;
        self.terminal.set_raw_mode(false)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.active {
            if let Err(e) = self.terminal.set_raw_mode(false) {
                tracing::warn!(error = %e, "Failed to restore terminal mode");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_enables_and_restores() {
        let terminal = Arc::new(ScriptedTerminal::new(TerminalDimensions::new(80, 24)));
        {
            let _guard = RawModeGuard::enable(terminal.clone()).unwrap();
            assert!(terminal.is_raw());
        }
        assert!(!terminal.is_raw());
    }

    #[test]
    fn test_guard_explicit_restore() {
        let terminal = Arc::new(ScriptedTerminal::new(TerminalDimensions::new(80, 24)));
        let guard = RawModeGuard::enable(terminal.clone()).unwrap();
        guard.restore().unwrap();
        assert!(!terminal.is_raw());
        // One enable, one disable; drop after restore adds nothing.
        assert_eq!(terminal.mode_changes(), 2);
    }

    #[test]
    fn test_guard_restores_on_panic() {
        let terminal = Arc::new(ScriptedTerminal::new(TerminalDimensions::new(80, 24)));
        let inner = terminal.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = RawModeGuard::enable(inner).unwrap();
            panic!("session task failed");
        });
        assert!(result.is_err());
        assert!(!terminal.is_raw());
    }
}
