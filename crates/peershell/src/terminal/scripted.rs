//! In-memory terminal with settable size.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use protocol::TerminalDimensions;

use super::{Terminal, TerminalError};

/// A terminal whose size is set by the caller and whose raw-mode state is
/// only recorded.
///
/// Used by tests and by headless clients that have no TTY but still want a
/// fixed PTY size on the remote.
#[derive(Debug)]
pub struct ScriptedTerminal {
    size: Mutex<Option<TerminalDimensions>>,
    raw: AtomicBool,
    mode_changes: AtomicUsize,
}

impl ScriptedTerminal {
    pub fn new(size: TerminalDimensions) -> Self {
        Self {
            size: Mutex::new(Some(size)),
            raw: AtomicBool::new(false),
            mode_changes: AtomicUsize::new(0),
        }
    }

    /// A terminal whose size queries fail with `NoTerminalAvailable`.
    pub fn detached() -> Self {
        Self {
            size: Mutex::new(None),
            raw: AtomicBool::new(false),
            mode_changes: AtomicUsize::new(0),
        }
    }

    /// Change the reported size, as if the user resized the window.
    pub fn set_size(&self, size: TerminalDimensions) {
        if let Ok(mut current) = self.size.lock() {
            *current = Some(size);
        }
    }

    /// Number of effective raw-mode transitions so far.
    pub fn mode_changes(&self) -> usize {
        self.mode_changes.load(Ordering::SeqCst)
    }
}

impl Terminal for ScriptedTerminal {
    fn size(&self) -> Result<TerminalDimensions, TerminalError> {
        self.size
            .lock()
            .ok()
            .and_then(|size| *size)
            .ok_or(TerminalError::NoTerminalAvailable)
    }

    fn set_raw_mode(&self, enabled: bool) -> Result<(), TerminalError> {
        if self.raw.swap(enabled, Ordering::SeqCst) != enabled {
            self.mode_changes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_raw(&self) -> bool {
        self.raw.load(Ordering::SeqCst)
    }
}
