//! Console terminal for targets without termios, backed by crossterm.

use std::sync::atomic::{AtomicBool, Ordering};

use protocol::TerminalDimensions;

use super::{Terminal, TerminalError};

pub struct ConsoleTerminal {
    raw: AtomicBool,
}

impl ConsoleTerminal {
    pub fn open() -> Result<Self, TerminalError> {
        // Probe once so a missing console fails before the session starts.
        crossterm::terminal::size().map_err(|_| TerminalError::NoTerminalAvailable)?;
        Ok(Self {
            raw: AtomicBool::new(false),
        })
    }
}

impl Terminal for ConsoleTerminal {
    fn size(&self) -> Result<TerminalDimensions, TerminalError> {
        let (cols, rows) =
            crossterm::terminal::size().map_err(|_| TerminalError::NoTerminalAvailable)?;
        Ok(TerminalDimensions::new(cols, rows))
    }

    fn set_raw_mode(&self, enabled: bool) -> Result<(), TerminalError> {
        if self.raw.load(Ordering::SeqCst) == enabled {
            return Ok(());
        }
        if enabled {
            crossterm::terminal::enable_raw_mode()?;
        } else {
            crossterm::terminal::disable_raw_mode()?;
        }
        self.raw.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    fn is_raw(&self) -> bool {
        self.raw.load(Ordering::SeqCst)
    }
}
