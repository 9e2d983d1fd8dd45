//! POSIX terminal: termios for raw mode, `TIOCGWINSZ` for size.

use std::fs::{File, OpenOptions};
use std::io::IsTerminal;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::sync::Mutex;

use nix::sys::termios::{self, SetArg, Termios};
use protocol::TerminalDimensions;

use super::{Terminal, TerminalError};

nix::ioctl_read_bad!(tiocgwinsz, nix::libc::TIOCGWINSZ, nix::libc::winsize);

const CONTROLLING_TTY: &str = "/dev/tty";

/// Descriptor the terminal operations go through.
enum Source {
    Stdin(std::io::Stdin),
    /// Controlling TTY, opened when stdin is redirected.
    Tty(File),
}

/// Terminal attached to stdin, or to `/dev/tty` when stdin is redirected.
pub struct UnixTerminal {
    source: Source,
    /// Attributes saved when raw mode was enabled.
    saved: Mutex<Option<Termios>>,
}

impl UnixTerminal {
    /// Locate the terminal to operate on.
    pub fn open() -> Result<Self, TerminalError> {
        let stdin = std::io::stdin();
        if stdin.is_terminal() {
            return Ok(Self {
                source: Source::Stdin(stdin),
                saved: Mutex::new(None),
            });
        }

        let tty = OpenOptions::new()
            .read(true)
            .write(true)
            .open(CONTROLLING_TTY)
            .map_err(|_| TerminalError::NoTerminalAvailable)?;
        if !tty.is_terminal() {
            return Err(TerminalError::NoTerminalAvailable);
        }
        tracing::debug!("stdin is not a terminal, using {}", CONTROLLING_TTY);

        Ok(Self {
            source: Source::Tty(tty),
            saved: Mutex::new(None),
        })
    }

    fn fd(&self) -> BorrowedFd<'_> {
        match &self.source {
            Source::Stdin(stdin) => stdin.as_fd(),
            Source::Tty(file) => file.as_fd(),
        }
    }
}

impl Terminal for UnixTerminal {
    fn size(&self) -> Result<TerminalDimensions, TerminalError> {
        let mut ws = nix::libc::winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: `ws` is a valid winsize for the duration of the call and
        // the descriptor is open.
        unsafe { tiocgwinsz(self.fd().as_raw_fd(), &mut ws) }
            .map_err(|e| TerminalError::Io(e.into()))?;

        let dims = TerminalDimensions::new(ws.ws_col, ws.ws_row);
        if !dims.is_valid() {
            return Err(TerminalError::NoTerminalAvailable);
        }
        Ok(dims)
    }

    fn set_raw_mode(&self, enabled: bool) -> Result<(), TerminalError> {
        let mut saved = self
            .saved
            .lock()
            .map_err(|_| TerminalError::Io(std::io::Error::other("terminal state poisoned")))?;
        let fd = self.fd();

        match (enabled, saved.is_some()) {
            (true, false) => {
                let original = termios::tcgetattr(fd).map_err(|e| TerminalError::Io(e.into()))?;
                let mut raw = original.clone();
                termios::cfmakeraw(&mut raw);
                termios::tcsetattr(fd, SetArg::TCSANOW, &raw)
                    .map_err(|e| TerminalError::Io(e.into()))?;
                *saved = Some(original);
            }
            (false, true) => {
                if let Some(original) = saved.take() {
                    termios::tcsetattr(fd, SetArg::TCSANOW, &original)
                        .map_err(|e| TerminalError::Io(e.into()))?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn is_raw(&self) -> bool {
        self.saved.lock().map(|s| s.is_some()).unwrap_or(false)
    }
}

impl Drop for UnixTerminal {
    fn drop(&mut self) {
        if self.is_raw() {
            let _ = self.set_raw_mode(false);
        }
    }
}
