//! Session bridge and PTY process host.
//!
//! A session takes an authenticated, already-open channel and runs the
//! interactive terminal on it until one side ends:
//!
//! ```text
//!            Requesting ──> Active ──> Closing ──> Closed
//!                 │                       ▲
//!                 └───── setup error ─────┘
//! ```
//!
//! [`ClientSession`] attaches the local terminal; [`ServerSession`] attaches
//! a PTY spawned by [`PtyHost`]. Every trigger path (either copy direction,
//! process exit, cancellation) goes through one [`TeardownGuard`].

pub mod client;
pub mod pty;
pub mod server;
pub mod state;

pub use client::{os_interrupts, ClientSession, ClientSessionConfig, LocalIo};
pub use pty::{LoginCommand, PtyError, PtyHandle, PtyHost, PtyResizer};
pub use server::{ServerSession, ServerSessionOptions};
pub use state::{
    CloseReason, Role, SessionOutcome, SessionState, SharedDimensions, StateCell, TeardownGuard,
};
