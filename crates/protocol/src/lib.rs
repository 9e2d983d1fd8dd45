//! # peershell Protocol Library
//!
//! Payload definitions for the out-of-band requests carried on an SSH
//! session channel, plus the constants both roles agree on.
//!
//! ## Overview
//!
//! The SSH engine frames channel requests as `{type, want_reply, payload}`
//! and leaves the payload opaque. This crate owns those payloads:
//!
//! - **Requests**: `pty-req`, `window-change` and `exit-status` payloads
//! - **Terminal Modes**: the opcode/value list inside a `pty-req`
//! - **Dimensions**: terminal size in character cells
//!
//! ## Layering
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     Channel request payloads (here)     │  BE u32 / SSH strings
//! ├─────────────────────────────────────────┤
//! │          SSH connection layer           │  russh
//! ├─────────────────────────────────────────┤
//! │     Peer stream (PROTOCOL_ID ALPN)      │  iroh QUIC bi-stream
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{PtyRequest, TerminalDimensions, DEFAULT_TERM};
//!
//! let request = PtyRequest::new(DEFAULT_TERM, TerminalDimensions::new(80, 24));
//! let payload = request.encode();
//!
//! let decoded = PtyRequest::decode(&payload).unwrap();
//! assert_eq!(decoded.dimensions, TerminalDimensions::new(80, 24));
//! ```

pub mod dimensions;
pub mod error;
pub mod modes;
pub mod requests;
pub mod wire;

pub use dimensions::TerminalDimensions;
pub use error::{ProtocolError, Result};
pub use modes::{TerminalModes, DEFAULT_BAUD, ECHO, TTY_OP_END, TTY_OP_ISPEED, TTY_OP_OSPEED};
pub use requests::{ExitStatus, PtyRequest, Request, RequestKind, WindowChange};

/// Protocol identifier streams are opened with; used as the transport ALPN.
pub const PROTOCOL_ID: &str = "/ssh/1.0.0";

/// Terminal type requested when the caller does not pick one.
pub const DEFAULT_TERM: &str = "xterm-256color";

/// Control byte written to the remote input in place of a local SIGINT.
pub const INTERRUPT_BYTE: u8 = 0x03;
