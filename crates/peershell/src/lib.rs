//! # peershell
//!
//! Interactive SSH shell sessions carried over peer-to-peer streams.
//!
//! ## Overview
//!
//! A peer runs `peershell serve`; other peers reach it by node id and get
//! a login shell on a pseudo-terminal, with the SSH protocol running on a
//! single stream instead of a TCP port.
//!
//! - **Transport**: QUIC streams over iroh, or in-process streams for tests
//! - **Engine**: russh for key exchange, authentication and channels
//! - **Session bridge**: copies bytes between the channel and a local
//!   terminal or PTY, applies resizes and tears down exactly once
//! - **Credentials**: shadow-style password hashes and authorized keys
//!
//! ## Architecture
//!
//! ```text
//!   client                                     server
//! ┌──────────────┐                           ┌──────────────────┐
//! │  Terminal    │                           │  PtyHost         │
//! │  (raw mode)  │                           │  (login process) │
//! ├──────────────┤                           ├──────────────────┤
//! │ClientSession │                           │  ServerSession   │
//! ├──────────────┤     SessionChannel        ├──────────────────┤
//! │engine::client│ <──── russh / SSH ──────> │  engine::server  │
//! ├──────────────┤                           ├──────────────────┤
//! │  Transport   │ <── "/ssh/1.0.0" stream ─> │  Transport       │
//! └──────────────┘                           └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`identity`]: Node key and SSH host key persistence
//! - [`network`]: Stream transports (iroh, in-memory)
//! - [`engine`]: russh server and client adapters
//! - [`channel`]: Engine-agnostic session channel
//! - [`session`]: Session bridge, state machine and PTY host
//! - [`terminal`]: Local terminal size and raw mode
//! - [`auth`]: Credential verification
//! - [`orchestrator`]: `connect` and the listening [`Server`]

pub mod auth;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod network;
pub mod orchestrator;
pub mod session;
pub mod terminal;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;
pub use error::{Result, SessionError};
pub use orchestrator::{connect, ConnectRequest, LocalAttachment, Server};
pub use session::{CloseReason, SessionOutcome, SessionState};
