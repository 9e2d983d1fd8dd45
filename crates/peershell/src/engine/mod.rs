//! SSH engine adapters.
//!
//! russh does the key exchange, authentication and channel framing. These
//! adapters translate its callback and message APIs into a
//! [`SessionChannel`](crate::channel::SessionChannel), so the session
//! bridge never sees russh types.
//!
//! - [`server`]: a `russh::server::Handler` that authenticates through the
//!   [`CredentialVerifier`](crate::auth::CredentialVerifier) and hands the
//!   single session channel to a [`ServerSession`](crate::session::ServerSession).
//! - [`client`]: handshake, authentication and a pump task between a
//!   russh `Channel` and a `SessionChannel`.

pub mod client;
pub mod server;

use protocol::TerminalModes;
use russh::Pty;

pub use client::{handshake, open_session, ClientCredential, ClientHandler};
pub use server::{serve_connection, ServerContext, ServerHandler};

/// Terminal modes as russh pty opcodes. Opcodes russh does not name are
/// dropped.
pub(crate) fn modes_to_russh(modes: &TerminalModes) -> Vec<(Pty, u32)> {
    modes
        .iter()
        .filter_map(|(opcode, value)| Pty::from_u8(opcode).map(|pty| (pty, value)))
        .collect()
}

/// russh pty opcodes as terminal modes.
pub(crate) fn modes_from_russh(modes: &[(Pty, u32)]) -> TerminalModes {
    modes.iter().map(|(pty, value)| (*pty as u8, *value)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{DEFAULT_BAUD, ECHO, TTY_OP_ISPEED, TTY_OP_OSPEED};

    #[test]
    fn test_session_modes_survive_russh_mapping() {
        let modes = TerminalModes::default_session();
        let mapped = modes_to_russh(&modes);
        assert_eq!(mapped.len(), 3);

        let back = modes_from_russh(&mapped);
        assert_eq!(back.get(ECHO), Some(1));
        assert_eq!(back.get(TTY_OP_ISPEED), Some(DEFAULT_BAUD));
        assert_eq!(back.get(TTY_OP_OSPEED), Some(DEFAULT_BAUD));
    }
}
