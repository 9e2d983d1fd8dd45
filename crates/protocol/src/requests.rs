//! Session channel request types and their payloads.
//!
//! # Payload formats
//!
//! `pty-req`:
//! - string: terminal type (4-byte BE length, then bytes)
//! - uint32: width in columns
//! - uint32: height in rows
//! - uint32: width in pixels
//! - uint32: height in pixels
//! - string: encoded terminal modes
//!
//! `window-change`:
//! - uint32: width in columns
//! - uint32: height in rows
//! - uint32: width in pixels (optional on decode)
//! - uint32: height in pixels (optional on decode)
//!
//! `exit-status`:
//! - uint32: exit code

use std::fmt;

use bytes::BytesMut;

use crate::dimensions::TerminalDimensions;
use crate::error::{ProtocolError, Result};
use crate::modes::TerminalModes;
use crate::wire::{put_string, put_u32, PayloadReader};

/// Kind of an out-of-band channel request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Start the user's default shell.
    Shell,
    /// Run a single command.
    Exec,
    /// Allocate a pseudo-terminal.
    PtyReq,
    /// Terminal size changed.
    WindowChange,
    /// Remote process exit code.
    ExitStatus,
    /// Deliver a signal to the remote process.
    Signal,
    /// Anything else, kept verbatim.
    Other(String),
}

impl RequestKind {
    /// SSH request name.
    pub fn as_str(&self) -> &str {
        match self {
            RequestKind::Shell => "shell",
            RequestKind::Exec => "exec",
            RequestKind::PtyReq => "pty-req",
            RequestKind::WindowChange => "window-change",
            RequestKind::ExitStatus => "exit-status",
            RequestKind::Signal => "signal",
            RequestKind::Other(name) => name,
        }
    }

    /// Parse an SSH request name.
    pub fn parse(name: &str) -> Self {
        match name {
            "shell" => RequestKind::Shell,
            "exec" => RequestKind::Exec,
            "pty-req" => RequestKind::PtyReq,
            "window-change" => RequestKind::WindowChange,
            "exit-status" => RequestKind::ExitStatus,
            "signal" => RequestKind::Signal,
            other => RequestKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for RequestKind {
    fn from(name: &str) -> Self {
        Self::parse(name)
    }
}

/// Payload of a `pty-req` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    /// Value for the remote `TERM` variable.
    pub term: String,
    /// Size in character cells.
    pub dimensions: TerminalDimensions,
    /// Width in pixels, zero when unknown.
    pub pixel_width: u32,
    /// Height in pixels, zero when unknown.
    pub pixel_height: u32,
    /// Requested terminal modes.
    pub modes: TerminalModes,
}

impl PtyRequest {
    /// Request for `term` at `dimensions` with the default session modes.
    pub fn new(term: impl Into<String>, dimensions: TerminalDimensions) -> Self {
        Self {
            term: term.into(),
            dimensions,
            pixel_width: 0,
            pixel_height: 0,
            modes: TerminalModes::default_session(),
        }
    }

    /// Replace the terminal modes.
    pub fn with_modes(mut self, modes: TerminalModes) -> Self {
        self.modes = modes;
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let modes = self.modes.encode();
        let mut buf = BytesMut::with_capacity(4 + self.term.len() + 16 + 4 + modes.len());
        put_string(&mut buf, self.term.as_bytes());
        put_u32(&mut buf, self.dimensions.width as u32);
        put_u32(&mut buf, self.dimensions.height as u32);
        put_u32(&mut buf, self.pixel_width);
        put_u32(&mut buf, self.pixel_height);
        put_string(&mut buf, &modes);
        buf.to_vec()
    }

    /// Decode a `pty-req` payload.
    ///
    /// The mode string is optional so that payloads from peers that stop
    /// after the pixel fields still decode.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = PayloadReader::new(payload);
        let term = reader.read_utf8("terminal type")?.to_string();
        let width = reader.read_u32()?;
        let height = reader.read_u32()?;
        let pixel_width = reader.read_u32()?;
        let pixel_height = reader.read_u32()?;
        let modes = if reader.remaining() > 0 {
            TerminalModes::decode(reader.read_string()?)?
        } else {
            TerminalModes::new()
        };
        reader.finish()?;

        Ok(Self {
            term,
            dimensions: TerminalDimensions::from_wire(width, height),
            pixel_width,
            pixel_height,
            modes,
        })
    }
}

/// Payload of a `window-change` notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowChange {
    /// New size in character cells.
    pub dimensions: TerminalDimensions,
    /// Width in pixels, zero when unknown.
    pub pixel_width: u32,
    /// Height in pixels, zero when unknown.
    pub pixel_height: u32,
}

impl WindowChange {
    pub fn new(dimensions: TerminalDimensions) -> Self {
        Self {
            dimensions,
            pixel_width: 0,
            pixel_height: 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(16);
        put_u32(&mut buf, self.dimensions.width as u32);
        put_u32(&mut buf, self.dimensions.height as u32);
        put_u32(&mut buf, self.pixel_width);
        put_u32(&mut buf, self.pixel_height);
        buf.to_vec()
    }

    /// Decode a `window-change` payload; the pixel fields may be absent.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = PayloadReader::new(payload);
        let width = reader.read_u32()?;
        let height = reader.read_u32()?;
        let (pixel_width, pixel_height) = if reader.remaining() > 0 {
            (reader.read_u32()?, reader.read_u32()?)
        } else {
            (0, 0)
        };
        reader.finish()?;

        Ok(Self {
            dimensions: TerminalDimensions::from_wire(width, height),
            pixel_width,
            pixel_height,
        })
    }
}

/// Payload of an `exit-status` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus(pub u32);

impl ExitStatus {
    pub fn encode(&self) -> Vec<u8> {
        self.0.to_be_bytes().to_vec()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = PayloadReader::new(payload);
        let code = reader.read_u32()?;
        reader.finish()?;
        Ok(Self(code))
    }
}

/// A decoded request payload, for callers that dispatch on kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `shell`, with whatever payload arrived.
    Shell(Vec<u8>),
    /// `exec`, with the raw command bytes.
    Exec(Vec<u8>),
    PtyReq(PtyRequest),
    WindowChange(WindowChange),
    ExitStatus(ExitStatus),
}

impl Request {
    /// Decode `payload` according to `kind`.
    pub fn decode(kind: &RequestKind, payload: &[u8]) -> Result<Self> {
        match kind {
            RequestKind::Shell => Ok(Request::Shell(payload.to_vec())),
            RequestKind::Exec => {
                let mut reader = PayloadReader::new(payload);
                let command = reader.read_string()?.to_vec();
                Ok(Request::Exec(command))
            }
            RequestKind::PtyReq => PtyRequest::decode(payload).map(Request::PtyReq),
            RequestKind::WindowChange => WindowChange::decode(payload).map(Request::WindowChange),
            RequestKind::ExitStatus => ExitStatus::decode(payload).map(Request::ExitStatus),
            RequestKind::Signal | RequestKind::Other(_) => {
                Err(ProtocolError::UnknownRequest(kind.to_string()))
            }
        }
    }

    /// Encode a command for an `exec` payload.
    pub fn encode_exec(command: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4 + command.len());
        put_string(&mut buf, command);
        buf.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modes::ECHO;

    #[test]
    fn test_request_kind_names() {
        for kind in [
            RequestKind::Shell,
            RequestKind::Exec,
            RequestKind::PtyReq,
            RequestKind::WindowChange,
            RequestKind::ExitStatus,
            RequestKind::Signal,
        ] {
            assert_eq!(RequestKind::parse(kind.as_str()), kind);
        }
        assert_eq!(
            RequestKind::parse("x11-req"),
            RequestKind::Other("x11-req".to_string())
        );
    }

    #[test]
    fn test_pty_request_roundtrip_table() {
        let cases = [
            ("xterm-256color", 80, 24),
            ("xterm-256color", 1, 1),
            ("vt100", 120, 40),
            ("", 300, 100),
        ];

        for (term, width, height) in cases {
            let request = PtyRequest::new(term, TerminalDimensions::new(width, height));
            let decoded = PtyRequest::decode(&request.encode()).unwrap();
            assert_eq!(decoded.dimensions.width, width, "width for {term}");
            assert_eq!(decoded.dimensions.height, height, "height for {term}");
            assert_eq!(decoded, request);
        }
    }

    #[test]
    fn test_pty_request_layout() {
        let request = PtyRequest::new("vt", TerminalDimensions::new(80, 24))
            .with_modes(TerminalModes::new());
        let encoded = request.encode();

        // Term-name length occupies the first four bytes.
        assert_eq!(&encoded[0..4], &[0, 0, 0, 2]);
        assert_eq!(&encoded[4..6], b"vt");
        // Width and height follow the term name directly.
        assert_eq!(&encoded[6..10], &80u32.to_be_bytes());
        assert_eq!(&encoded[10..14], &24u32.to_be_bytes());
    }

    #[test]
    fn test_pty_request_keeps_modes() {
        let request = PtyRequest::new("xterm", TerminalDimensions::new(80, 24));
        let decoded = PtyRequest::decode(&request.encode()).unwrap();
        assert_eq!(decoded.modes.get(ECHO), Some(1));
    }

    #[test]
    fn test_pty_request_without_modes() {
        let mut payload = BytesMut::new();
        put_string(&mut payload, b"xterm");
        for value in [100u32, 50, 0, 0] {
            put_u32(&mut payload, value);
        }

        let decoded = PtyRequest::decode(&payload).unwrap();
        assert_eq!(decoded.dimensions, TerminalDimensions::new(100, 50));
        assert!(decoded.modes.is_empty());
    }

    #[test]
    fn test_pty_request_truncated() {
        let encoded = PtyRequest::new("xterm", TerminalDimensions::new(80, 24)).encode();
        for len in [0, 3, 9, 12] {
            assert!(
                matches!(
                    PtyRequest::decode(&encoded[..len]),
                    Err(ProtocolError::Truncated { .. })
                ),
                "prefix of {len} bytes should be truncated"
            );
        }
    }

    #[test]
    fn test_window_change_roundtrip() {
        let change = WindowChange::new(TerminalDimensions::new(120, 40));
        assert_eq!(WindowChange::decode(&change.encode()).unwrap(), change);
    }

    #[test]
    fn test_window_change_short_form() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&132u32.to_be_bytes());
        payload.extend_from_slice(&43u32.to_be_bytes());

        let change = WindowChange::decode(&payload).unwrap();
        assert_eq!(change.dimensions, TerminalDimensions::new(132, 43));
    }

    #[test]
    fn test_window_change_rejects_trailing_bytes() {
        let mut payload = WindowChange::new(TerminalDimensions::new(10, 10)).encode();
        payload.push(0);
        assert_eq!(
            WindowChange::decode(&payload),
            Err(ProtocolError::TrailingBytes(1))
        );
    }

    #[test]
    fn test_exit_status_roundtrip() {
        assert_eq!(ExitStatus::decode(&ExitStatus(130).encode()), Ok(ExitStatus(130)));
    }

    #[test]
    fn test_request_decode_dispatch() {
        let shell = Request::decode(&RequestKind::Shell, &[]).unwrap();
        assert_eq!(shell, Request::Shell(Vec::new()));

        let exec = Request::decode(&RequestKind::Exec, &Request::encode_exec(b"ls")).unwrap();
        assert_eq!(exec, Request::Exec(b"ls".to_vec()));

        let unknown = Request::decode(&RequestKind::Other("x11-req".into()), &[]);
        assert!(matches!(unknown, Err(ProtocolError::UnknownRequest(_))));
    }
}
