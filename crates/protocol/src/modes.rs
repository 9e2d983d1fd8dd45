//! Encoded terminal modes carried by a `pty-req`.
//!
//! # Encoding
//!
//! A sequence of `(opcode: u8, value: u32 BE)` pairs terminated by
//! [`TTY_OP_END`]. Opcodes 160 and above have undefined arguments, so
//! decoding stops when it meets one.

use bytes::{BufMut, BytesMut};

use crate::error::Result;
use crate::wire::PayloadReader;

/// Terminates the mode list.
pub const TTY_OP_END: u8 = 0;

/// Local echo of input characters.
pub const ECHO: u8 = 53;

/// Input baud rate.
pub const TTY_OP_ISPEED: u8 = 128;

/// Output baud rate.
pub const TTY_OP_OSPEED: u8 = 129;

/// First opcode whose argument is not a `uint32`.
const FIRST_UNDEFINED_OPCODE: u8 = 160;

/// Baud rate requested for both directions by default.
pub const DEFAULT_BAUD: u32 = 14400;

/// Ordered terminal mode list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminalModes {
    modes: Vec<(u8, u32)>,
}

impl TerminalModes {
    /// An empty mode list.
    pub fn new() -> Self {
        Self::default()
    }

    /// The mode set a client requests for an interactive session:
    /// echo on, 14400 baud in and out.
    pub fn default_session() -> Self {
        Self::new()
            .with(ECHO, 1)
            .with(TTY_OP_ISPEED, DEFAULT_BAUD)
            .with(TTY_OP_OSPEED, DEFAULT_BAUD)
    }

    /// Set `opcode` to `value`, replacing an earlier entry for it.
    pub fn with(mut self, opcode: u8, value: u32) -> Self {
        self.set(opcode, value);
        self
    }

    /// Set `opcode` to `value`, replacing an earlier entry for it.
    pub fn set(&mut self, opcode: u8, value: u32) {
        match self.modes.iter_mut().find(|(op, _)| *op == opcode) {
            Some(entry) => entry.1 = value,
            None => self.modes.push((opcode, value)),
        }
    }

    /// Value of `opcode`, if present.
    pub fn get(&self, opcode: u8) -> Option<u32> {
        self.modes
            .iter()
            .find(|(op, _)| *op == opcode)
            .map(|(_, value)| *value)
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (u8, u32)> + '_ {
        self.modes.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.modes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }

    /// Encode to the opcode/value byte form, including the terminator.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.modes.len() * 5 + 1);
        for (opcode, value) in &self.modes {
            buf.put_u8(*opcode);
            buf.put_u32(*value);
        }
        buf.put_u8(TTY_OP_END);
        buf.to_vec()
    }

    /// Decode the opcode/value byte form.
    ///
    /// A missing terminator is tolerated; a truncated value is not.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let mut reader = PayloadReader::new(raw);
        let mut modes = Self::new();
        while reader.remaining() > 0 {
            let opcode = reader.read_u8()?;
            if opcode == TTY_OP_END || opcode >= FIRST_UNDEFINED_OPCODE {
                break;
            }
            let value = reader.read_u32()?;
            modes.set(opcode, value);
        }
        Ok(modes)
    }
}

impl FromIterator<(u8, u32)> for TerminalModes {
    fn from_iter<I: IntoIterator<Item = (u8, u32)>>(iter: I) -> Self {
        let mut modes = Self::new();
        for (opcode, value) in iter {
            modes.set(opcode, value);
        }
        modes
    }
}
