//! Terminal size in character cells.

use std::fmt;

/// Width and height of a terminal in character cells.
///
/// Compared by value; a resize is any change in either field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TerminalDimensions {
    /// Columns.
    pub width: u16,
    /// Rows.
    pub height: u16,
}

impl TerminalDimensions {
    /// Create dimensions from columns and rows.
    pub const fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }

    /// Both fields are non-zero.
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// Build from wire `uint32` values, saturating at `u16::MAX`.
    pub fn from_wire(width: u32, height: u32) -> Self {
        Self {
            width: width.min(u16::MAX as u32) as u16,
            height: height.min(u16::MAX as u32) as u16,
        }
    }
}

impl Default for TerminalDimensions {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

impl fmt::Display for TerminalDimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}
