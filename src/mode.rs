//! Access mode strings

use std::fmt;
use std::str::FromStr;

use crate::error::NstoreError;

/// Mode strings accepted by [`AccessMode::parse`]
pub const SUPPORTED_MODES: &[&str] = &["r", "rt", "rb", "w", "wt", "wb", "a", "at", "ab"];

/// Which way content flows through a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    /// Truncate (or create) and write
    Write,
    /// Keep existing content and write after it
    Append,
}

/// Parsed access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessMode {
    pub direction: Direction,
    /// Bytes flow through the handle as-is; otherwise content is UTF-8 text
    pub binary: bool,
}

impl AccessMode {
    pub const READ_TEXT: AccessMode = AccessMode {
        direction: Direction::Read,
        binary: false,
    };
    pub const READ_BINARY: AccessMode = AccessMode {
        direction: Direction::Read,
        binary: true,
    };
    pub const WRITE_TEXT: AccessMode = AccessMode {
        direction: Direction::Write,
        binary: false,
    };
    pub const WRITE_BINARY: AccessMode = AccessMode {
        direction: Direction::Write,
        binary: true,
    };

    pub fn parse(mode: &str) -> Result<Self, NstoreError> {
        let direction = match mode.chars().next() {
            Some('r') => Direction::Read,
            Some('w') => Direction::Write,
            Some('a') => Direction::Append,
            _ => return Err(invalid_mode(mode)),
        };

        let binary = match &mode[1..] {
            "" | "t" => false,
            "b" => true,
            _ => return Err(invalid_mode(mode)),
        };

        Ok(Self { direction, binary })
    }

    pub fn is_read(&self) -> bool {
        self.direction == Direction::Read
    }

    /// Write or append
    pub fn is_write(&self) -> bool {
        !self.is_read()
    }
}

fn invalid_mode(mode: &str) -> NstoreError {
    NstoreError::InvalidMode {
        mode: mode.to_string(),
        allowed: SUPPORTED_MODES.join(", "),
    }
}

impl FromStr for AccessMode {
    type Err = NstoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = match self.direction {
            Direction::Read => "r",
            Direction::Write => "w",
            Direction::Append => "a",
        };
        let kind = if self.binary { "b" } else { "t" };
        write!(f, "{}{}", direction, kind)
    }
}
