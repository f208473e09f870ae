//! Error types for oxiflash-core
//!
//! This module provides a no_std compatible error type that can be used
//! throughout the crate.

use core::fmt;

/// Core error type - no_std compatible, Copy for efficiency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Opcode is not supported by the programmer
    OpcodeNotSupported,

    /// General programmer error
    ProgrammerError,

    /// Read operation failed
    ReadError,

    /// Write/program operation failed
    WriteError,

    /// Polling for chip ready did not settle
    PollTimeout,

    /// Operation timed out
    Timeout,

    /// Address is beyond the addressable range
    AddressOutOfBounds,

    /// I/O error occurred
    IoError,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpcodeNotSupported => write!(f, "opcode not supported by programmer"),
            Self::ProgrammerError => write!(f, "programmer error"),
            Self::ReadError => write!(f, "read operation failed"),
            Self::WriteError => write!(f, "write operation failed"),
            Self::PollTimeout => write!(f, "chip ready poll did not settle"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::AddressOutOfBounds => write!(f, "address out of bounds"),
            Self::IoError => write!(f, "I/O error"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Result type alias using the core Error type
pub type Result<T> = core::result::Result<T, Error>;
