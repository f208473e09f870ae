//! Error types for serprog operations

use thiserror::Error;

/// Serprog-specific errors
#[derive(Debug, Error)]
pub enum SerprogError {
    /// Failed to connect to device
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to synchronize protocol
    #[error("Protocol synchronization failed")]
    SyncFailed,

    /// Unsupported protocol version
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    /// Command not supported by programmer
    #[error("Command 0x{0:02X} not supported")]
    CommandNotSupported(u8),

    /// NAK response to a synchronous command
    #[error("NAK received for command 0x{0:02X}")]
    Nak(u8),

    /// Invalid response to a synchronous command
    #[error("Invalid response 0x{response:02X} for command 0x{command:02X}")]
    InvalidResponse {
        /// The command that was sent
        command: u8,
        /// The byte the device replied with
        response: u8,
    },

    /// NAK acknowledgement for a streamed operation
    #[error("NAK to streamed operation: {0}")]
    StreamNak(&'static str),

    /// Acknowledgement byte was neither ACK nor NAK
    #[error("Invalid reply 0x{reply:02X} to streamed operation: {op}")]
    StreamReply {
        /// Display name of the in-flight operation
        op: &'static str,
        /// The byte the device replied with
        reply: u8,
    },

    /// Software chip-ready poll did not settle
    #[error("Chip ready poll did not settle")]
    PollTimeout,

    /// I/O error during communication
    #[error("I/O error: {0}")]
    IoError(String),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Serial port error
    #[error("Serial port error: {0}")]
    SerialError(#[from] serialport::Error),
}

/// Result type for serprog operations
pub type Result<T> = core::result::Result<T, SerprogError>;

impl From<std::io::Error> for SerprogError {
    fn from(e: std::io::Error) -> Self {
        SerprogError::IoError(e.to_string())
    }
}

impl From<SerprogError> for oxiflash_core::Error {
    fn from(e: SerprogError) -> Self {
        match e {
            SerprogError::CommandNotSupported(_) => oxiflash_core::Error::OpcodeNotSupported,
            SerprogError::PollTimeout => oxiflash_core::Error::PollTimeout,
            SerprogError::IoError(_) | SerprogError::SerialError(_) => {
                oxiflash_core::Error::IoError
            }
            _ => oxiflash_core::Error::ProgrammerError,
        }
    }
}
