//! Protocol error types

use thiserror::Error;

/// Host link protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Packet type byte is not one we know about
    #[error("Unknown packet type: {0:#04x}")]
    UnknownPacketType(u8),

    /// Packet type is valid but not allowed in this direction
    #[error("Unexpected packet type: {0:#04x}")]
    UnexpectedPacketType(u8),

    /// Log packet carried an unknown severity byte
    #[error("Invalid log level: {0}")]
    InvalidLogLevel(u8),

    /// Frame had a zero length prefix, so there is no packet type
    #[error("Empty frame")]
    EmptyFrame,

    /// Frame length exceeds what the 16-bit prefix can describe
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Incomplete frame data
    #[error("Incomplete frame: expected {expected} bytes, got {actual}")]
    IncompleteFrame { expected: usize, actual: usize },

    /// I/O error during frame operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// True when the peer closed the stream cleanly between frames
    pub fn is_eof(&self) -> bool {
        matches!(self, ProtocolError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
