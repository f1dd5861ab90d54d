//! Error types for the wire layer

use thiserror::Error;

/// Wire protocol error types
#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad magic: {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("unsupported protocol version {major}.{minor}")]
    UnsupportedProtocol { major: u8, minor: u8 },

    #[error("unsupported encoding version {major}.{minor}")]
    UnsupportedEncoding { major: u8, minor: u8 },

    #[error("invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("invalid reply status: {0}")]
    InvalidReplyStatus(u8),

    #[error("invalid invocation mode: {0}")]
    InvalidMode(u8),

    #[error("compressed messages are not supported")]
    CompressionNotSupported,

    #[error("buffer underflow: need {needed} bytes, have {have}")]
    BufferUnderflow { needed: usize, have: usize },

    #[error("invalid size: {0}")]
    InvalidSize(i32),

    #[error("invalid string: {0}")]
    InvalidString(#[from] std::string::FromUtf8Error),

    #[error("message too large: {size} bytes exceeds maximum {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("{0} trailing bytes after message body")]
    TrailingData(usize),

    #[error("connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, WireError>;
