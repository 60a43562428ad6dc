//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors that can occur during the handshake, framing or
/// body encoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid magic bytes: expected 'BRPC', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("invalid frame flags: {0:#x}")]
    InvalidFlags(u16),

    #[error("unexpected frame: expected {expected}")]
    UnexpectedFrame { expected: &'static str },

    #[error("invalid magic number {0:#x}")]
    InvalidMagicNumber(u32),

    #[error("invalid codec type {0}")]
    UnknownCodec(String),

    #[error("options line exceeds {0} bytes")]
    OptionsTooLong(usize),

    #[error("{codec} encode error: {message}")]
    Encode {
        codec: &'static str,
        message: String,
    },

    #[error("{codec} decode error: {message}")]
    Decode {
        codec: &'static str,
        message: String,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("unexpected EOF: connection closed mid-frame")]
    UnexpectedEof,
}

impl ProtocolError {
    /// Returns whether the peer closed the stream cleanly between frames.
    pub fn is_eof(&self) -> bool {
        matches!(self, ProtocolError::ConnectionClosed)
    }
}
