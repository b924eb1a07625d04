//! Error types for the chat core

use std::io;

use thiserror::Error;

/// Faults raised while reading or decoding a single frame.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The stream ended cleanly before a new frame started.
    #[error("stream closed")]
    Closed,

    /// Transport failure, including EOF in the middle of a frame.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A frame declared a length of zero, so it cannot even hold a type tag.
    #[error("frame declares zero length")]
    ZeroLength,

    /// A frame declared more bytes than this node is willing to buffer. Its
    /// body has been skipped.
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: u32, max: u32 },

    /// Type tag outside 0..=4. The frame body has been consumed.
    #[error("unknown message type {0}")]
    UnknownType(u8),

    /// A fixed field or declared sub-length does not fit inside the frame.
    #[error("truncated {field}: need {needed} bytes, {available} available")]
    Truncated {
        field: &'static str,
        needed: usize,
        available: usize,
    },

    /// A text field was not a whole number of UTF-16 code units.
    #[error("{0} has an odd byte length")]
    OddStringLength(&'static str),

    /// A text field did not decode as UTF-16.
    #[error("{0} is not valid UTF-16")]
    InvalidUtf16(&'static str),

    /// A handshake carried the wrong protocol identifier.
    #[error("handshake protocol identifier mismatch: {0:?}")]
    ProtocolMismatch(String),
}

impl CodecError {
    /// Whether the reader is still aligned on a frame boundary after this
    /// error, so the session may keep reading.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CodecError::UnknownType(_)
                | CodecError::FrameTooLarge { .. }
                | CodecError::Truncated { .. }
                | CodecError::OddStringLength(_)
                | CodecError::InvalidUtf16(_)
                | CodecError::ProtocolMismatch(_)
        )
    }
}

/// Main error type for chat core operations
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("could not connect to {address}: {reason}")]
    ConnectFailed { address: String, reason: String },

    #[error("recipient {0:?} not found")]
    RecipientNotFound(String),

    #[error("session is closed")]
    SessionClosed,

    #[error("keep-alive probe timed out")]
    ProbeTimeout,

    #[error("node is shut down")]
    ShutDown,

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(CodecError::UnknownType(9).is_recoverable());
        assert!(CodecError::ProtocolMismatch("x".into()).is_recoverable());
        assert!(CodecError::FrameTooLarge { len: 9, max: 8 }.is_recoverable());
        assert!(!CodecError::Closed.is_recoverable());
        assert!(!CodecError::ZeroLength.is_recoverable());
        assert!(!CodecError::Io(io::ErrorKind::UnexpectedEof.into()).is_recoverable());
    }
}
