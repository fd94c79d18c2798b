//! Wire-level protocol errors.

use thiserror::Error;

/// Errors produced while encoding or decoding agent protocol data.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Input ended before a field completed.
    #[error("short read: input ended while reading {0}")]
    ShortRead(&'static str),

    /// Declared framing is invalid or unsupported.
    #[error("bad format: {0}")]
    BadFormat(String),

    /// A keytype or extension name is not registered.
    #[error("unknown type: {0}")]
    UnknownType(String),

    /// The encoder attempted to exceed the frame budget.
    #[error("message too large: frames are limited to {} bytes", super::MAX_FRAME_SIZE)]
    TooLarge,
}

impl ProtoError {
    pub(crate) fn bad_format(msg: impl Into<String>) -> Self {
        Self::BadFormat(msg.into())
    }
}

/// Result alias for wire-level operations.
pub type ProtoResult<T> = std::result::Result<T, ProtoError>;
