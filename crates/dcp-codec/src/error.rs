use dcp_common::{PduType, SlaveError};
use thiserror::Error;

/// Errors raised while decoding PDUs or frames.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Zero-length input.
    #[error("empty PDU")]
    Empty,

    /// Buffer shorter than the fields of its PDU type.
    #[error("{pdu_type} needs at least {need} bytes, got {have}")]
    Truncated {
        /// Decoded type tag.
        pdu_type: PduType,
        /// Bytes required to read all fields.
        need: usize,
        /// Bytes available.
        have: usize,
    },

    /// Field read past the end of the buffer.
    #[error("read of {len} bytes at offset {offset} exceeds buffer of {have} bytes")]
    OutOfBounds {
        /// Field offset.
        offset: usize,
        /// Field width.
        len: usize,
        /// Buffer length.
        have: usize,
    },

    /// Length prefix larger than the configured maximum.
    #[error("frame length {declared} exceeds limit of {max} bytes")]
    FrameTooLarge {
        /// Length announced by the prefix.
        declared: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Length prefix disagrees with the bytes that follow it.
    #[error("frame announces {declared} bytes but carries {have}")]
    FrameLengthMismatch {
        /// Length announced by the prefix.
        declared: usize,
        /// Bytes following the prefix.
        have: usize,
    },
}

/// Convenience type alias for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

impl From<CodecError> for SlaveError {
    fn from(err: CodecError) -> Self {
        SlaveError::Codec(err.to_string())
    }
}
