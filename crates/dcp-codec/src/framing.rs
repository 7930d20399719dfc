//! Length-indicator framing.
//!
//! On stream transports every PDU is preceded by its length as a 4-byte
//! little-endian integer. Datagram transports carry exactly one frame per
//! datagram.

use crate::error::{CodecError, CodecResult};
use tracing::trace;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Prefix `pdu` with its length.
#[must_use]
pub fn encode_frame(pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(pdu.len() + LENGTH_PREFIX_SIZE);
    frame.extend_from_slice(&u32::try_from(pdu.len()).unwrap_or(u32::MAX).to_le_bytes());
    frame.extend_from_slice(pdu);
    frame
}

/// Strip the length prefix of a single complete frame, e.g. a datagram.
///
/// # Errors
///
/// Fails if the frame is shorter than the prefix or the prefix disagrees
/// with the number of bytes that follow.
pub fn decode_frame(frame: &[u8]) -> CodecResult<&[u8]> {
    let declared = read_prefix(frame).ok_or(CodecError::FrameLengthMismatch {
        declared: 0,
        have: frame.len(),
    })?;
    let body = &frame[LENGTH_PREFIX_SIZE..];
    if body.len() != declared {
        return Err(CodecError::FrameLengthMismatch {
            declared,
            have: body.len(),
        });
    }
    Ok(body)
}

fn read_prefix(bytes: &[u8]) -> Option<usize> {
    let prefix: [u8; LENGTH_PREFIX_SIZE] = bytes.get(..LENGTH_PREFIX_SIZE)?.try_into().ok()?;
    usize::try_from(u32::from_le_bytes(prefix)).ok()
}

/// Incremental frame splitter for stream transports.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a decoder rejecting PDUs longer than `max_frame_size`.
    #[must_use]
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_size,
        }
    }

    /// Append received bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet returned.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Take the next complete PDU (without prefix), if any.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::FrameTooLarge`] when the announced length
    /// exceeds the limit; the buffer is discarded since the stream cannot
    /// be resynchronized.
    pub fn next_frame(&mut self) -> CodecResult<Option<Vec<u8>>> {
        let Some(declared) = read_prefix(&self.buffer) else {
            return Ok(None);
        };
        if declared > self.max_frame_size {
            self.buffer.clear();
            return Err(CodecError::FrameTooLarge {
                declared,
                max: self.max_frame_size,
            });
        }
        let end = LENGTH_PREFIX_SIZE + declared;
        if self.buffer.len() < end {
            return Ok(None);
        }
        let pdu = self.buffer[LENGTH_PREFIX_SIZE..end].to_vec();
        self.buffer.drain(..end);
        trace!(len = pdu.len(), remaining = self.buffer.len(), "Frame complete");
        Ok(Some(pdu))
    }
}
