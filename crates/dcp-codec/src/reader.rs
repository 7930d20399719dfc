//! Bounds-checked little-endian field access.

use crate::error::{CodecError, CodecResult};

/// Read-only cursor-free view used by the decoder; every accessor takes
/// an absolute offset from the type tag.
#[derive(Clone, Copy)]
pub(crate) struct FieldReader<'a> {
    bytes: &'a [u8],
}

impl<'a> FieldReader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub(crate) fn slice(&self, offset: usize, len: usize) -> CodecResult<&'a [u8]> {
        offset
            .checked_add(len)
            .and_then(|end| self.bytes.get(offset..end))
            .ok_or(CodecError::OutOfBounds {
                offset,
                len,
                have: self.bytes.len(),
            })
    }

    pub(crate) fn array<const N: usize>(&self, offset: usize) -> CodecResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.slice(offset, N)?);
        Ok(out)
    }

    pub(crate) fn tail(&self, offset: usize) -> CodecResult<&'a [u8]> {
        self.bytes.get(offset..).ok_or(CodecError::OutOfBounds {
            offset,
            len: 0,
            have: self.bytes.len(),
        })
    }

    pub(crate) fn u8(&self, offset: usize) -> CodecResult<u8> {
        Ok(self.array::<1>(offset)?[0])
    }

    pub(crate) fn u16(&self, offset: usize) -> CodecResult<u16> {
        self.array(offset).map(u16::from_le_bytes)
    }

    pub(crate) fn u32(&self, offset: usize) -> CodecResult<u32> {
        self.array(offset).map(u32::from_le_bytes)
    }

    pub(crate) fn u64(&self, offset: usize) -> CodecResult<u64> {
        self.array(offset).map(u64::from_le_bytes)
    }

    pub(crate) fn i64(&self, offset: usize) -> CodecResult<i64> {
        self.array(offset).map(i64::from_le_bytes)
    }
}
