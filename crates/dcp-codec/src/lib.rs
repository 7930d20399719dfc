//! Binary codec for DCP protocol data units.
//!
//! Decoding borrows the received buffer ([`PduView`]); encoding produces an
//! owning, length-prefixed buffer ([`OwnedPdu`]). All multi-byte fields are
//! little-endian and every read is bounds-checked.

pub mod error;
pub mod framing;
pub mod pdu;
mod reader;

pub use error::*;
pub use framing::*;
pub use pdu::*;
