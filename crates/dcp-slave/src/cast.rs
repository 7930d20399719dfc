//! Source-to-declared data type compatibility.
//!
//! A master may send a value in a narrower wire type than the slave
//! declares. A cast is legal only when every value of the source type is
//! exactly representable in the declared type.

use dcp_common::DataType;

/// Returns true if values of `source` may be written into a variable
/// declared as `declared`.
#[must_use]
pub fn cast_allowed(declared: DataType, source: DataType) -> bool {
    use DataType::*;

    match declared {
        Uint8 => source == Uint8,
        Uint16 => matches!(source, Uint8 | Uint16),
        Uint32 => matches!(source, Uint8 | Uint16 | Uint32),
        Uint64 => matches!(source, Uint8 | Uint16 | Uint32 | Uint64),
        Int8 => source == Int8,
        Int16 => matches!(source, Uint8 | Int8 | Int16),
        Int32 => matches!(source, Uint8 | Uint16 | Int8 | Int16 | Int32),
        Int64 => matches!(
            source,
            Uint8 | Uint16 | Uint32 | Int8 | Int16 | Int32 | Int64
        ),
        Float32 => matches!(source, Uint8 | Uint16 | Int8 | Int16 | Float32),
        Float64 => matches!(
            source,
            Uint8 | Uint16 | Uint32 | Int8 | Int16 | Int32 | Float32 | Float64
        ),
        String => source == String,
        Binary => source == Binary,
    }
}
