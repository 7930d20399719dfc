//! Runtime-typed, multi-dimensional variable values.
//!
//! Every declared variable owns one [`VariableValue`]. Numeric values are
//! stored in a vector of their declared Rust type, so host code gets typed
//! slices instead of raw bytes. Values arrive on the wire in a source type
//! that may be narrower than the declared one and are widened on update.
//!
//! String and binary values are single blobs on the wire, prefixed with a
//! 32-bit little-endian length. They ignore declared dimensions.

use crate::description::{Causality, Dimension, SlaveDescription, StartValue};
use dcp_common::{DataType, ValueConfig};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

/// Size of the length prefix of string and binary values.
pub const STRING_LENGTH_PREFIX: usize = 4;

/// Errors raised while updating values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValueError {
    /// Not enough input bytes.
    #[error("need {need} bytes at offset {offset}, buffer has {have}")]
    OutOfBounds {
        /// Read offset.
        offset: usize,
        /// Bytes required.
        need: usize,
        /// Buffer length.
        have: usize,
    },

    /// String or binary longer than the declared maximum.
    #[error("{len} bytes exceed capacity of {max}")]
    TooLong {
        /// Received length.
        len: usize,
        /// Declared maximum.
        max: usize,
    },

    /// The source type cannot be converted into the declared type.
    #[error("cannot convert {source_type} into {declared}")]
    IncompatibleType {
        /// Declared type.
        declared: DataType,
        /// Wire type.
        source_type: DataType,
    },

    /// No value exists for the reference.
    #[error("unknown value reference {0}")]
    UnknownValueReference(u64),

    /// Start value does not fit the variable.
    #[error("start value of vr {0} does not match its type or shape")]
    InvalidStartValue(u64),

    /// A shape exceeds the element limit or overflows.
    #[error("shape {shape:?} of vr {vr} exceeds {max} elements")]
    ShapeTooLarge {
        /// Value whose shape was rejected.
        vr: u64,
        /// Rejected dimensions.
        shape: Vec<usize>,
        /// Configured element limit.
        max: usize,
    },
}

/// Convenience type alias for value operations.
pub type ValueResult<T> = Result<T, ValueError>;

mod sealed {
    /// Intermediate form of a numeric wire value.
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub enum Number {
        Unsigned(u64),
        Signed(i64),
        Float(f64),
    }

    /// Backing storage of a value.
    #[derive(Debug, Clone, PartialEq)]
    pub enum Storage {
        Uint8(Vec<u8>),
        Uint16(Vec<u16>),
        Uint32(Vec<u32>),
        Uint64(Vec<u64>),
        Int8(Vec<i8>),
        Int16(Vec<i16>),
        Int32(Vec<i32>),
        Int64(Vec<i64>),
        Float32(Vec<f32>),
        Float64(Vec<f64>),
        Bytes { data: Vec<u8>, max_size: usize },
    }

    pub trait Scalar: Copy + Default + 'static {
        fn slice(storage: &Storage) -> Option<&[Self]>;
        fn slice_mut(storage: &mut Storage) -> Option<&mut [Self]>;
        fn alloc(len: usize) -> Storage;
        fn from_number(n: Number) -> Self;
        fn to_number(self) -> Number;
        fn write_le(self, out: &mut Vec<u8>);
    }
}

use sealed::{Number, Scalar, Storage};

/// Numeric Rust types that back DCP data types.
pub trait DcpScalar: Scalar {
    /// DCP type stored as `Self`.
    const DATA_TYPE: DataType;
}

macro_rules! impl_scalar {
    ($($t:ty => $variant:ident, $num:ident;)*) => {$(
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss,
            clippy::cast_possible_wrap,
            clippy::cast_lossless
        )]
        impl Scalar for $t {
            fn slice(storage: &Storage) -> Option<&[Self]> {
                match storage {
                    Storage::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn slice_mut(storage: &mut Storage) -> Option<&mut [Self]> {
                match storage {
                    Storage::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn alloc(len: usize) -> Storage {
                Storage::$variant(vec![<$t>::default(); len])
            }

            fn from_number(n: Number) -> Self {
                match n {
                    Number::Unsigned(v) => v as $t,
                    Number::Signed(v) => v as $t,
                    Number::Float(v) => v as $t,
                }
            }

            fn to_number(self) -> Number {
                Number::$num(self as _)
            }

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
        }

        impl DcpScalar for $t {
            const DATA_TYPE: DataType = DataType::$variant;
        }
    )*};
}

impl_scalar! {
    u8 => Uint8, Unsigned;
    u16 => Uint16, Unsigned;
    u32 => Uint32, Unsigned;
    u64 => Uint64, Unsigned;
    i8 => Int8, Signed;
    i16 => Int16, Signed;
    i32 => Int32, Signed;
    i64 => Int64, Signed;
    f32 => Float32, Float;
    f64 => Float64, Float;
}

/// Read one element of `source_type` at the start of `bytes`.
fn read_number(source_type: DataType, bytes: &[u8]) -> Option<Number> {
    fn le<const N: usize>(bytes: &[u8]) -> Option<[u8; N]> {
        bytes.get(..N)?.try_into().ok()
    }

    let n = match source_type {
        DataType::Uint8 => Number::Unsigned(u64::from(*bytes.first()?)),
        DataType::Uint16 => Number::Unsigned(u64::from(u16::from_le_bytes(le(bytes)?))),
        DataType::Uint32 => Number::Unsigned(u64::from(u32::from_le_bytes(le(bytes)?))),
        DataType::Uint64 => Number::Unsigned(u64::from_le_bytes(le(bytes)?)),
        DataType::Int8 => Number::Signed(i64::from(i8::from_le_bytes(le(bytes)?))),
        DataType::Int16 => Number::Signed(i64::from(i16::from_le_bytes(le(bytes)?))),
        DataType::Int32 => Number::Signed(i64::from(i32::from_le_bytes(le(bytes)?))),
        DataType::Int64 => Number::Signed(i64::from_le_bytes(le(bytes)?)),
        DataType::Float32 => Number::Float(f64::from(f32::from_le_bytes(le(bytes)?))),
        DataType::Float64 => Number::Float(f64::from_le_bytes(le(bytes)?)),
        DataType::String | DataType::Binary => return None,
    };
    Some(n)
}

fn fill<T: Scalar>(dst: &mut [T], src: &[u8], source_type: DataType, width: usize) {
    for (slot, chunk) in dst.iter_mut().zip(src.chunks_exact(width)) {
        if let Some(n) = read_number(source_type, chunk) {
            *slot = T::from_number(n);
        }
    }
}

fn write_all<T: Scalar>(src: &[T], out: &mut Vec<u8>) {
    for v in src {
        v.write_le(out);
    }
}

fn broadcast<T: Scalar>(dst: &mut [T], numbers: &[Number]) -> bool {
    match numbers {
        [single] => dst.fill(T::from_number(*single)),
        many if many.len() == dst.len() => {
            for (slot, n) in dst.iter_mut().zip(many) {
                *slot = T::from_number(*n);
            }
        }
        _ => return false,
    }
    true
}

/// Apply `$body` to the numeric vector of `$storage`, bound as `$v`.
macro_rules! with_numeric {
    ($storage:expr, $v:ident => $body:expr, $bytes:pat => $other:expr) => {
        match $storage {
            Storage::Uint8($v) => $body,
            Storage::Uint16($v) => $body,
            Storage::Uint32($v) => $body,
            Storage::Uint64($v) => $body,
            Storage::Int8($v) => $body,
            Storage::Int16($v) => $body,
            Storage::Int32($v) => $body,
            Storage::Int64($v) => $body,
            Storage::Float32($v) => $body,
            Storage::Float64($v) => $body,
            $bytes => $other,
        }
    };
}

/// Number of elements of `shape`, or `None` on overflow.
fn shape_len(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &n| acc.checked_mul(n))
}

fn allocate(data_type: DataType, len: usize, max_size: usize) -> Storage {
    match data_type {
        DataType::Uint8 => u8::alloc(len),
        DataType::Uint16 => u16::alloc(len),
        DataType::Uint32 => u32::alloc(len),
        DataType::Uint64 => u64::alloc(len),
        DataType::Int8 => i8::alloc(len),
        DataType::Int16 => i16::alloc(len),
        DataType::Int32 => i32::alloc(len),
        DataType::Int64 => i64::alloc(len),
        DataType::Float32 => f32::alloc(len),
        DataType::Float64 => f64::alloc(len),
        DataType::String | DataType::Binary => Storage::Bytes {
            data: Vec::new(),
            max_size,
        },
    }
}

/// Value of one variable.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableValue {
    data_type: DataType,
    dimensions: Vec<usize>,
    storage: Storage,
}

impl VariableValue {
    /// Create a zeroed value. `max_size` caps string and binary values and
    /// is ignored for numeric types.
    ///
    /// # Panics
    ///
    /// Panics if the element count of `dimensions` overflows `usize`.
    #[must_use]
    pub fn new(data_type: DataType, dimensions: &[usize], max_size: usize) -> Self {
        let len = shape_len(dimensions)
            .unwrap_or_else(|| panic!("shape {dimensions:?} overflows the element count"));
        Self {
            data_type,
            dimensions: dimensions.to_vec(),
            storage: allocate(data_type, len, max_size),
        }
    }

    /// Declared type.
    #[must_use]
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Current shape; empty for scalars.
    #[must_use]
    pub fn dimensions(&self) -> &[usize] {
        &self.dimensions
    }

    /// Number of elements (1 for string and binary).
    #[must_use]
    pub fn element_count(&self) -> usize {
        with_numeric!(&self.storage, v => v.len(), Storage::Bytes { .. } => 1)
    }

    /// Bytes this value occupies on the wire when sent as `source_type`.
    /// `None` for string and binary, whose length is carried in-band.
    #[must_use]
    pub fn wire_size(&self, source_type: DataType) -> Option<usize> {
        if self.data_type.is_variable_size() {
            return None;
        }
        source_type.size().map(|size| size * self.element_count())
    }

    /// Update from wire bytes at `offset`, converting from `source_type`.
    /// Returns the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Fails if `src` is too short, a blob exceeds the capacity, or the
    /// source type is not numeric for a numeric value (and vice versa).
    pub fn update(&mut self, src: &[u8], offset: usize, source_type: DataType) -> ValueResult<usize> {
        let declared = self.data_type;
        let incompatible = ValueError::IncompatibleType {
            declared,
            source_type,
        };
        let available = src.len().saturating_sub(offset);
        let out_of_bounds = |need| ValueError::OutOfBounds {
            offset,
            need,
            have: src.len(),
        };

        if let Storage::Bytes { data, max_size } = &mut self.storage {
            if source_type != declared {
                return Err(incompatible);
            }
            let prefix: [u8; STRING_LENGTH_PREFIX] = src
                .get(offset..offset + STRING_LENGTH_PREFIX)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| out_of_bounds(STRING_LENGTH_PREFIX))?;
            let len = u32::from_le_bytes(prefix) as usize;
            if len > *max_size {
                return Err(ValueError::TooLong {
                    len,
                    max: *max_size,
                });
            }
            let need = STRING_LENGTH_PREFIX + len;
            if available < need {
                return Err(out_of_bounds(need));
            }
            data.clear();
            data.extend_from_slice(&src[offset + STRING_LENGTH_PREFIX..offset + need]);
            return Ok(need);
        }

        let width = source_type.size().filter(|_| !source_type.is_variable_size()).ok_or(incompatible)?;
        let need = width * self.element_count();
        if available < need {
            return Err(out_of_bounds(need));
        }
        let window = &src[offset..offset + need];
        with_numeric!(&mut self.storage, v => fill(v, window, source_type, width), Storage::Bytes { .. } => {});
        Ok(need)
    }

    /// Append the wire form in the declared type. Returns the bytes written.
    pub fn serialize(&self, out: &mut Vec<u8>) -> usize {
        let start = out.len();
        with_numeric!(&self.storage, v => write_all(v, out), Storage::Bytes { data, .. } => {
            out.extend_from_slice(&u32::try_from(data.len()).unwrap_or(u32::MAX).to_le_bytes());
            out.extend_from_slice(data);
        });
        out.len() - start
    }

    /// Typed view of the elements.
    ///
    /// # Panics
    ///
    /// Panics if `T` is not the declared type.
    #[must_use]
    pub fn as_slice<T: DcpScalar>(&self) -> &[T] {
        T::slice(&self.storage).unwrap_or_else(|| {
            panic!("value declared as {} accessed as {}", self.data_type, T::DATA_TYPE)
        })
    }

    /// Mutable typed view of the elements.
    ///
    /// # Panics
    ///
    /// Panics if `T` is not the declared type.
    pub fn as_mut_slice<T: DcpScalar>(&mut self) -> &mut [T] {
        let declared = self.data_type;
        T::slice_mut(&mut self.storage).unwrap_or_else(|| {
            panic!("value declared as {declared} accessed as {}", T::DATA_TYPE)
        })
    }

    /// Content of a string or binary value.
    ///
    /// # Panics
    ///
    /// Panics for numeric values.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match &self.storage {
            Storage::Bytes { data, .. } => data,
            _ => panic!("numeric value of type {} accessed as bytes", self.data_type),
        }
    }

    /// Replace the content of a string or binary value.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::TooLong`] beyond the capacity.
    ///
    /// # Panics
    ///
    /// Panics for numeric values.
    pub fn set_bytes(&mut self, bytes: &[u8]) -> ValueResult<()> {
        match &mut self.storage {
            Storage::Bytes { data, max_size } => {
                if bytes.len() > *max_size {
                    return Err(ValueError::TooLong {
                        len: bytes.len(),
                        max: *max_size,
                    });
                }
                data.clear();
                data.extend_from_slice(bytes);
                Ok(())
            }
            _ => panic!("numeric value of type {} accessed as bytes", self.data_type),
        }
    }

    /// First element as `u64`, for structural parameters.
    #[must_use]
    pub fn uint_value(&self) -> Option<u64> {
        let first = with_numeric!(&self.storage, v => v.first().map(|x| x.to_number()), Storage::Bytes { .. } => None)?;
        match first {
            Number::Unsigned(v) => Some(v),
            Number::Signed(v) => u64::try_from(v).ok(),
            Number::Float(_) => None,
        }
    }

    /// Reallocate with a new shape. Numeric content is reset to zero;
    /// string and binary values are left untouched.
    fn reshape(&mut self, dimensions: Vec<usize>) {
        if self.data_type.is_variable_size() {
            return;
        }
        let len = shape_len(&dimensions).unwrap_or_default();
        self.storage = allocate(self.data_type, len, 0);
        self.dimensions = dimensions;
    }

    fn apply_start(&mut self, start: &StartValue) -> bool {
        let numbers: Vec<Number> = match start {
            StartValue::Text(text) => {
                return matches!(self.storage, Storage::Bytes { .. }) && self.set_bytes(text.as_bytes()).is_ok();
            }
            StartValue::Integer(i) => vec![Number::Signed(*i)],
            StartValue::Float(f) => vec![Number::Float(*f)],
            StartValue::Integers(list) => list.iter().map(|i| Number::Signed(*i)).collect(),
            StartValue::Floats(list) => list.iter().map(|f| Number::Float(*f)).collect(),
        };
        with_numeric!(&mut self.storage, v => broadcast(v, &numbers), Storage::Bytes { .. } => false)
    }
}

/// All variable values of a slave plus the structural parameter links.
#[derive(Debug, Clone, Default)]
pub struct ValueStore {
    values: HashMap<u64, VariableValue>,
    /// Declared dimensions of every array variable.
    shapes: HashMap<u64, Vec<Dimension>>,
    /// Structural vr -> (dependent vr, dimension index).
    dependencies: HashMap<u64, Vec<(u64, usize)>>,
    shape_generation: u64,
    max_elements: usize,
}

impl ValueStore {
    /// Create values for every declared variable, structural parameters
    /// first, and apply start values.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::InvalidStartValue`] if a start value does not
    /// match its variable and [`ValueError::ShapeTooLarge`] if a declared
    /// shape exceeds `config.max_elements`.
    pub fn from_description(
        description: &SlaveDescription,
        config: &ValueConfig,
    ) -> ValueResult<Self> {
        let mut store = Self {
            max_elements: config.max_elements,
            ..Self::default()
        };
        let (structural, others): (Vec<_>, Vec<_>) = description
            .variables
            .iter()
            .partition(|v| v.causality == Causality::StructuralParameter);

        for var in structural.into_iter().chain(others) {
            let vr = var.value_reference;
            for (index, dim) in var.dimensions.iter().enumerate() {
                if let Dimension::LinkedVr(linked) = dim {
                    store.dependencies.entry(*linked).or_default().push((vr, index));
                }
            }
            let shape = store.resolve_shape(&var.dimensions, None);
            store.check_shape(vr, &shape)?;
            let max_size = var.max_size.unwrap_or(config.default_max_size) as usize;
            let mut value = VariableValue::new(var.data_type, &shape, max_size);
            if let Some(start) = &var.start {
                if !value.apply_start(start) {
                    return Err(ValueError::InvalidStartValue(vr));
                }
            }
            if !var.dimensions.is_empty() {
                store.shapes.insert(vr, var.dimensions.clone());
            }
            store.values.insert(vr, value);
        }
        debug!(variables = store.values.len(), "Value store created");
        Ok(store)
    }

    /// Current shape for `dimensions`. `staged` stands in for the stored
    /// value of a structural parameter that is about to change.
    fn resolve_shape(&self, dimensions: &[Dimension], staged: Option<(u64, &VariableValue)>) -> Vec<usize> {
        dimensions
            .iter()
            .map(|dim| match dim {
                Dimension::Constant(n) => usize::try_from(*n).unwrap_or(usize::MAX),
                Dimension::LinkedVr(vr) => match staged {
                    Some((staged_vr, value)) if staged_vr == *vr => Some(value),
                    _ => self.values.get(vr),
                }
                .and_then(VariableValue::uint_value)
                .map_or(0, |n| usize::try_from(n).unwrap_or(usize::MAX)),
            })
            .collect()
    }

    fn check_shape(&self, vr: u64, shape: &[usize]) -> ValueResult<()> {
        match shape_len(shape) {
            Some(len) if len <= self.max_elements => Ok(()),
            _ => Err(ValueError::ShapeTooLarge {
                vr,
                shape: shape.to_vec(),
                max: self.max_elements,
            }),
        }
    }

    /// Value of `vr`.
    #[must_use]
    pub fn get(&self, vr: u64) -> Option<&VariableValue> {
        self.values.get(&vr)
    }

    /// Mutable value of `vr`. Writing a structural parameter this way does
    /// not reshape its dependents; use [`ValueStore::update`].
    pub fn get_mut(&mut self, vr: u64) -> Option<&mut VariableValue> {
        self.values.get_mut(&vr)
    }

    /// A value exists for `vr`.
    #[must_use]
    pub fn contains(&self, vr: u64) -> bool {
        self.values.contains_key(&vr)
    }

    /// Number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the store holds no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Bumped whenever a structural parameter changes any shape.
    #[must_use]
    pub fn shape_generation(&self) -> u64 {
        self.shape_generation
    }

    /// Other values take their shape from `vr`.
    #[must_use]
    pub fn is_structural(&self, vr: u64) -> bool {
        self.dependencies.contains_key(&vr)
    }

    /// Update `vr` from wire bytes and reshape dependents if `vr` is a
    /// structural parameter whose value changed. Nothing is written if a
    /// dependent shape would exceed the element limit.
    ///
    /// # Errors
    ///
    /// Propagates [`VariableValue::update`] failures and returns
    /// [`ValueError::ShapeTooLarge`] for an oversized dependent.
    pub fn update(
        &mut self,
        vr: u64,
        src: &[u8],
        offset: usize,
        source_type: DataType,
    ) -> ValueResult<usize> {
        if !self.is_structural(vr) {
            return self
                .values
                .get_mut(&vr)
                .ok_or(ValueError::UnknownValueReference(vr))?
                .update(src, offset, source_type);
        }

        let (staged, consumed, reshapes) = self.stage(vr, src, offset, source_type)?;
        self.values.insert(vr, staged);
        if let Some(reshapes) = reshapes {
            self.apply_reshapes(vr, reshapes);
        }
        Ok(consumed)
    }

    /// Run [`ValueStore::update`] without writing anything. Returns the
    /// number of bytes the update would consume.
    ///
    /// # Errors
    ///
    /// Same as [`ValueStore::update`].
    pub fn check_update(
        &self,
        vr: u64,
        src: &[u8],
        offset: usize,
        source_type: DataType,
    ) -> ValueResult<usize> {
        if !self.is_structural(vr) {
            let mut scratch = self
                .values
                .get(&vr)
                .ok_or(ValueError::UnknownValueReference(vr))?
                .clone();
            return scratch.update(src, offset, source_type);
        }
        self.stage(vr, src, offset, source_type)
            .map(|(_, consumed, _)| consumed)
    }

    /// Apply an update of structural parameter `vr` to a copy and work out
    /// the dependent shapes. The reshape list is `None` if the value did
    /// not change.
    #[allow(clippy::type_complexity)]
    fn stage(
        &self,
        vr: u64,
        src: &[u8],
        offset: usize,
        source_type: DataType,
    ) -> ValueResult<(VariableValue, usize, Option<Vec<(u64, Vec<usize>)>>)> {
        let current = self
            .values
            .get(&vr)
            .ok_or(ValueError::UnknownValueReference(vr))?;
        let mut staged = current.clone();
        let consumed = staged.update(src, offset, source_type)?;
        if staged.uint_value() == current.uint_value() {
            return Ok((staged, consumed, None));
        }

        let mut reshapes: Vec<(u64, Vec<usize>)> = Vec::new();
        for &(dependent, _) in self.dependencies.get(&vr).into_iter().flatten() {
            let (Some(declared), Some(value)) = (self.shapes.get(&dependent), self.values.get(&dependent))
            else {
                continue;
            };
            if value.data_type().is_variable_size() || reshapes.iter().any(|(r, _)| *r == dependent) {
                continue;
            }
            let shape = self.resolve_shape(declared, Some((vr, &staged)));
            self.check_shape(dependent, &shape)?;
            if value.dimensions() != shape.as_slice() {
                reshapes.push((dependent, shape));
            }
        }
        Ok((staged, consumed, Some(reshapes)))
    }

    fn apply_reshapes(&mut self, structural_vr: u64, reshapes: Vec<(u64, Vec<usize>)>) {
        if reshapes.is_empty() {
            warn!(structural_vr, "Structural parameter changed without reshaping any value");
            return;
        }
        for (vr, shape) in reshapes {
            if let Some(value) = self.values.get_mut(&vr) {
                debug!(vr, ?shape, "Reshaping value");
                value.reshape(shape);
            }
        }
        self.shape_generation += 1;
    }
}
