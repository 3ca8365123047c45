//! Typed numeric arrays and their wire encoding.
//!
//! Wire form:
//! ```text
//! { "__ndarray__": "<base64>",  "shape": [2, 3], "dtype": "float64", "order": "little" }
//! { "__buffer__":  "<buffer id>", "shape": [6],   "dtype": "int32",   "order": "big" }
//! ```
//!
//! The inline form carries the raw element bytes as base64. The buffer form
//! names an entry of the side-channel buffer list that travels next to the JSON
//! body. Payloads are written in the byte order named by `order` and swapped on
//! decode when that differs from the platform's.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytemuck::Pod;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::value::Value;

/// Element type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Uint8,
    Int8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Float32,
    Float64,
}

impl DType {
    /// Element width in bytes.
    pub fn width(self) -> usize {
        match self {
            DType::Uint8 | DType::Int8 => 1,
            DType::Uint16 | DType::Int16 => 2,
            DType::Uint32 | DType::Int32 | DType::Float32 => 4,
            DType::Float64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::Uint8 => "uint8",
            DType::Int8 => "int8",
            DType::Uint16 => "uint16",
            DType::Int16 => "int16",
            DType::Uint32 => "uint32",
            DType::Int32 => "int32",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    /// Byte order of the running platform.
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }
}

/// Codec failures. Each one is fatal to a single array decode only.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("invalid base64 payload: {0}")]
    Base64(String),

    #[error("payload is {actual} bytes but shape {shape:?} of {dtype} needs {expected}")]
    LengthMismatch {
        dtype: DType,
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    #[error("no side buffer with id '{0}'")]
    MissingBuffer(String),

    #[error("array carries neither an inline payload nor a buffer reference")]
    MissingPayload,

    #[error("shape {shape:?} does not describe {len} elements")]
    ShapeMismatch { shape: Vec<usize>, len: usize },

    #[error("invalid array header: {0}")]
    Header(String),
}

// ---------------------------------------------------------------
// Element storage
// ---------------------------------------------------------------

/// A fixed-width element type that can live in an [`ArrayData`].
pub trait Element: Pod {
    const DTYPE: DType;

    /// Convert a numeric value, `None` if it does not fit.
    fn from_value(value: &Value) -> Option<Self>;

    fn to_value(self) -> Value;

    fn wrap(values: Vec<Self>) -> ArrayData;

    fn unwrap(data: &ArrayData) -> Option<&[Self]>;
}

macro_rules! int_element {
    ($t:ty, $variant:ident) => {
        impl Element for $t {
            const DTYPE: DType = DType::$variant;

            fn from_value(value: &Value) -> Option<Self> {
                match value {
                    Value::Int(i) => <$t>::try_from(*i).ok(),
                    Value::Float(f) if f.fract() == 0.0 => <$t>::try_from(*f as i64).ok(),
                    _ => None,
                }
            }

            fn to_value(self) -> Value {
                Value::Int(self as i64)
            }

            fn wrap(values: Vec<Self>) -> ArrayData {
                ArrayData::$variant(values)
            }

            fn unwrap(data: &ArrayData) -> Option<&[Self]> {
                match data {
                    ArrayData::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

macro_rules! float_element {
    ($t:ty, $variant:ident) => {
        impl Element for $t {
            const DTYPE: DType = DType::$variant;

            fn from_value(value: &Value) -> Option<Self> {
                match value {
                    Value::Int(i) => Some(*i as $t),
                    Value::Float(f) => Some(*f as $t),
                    _ => None,
                }
            }

            fn to_value(self) -> Value {
                Value::Float(self as f64)
            }

            fn wrap(values: Vec<Self>) -> ArrayData {
                ArrayData::$variant(values)
            }

            fn unwrap(data: &ArrayData) -> Option<&[Self]> {
                match data {
                    ArrayData::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

int_element!(u8, Uint8);
int_element!(i8, Int8);
int_element!(u16, Uint16);
int_element!(i16, Int16);
int_element!(u32, Uint32);
int_element!(i32, Int32);
float_element!(f32, Float32);
float_element!(f64, Float64);

/// Typed element buffer in platform byte order.
#[derive(Debug, Clone)]
pub enum ArrayData {
    Uint8(Vec<u8>),
    Int8(Vec<i8>),
    Uint16(Vec<u16>),
    Int16(Vec<i16>),
    Uint32(Vec<u32>),
    Int32(Vec<i32>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
}

macro_rules! each_variant {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            ArrayData::Uint8($v) => $body,
            ArrayData::Int8($v) => $body,
            ArrayData::Uint16($v) => $body,
            ArrayData::Int16($v) => $body,
            ArrayData::Uint32($v) => $body,
            ArrayData::Int32($v) => $body,
            ArrayData::Float32($v) => $body,
            ArrayData::Float64($v) => $body,
        }
    };
}

macro_rules! with_dtype {
    ($dtype:expr, $t:ident => $body:expr) => {
        match $dtype {
            DType::Uint8 => {
                type $t = u8;
                $body
            }
            DType::Int8 => {
                type $t = i8;
                $body
            }
            DType::Uint16 => {
                type $t = u16;
                $body
            }
            DType::Int16 => {
                type $t = i16;
                $body
            }
            DType::Uint32 => {
                type $t = u32;
                $body
            }
            DType::Int32 => {
                type $t = i32;
                $body
            }
            DType::Float32 => {
                type $t = f32;
                $body
            }
            DType::Float64 => {
                type $t = f64;
                $body
            }
        }
    };
}

impl ArrayData {
    pub fn dtype(&self) -> DType {
        match self {
            ArrayData::Uint8(_) => DType::Uint8,
            ArrayData::Int8(_) => DType::Int8,
            ArrayData::Uint16(_) => DType::Uint16,
            ArrayData::Int16(_) => DType::Int16,
            ArrayData::Uint32(_) => DType::Uint32,
            ArrayData::Int32(_) => DType::Int32,
            ArrayData::Float32(_) => DType::Float32,
            ArrayData::Float64(_) => DType::Float64,
        }
    }

    pub fn len(&self) -> usize {
        each_variant!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw element bytes in platform order.
    pub fn as_bytes(&self) -> &[u8] {
        each_variant!(self, v => bytemuck::cast_slice(v))
    }

    /// Rebuild from platform-order bytes. The length must be a whole number
    /// of elements.
    pub fn from_bytes(dtype: DType, bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() % dtype.width() != 0 {
            return Err(CodecError::Header(format!(
                "{} bytes is not a whole number of {dtype} elements",
                bytes.len()
            )));
        }
        // pod_collect_to_vec copies, so the source need not be aligned.
        Ok(with_dtype!(dtype, T => T::wrap(bytemuck::pod_collect_to_vec::<u8, T>(bytes))))
    }

    /// Convert numeric values to the given element type.
    pub fn from_values(dtype: DType, values: &[Value]) -> Option<Self> {
        with_dtype!(dtype, T => {
            let converted = values.iter().map(T::from_value).collect::<Option<Vec<T>>>()?;
            Some(T::wrap(converted))
        })
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        each_variant!(self, v => v.get(index).map(|x| Element::to_value(*x)))
    }

    /// Overwrite one element; `None` if out of range or not representable.
    pub fn set(&mut self, index: usize, value: &Value) -> Option<()> {
        each_variant!(self, v => {
            let slot = v.get_mut(index)?;
            *slot = Element::from_value(value)?;
            Some(())
        })
    }

    pub fn to_values(&self) -> Vec<Value> {
        each_variant!(self, v => v.iter().map(|x| Element::to_value(*x)).collect())
    }

    /// Append `other`, converting element types when they differ.
    pub fn extend(&mut self, other: &ArrayData) -> Option<()> {
        if self.dtype() == other.dtype() {
            let mut bytes = self.as_bytes().to_vec();
            bytes.extend_from_slice(other.as_bytes());
            *self = ArrayData::from_bytes(self.dtype(), &bytes).ok()?;
            return Some(());
        }
        let converted = ArrayData::from_values(self.dtype(), &other.to_values())?;
        self.extend(&converted)
    }

    /// Drop the first `count` elements.
    pub fn drain_front(&mut self, count: usize) {
        each_variant!(self, v => {
            let count = count.min(v.len());
            v.drain(..count);
        })
    }
}

/// A shape-tagged typed array.
#[derive(Debug, Clone)]
pub struct NdArray {
    shape: Vec<usize>,
    data: ArrayData,
}

impl NdArray {
    /// Wrap `data` with an explicit row-major shape.
    pub fn new(data: ArrayData, shape: Vec<usize>) -> Result<Self, CodecError> {
        let expected = element_count(&shape)?;
        if expected != data.len() {
            return Err(CodecError::ShapeMismatch {
                shape,
                len: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    /// One-dimensional array over `values`.
    pub fn from_vec<T: Element>(values: Vec<T>) -> Self {
        let shape = vec![values.len()];
        Self {
            shape,
            data: T::wrap(values),
        }
    }

    pub fn with_shape<T: Element>(values: Vec<T>, shape: Vec<usize>) -> Result<Self, CodecError> {
        Self::new(T::wrap(values), shape)
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &ArrayData {
        &self.data
    }

    /// Typed view; `None` when `T` is not the array's element type.
    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        T::unwrap(&self.data)
    }

    /// Total element count.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Extent of the first axis. A zero-dimensional array is one row.
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    /// Elements per row (product of the trailing axes).
    pub fn row_size(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    /// Set a flat element.
    pub fn set(&mut self, index: usize, value: &Value) -> Option<()> {
        self.data.set(index, value)
    }

    /// Append rows from `other`, whose trailing axes must match.
    pub fn append_rows(&mut self, other: &NdArray) -> Option<()> {
        let trailing = other.shape.get(1..).unwrap_or(&[]);
        if self.shape.len() > 1 && &self.shape[1..] != trailing {
            return None;
        }
        self.data.extend(&other.data)?;
        let rows = self.data.len() / self.row_size().max(1);
        match self.shape.first_mut() {
            Some(first) => *first = rows,
            None => self.shape = vec![rows],
        }
        Some(())
    }

    /// Keep only the last `keep` rows.
    pub fn retain_last_rows(&mut self, keep: usize) {
        let rows = self.rows();
        if rows <= keep {
            return;
        }
        let dropped = rows - keep;
        self.data.drain_front(dropped * self.row_size());
        if let Some(first) = self.shape.first_mut() {
            *first = keep;
        }
    }
}

impl PartialEq for NdArray {
    fn eq(&self, other: &Self) -> bool {
        self.dtype() == other.dtype()
            && self.shape == other.shape
            && self.data.as_bytes() == other.data.as_bytes()
    }
}

// ---------------------------------------------------------------
// Side-channel buffers
// ---------------------------------------------------------------

/// One out-of-band binary payload, addressed by `id` from a `__buffer__`
/// pointer.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    pub id: String,
    pub data: Vec<u8>,
}

/// JSON header that precedes a buffer payload on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferHeader {
    pub id: String,
}

// ---------------------------------------------------------------
// Wire form
// ---------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayWire {
    #[serde(rename = "__ndarray__", default, skip_serializing_if = "Option::is_none")]
    pub ndarray: Option<String>,
    #[serde(rename = "__buffer__", default, skip_serializing_if = "Option::is_none")]
    pub buffer: Option<String>,
    pub shape: Vec<usize>,
    pub dtype: DType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<ByteOrder>,
}

impl ArrayWire {
    /// Whether a JSON object carries an encoded array.
    pub fn is_wire_object(obj: &serde_json::Map<String, serde_json::Value>) -> bool {
        obj.contains_key("__ndarray__") || obj.contains_key("__buffer__")
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self, CodecError> {
        Self::deserialize(value).map_err(|e| CodecError::Header(e.to_string()))
    }

    /// Byte order of the payload. Absent means little-endian.
    pub fn byte_order(&self) -> ByteOrder {
        self.order.unwrap_or(ByteOrder::Little)
    }
}

fn swap_in_place(bytes: &mut [u8], width: usize) {
    if width > 1 {
        bytes
            .chunks_exact_mut(width)
            .for_each(|element| element.reverse());
    }
}

fn bytes_in_order(array: &NdArray, order: ByteOrder) -> Vec<u8> {
    let mut bytes = array.data.as_bytes().to_vec();
    if order != ByteOrder::native() {
        swap_in_place(&mut bytes, array.dtype().width());
    }
    bytes
}

/// Encode with an inline base64 payload.
pub fn encode_inline(array: &NdArray, order: ByteOrder) -> ArrayWire {
    ArrayWire {
        ndarray: Some(STANDARD.encode(bytes_in_order(array, order))),
        buffer: None,
        shape: array.shape.clone(),
        dtype: array.dtype(),
        order: Some(order),
    }
}

/// Encode into a side buffer named `id`.
pub fn encode_buffer(array: &NdArray, order: ByteOrder, id: impl Into<String>) -> (ArrayWire, Buffer) {
    let id = id.into();
    let wire = ArrayWire {
        ndarray: None,
        buffer: Some(id.clone()),
        shape: array.shape.clone(),
        dtype: array.dtype(),
        order: Some(order),
    };
    let buffer = Buffer {
        id,
        data: bytes_in_order(array, order),
    };
    (wire, buffer)
}

/// Number of elements `shape` describes. Both the row size and the total
/// must fit in `usize`, so `row_size` on a valid array never overflows.
fn element_count(shape: &[usize]) -> Result<usize, CodecError> {
    let trailing = shape.get(1..).unwrap_or(&[]);
    trailing
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .and_then(|row| row.checked_mul(shape.first().copied().unwrap_or(1)))
        .ok_or_else(|| CodecError::Header(format!("shape {shape:?} is too large")))
}

/// Decode a wire array, resolving `__buffer__` pointers against `buffers`.
pub fn decode(wire: &ArrayWire, buffers: &[Buffer]) -> Result<NdArray, CodecError> {
    let mut bytes = match (&wire.ndarray, &wire.buffer) {
        (Some(encoded), _) => STANDARD
            .decode(encoded)
            .map_err(|e| CodecError::Base64(e.to_string()))?,
        (None, Some(id)) => buffers
            .iter()
            .find(|b| &b.id == id)
            .map(|b| b.data.clone())
            .ok_or_else(|| CodecError::MissingBuffer(id.clone()))?,
        (None, None) => return Err(CodecError::MissingPayload),
    };

    let width = wire.dtype.width();
    let expected = element_count(&wire.shape)?
        .checked_mul(width)
        .ok_or_else(|| CodecError::Header(format!("shape {:?} is too large", wire.shape)))?;
    if bytes.len() != expected {
        return Err(CodecError::LengthMismatch {
            dtype: wire.dtype,
            shape: wire.shape.clone(),
            expected,
            actual: bytes.len(),
        });
    }

    if wire.byte_order() != ByteOrder::native() {
        swap_in_place(&mut bytes, width);
    }
    let data = ArrayData::from_bytes(wire.dtype, &bytes)?;
    NdArray::new(data, wire.shape.clone())
}
