//! Values carried in a payload map

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value as JsonValue;

use super::WireError;

/// Variable name -> value, as submitted by the application
pub type PayloadMap = BTreeMap<String, Value>;

// ─────────────────────────────────────────────────────────────────
// Element types
// ─────────────────────────────────────────────────────────────────

/// Element type of an [`NdArray`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DType {
    U8 = 1,
    I32 = 2,
    I64 = 3,
    F32 = 4,
    F64 = 5,
}

impl DType {
    /// Size of one element in bytes
    pub fn size(self) -> usize {
        match self {
            DType::U8 => 1,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::U8 => "u8",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::F32 => "f32",
            DType::F64 => "f64",
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, WireError> {
        match tag {
            1 => Ok(DType::U8),
            2 => Ok(DType::I32),
            3 => Ok(DType::I64),
            4 => Ok(DType::F32),
            5 => Ok(DType::F64),
            other => Err(WireError::UnknownDType(other)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Shaped numeric arrays
// ─────────────────────────────────────────────────────────────────

/// Dense row-major numeric array.
///
/// Elements are held as little-endian bytes so that the exact bit pattern
/// of every element survives a round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdArray {
    dtype: DType,
    shape: Vec<usize>,
    data: Vec<u8>,
}

macro_rules! typed_constructor {
    ($(#[$doc:meta])* $name:ident, $ty:ty, $dtype:expr) => {
        $(#[$doc])*
        pub fn $name(shape: Vec<usize>, values: &[$ty]) -> Result<Self, WireError> {
            let mut data = Vec::with_capacity(values.len() * std::mem::size_of::<$ty>());
            for v in values {
                data.extend_from_slice(&v.to_le_bytes());
            }
            Self::from_raw($dtype, shape, data)
        }
    };
}

impl NdArray {
    /// Build an array from raw little-endian element bytes
    pub fn from_raw(dtype: DType, shape: Vec<usize>, data: Vec<u8>) -> Result<Self, WireError> {
        let expected = element_count(&shape)
            .and_then(|n| n.checked_mul(dtype.size()))
            .ok_or(WireError::TooLong {
                what: "array shape",
                len: usize::MAX,
            })?;
        if expected != data.len() {
            return Err(WireError::ArrayLength {
                shape,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { dtype, shape, data })
    }

    typed_constructor!(
        /// Array of `f64` elements
        from_f64, f64, DType::F64
    );
    typed_constructor!(from_f32, f32, DType::F32);
    typed_constructor!(from_i64, i64, DType::I64);
    typed_constructor!(from_i32, i32, DType::I32);
    typed_constructor!(from_u8, u8, DType::U8);

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of elements (1 for a zero-dimensional array)
    pub fn len(&self) -> usize {
        self.data.len() / self.dtype.size()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw little-endian element bytes
    pub fn raw_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Elements widened to `f64`
    pub fn to_f64_vec(&self) -> Vec<f64> {
        self.data
            .chunks_exact(self.dtype.size())
            .map(|c| match self.dtype {
                DType::U8 => c[0] as f64,
                DType::I32 => i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64,
                DType::I64 => i64::from_le_bytes(eight(c)) as f64,
                DType::F32 => f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64,
                DType::F64 => f64::from_le_bytes(eight(c)),
            })
            .collect()
    }

    /// Reverse the bytes of every element in place
    pub(crate) fn swap_byte_order(&mut self) {
        let size = self.dtype.size();
        if size > 1 {
            for chunk in self.data.chunks_exact_mut(size) {
                chunk.reverse();
            }
        }
    }
}

fn eight(c: &[u8]) -> [u8; 8] {
    [c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]
}

/// Product of the dimensions, `None` on overflow
pub(crate) fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

// ─────────────────────────────────────────────────────────────────
// Values
// ─────────────────────────────────────────────────────────────────

/// A single variable value
#[derive(Debug, Clone)]
pub enum Value {
    Str(String),
    Float(f64),
    Int(i64),
    Bool(bool),
    Bytes(Vec<u8>),
    Array(NdArray),
}

impl Value {
    /// Name of the value kind, for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Str(_) => "str",
            Value::Float(_) => "f64",
            Value::Int(_) => "i64",
            Value::Bool(_) => "bool",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric scalar as `f64` (ints are widened)
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&NdArray> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }
}

// Floats compare by bit pattern so NaN payloads round-trip as equal.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Float(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Array(a) => {
                let dims: Vec<String> = a.shape().iter().map(|d| d.to_string()).collect();
                write!(f, "array<{}>[{}]", a.dtype().name(), dims.join("x"))
            }
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<NdArray> for Value {
    fn from(v: NdArray) -> Self {
        Value::Array(v)
    }
}

// ─────────────────────────────────────────────────────────────────
// JSON import
// ─────────────────────────────────────────────────────────────────

/// Convert a JSON object into a payload map.
///
/// Strings, booleans and numbers map to scalars; rectangular nested arrays
/// of numbers become `f64` arrays with the inferred shape.
pub fn payload_from_json(json: &JsonValue) -> Result<PayloadMap, WireError> {
    let object = json.as_object().ok_or_else(|| WireError::UnsupportedJson {
        key: "<root>".to_string(),
        reason: "payload must be a JSON object".to_string(),
    })?;

    object
        .iter()
        .map(|(key, v)| Ok((key.clone(), value_from_json(key, v)?)))
        .collect()
}

fn value_from_json(key: &str, json: &JsonValue) -> Result<Value, WireError> {
    let unsupported = |reason: &str| WireError::UnsupportedJson {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    match json {
        JsonValue::String(s) => Ok(Value::Str(s.clone())),
        JsonValue::Bool(b) => Ok(Value::Bool(*b)),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => Ok(Value::Int(i)),
            None => n
                .as_f64()
                .map(Value::Float)
                .ok_or_else(|| unsupported("number out of range")),
        },
        JsonValue::Array(_) => {
            let shape = infer_shape(json);
            let mut values = Vec::new();
            flatten_numbers(json, &shape, 0, &mut values)
                .map_err(|reason| unsupported(&reason))?;
            NdArray::from_f64(shape, &values).map(Value::Array)
        }
        JsonValue::Null => Err(unsupported("null has no wire representation")),
        JsonValue::Object(_) => Err(unsupported("nested objects are not supported")),
    }
}

/// Shape taken along the first element of every nesting level
fn infer_shape(json: &JsonValue) -> Vec<usize> {
    let mut shape = Vec::new();
    let mut node = json;
    while let JsonValue::Array(items) = node {
        shape.push(items.len());
        match items.first() {
            Some(first) => node = first,
            None => break,
        }
    }
    shape
}

fn flatten_numbers(
    node: &JsonValue,
    shape: &[usize],
    depth: usize,
    out: &mut Vec<f64>,
) -> Result<(), String> {
    match node {
        JsonValue::Array(items) => {
            if depth >= shape.len() || items.len() != shape[depth] {
                return Err(format!("ragged array at depth {}", depth));
            }
            for item in items {
                flatten_numbers(item, shape, depth + 1, out)?;
            }
            Ok(())
        }
        JsonValue::Number(n) if depth == shape.len() => {
            out.push(n.as_f64().ok_or("number out of range")?);
            Ok(())
        }
        JsonValue::Number(_) => Err(format!("ragged array at depth {}", depth)),
        _ => Err("arrays may only contain numbers".to_string()),
    }
}
