//! Values that cross the remote boundary.
//!
//! Everything a remote member call consumes or produces is a [`Value`]:
//! JSON-style primitives, lists, typed multidimensional arrays, or
//! references to server-tracked objects. Arrays keep their native element
//! type end to end ([`NdArray`] stores raw little-endian bytes plus a
//! [`DType`] tag) instead of being widened to `f64`, the same typed-buffer
//! discipline the acquisition side uses for pixel data.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Element type of an [`NdArray`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    Bool,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

impl DType {
    /// Element size in bytes.
    pub fn size(self) -> usize {
        match self {
            DType::Bool | DType::U8 | DType::I8 => 1,
            DType::U16 | DType::I16 => 2,
            DType::U32 | DType::I32 | DType::F32 => 4,
            DType::U64 | DType::I64 | DType::F64 => 8,
        }
    }

    /// NPY `descr` string (little-endian where byte order applies).
    pub fn descr(self) -> &'static str {
        match self {
            DType::Bool => "|b1",
            DType::U8 => "|u1",
            DType::I8 => "|i1",
            DType::U16 => "<u2",
            DType::I16 => "<i2",
            DType::U32 => "<u4",
            DType::I32 => "<i4",
            DType::U64 => "<u8",
            DType::I64 => "<i8",
            DType::F32 => "<f4",
            DType::F64 => "<f8",
        }
    }

    /// Inverse of [`DType::descr`].
    pub fn from_descr(descr: &str) -> Option<DType> {
        match descr {
            "|b1" => Some(DType::Bool),
            "|u1" => Some(DType::U8),
            "|i1" => Some(DType::I8),
            "<u2" => Some(DType::U16),
            "<i2" => Some(DType::I16),
            "<u4" => Some(DType::U32),
            "<i4" => Some(DType::I32),
            "<u8" => Some(DType::U64),
            "<i8" => Some(DType::I64),
            "<f4" => Some(DType::F32),
            "<f8" => Some(DType::F64),
            _ => None,
        }
    }
}

/// Shape/data mismatch while constructing an [`NdArray`].
#[derive(Debug, Error, PartialEq, Eq)]
#[error("array data is {actual} bytes but shape {shape:?} of {dtype:?} requires {expected}")]
pub struct ShapeError {
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub expected: usize,
    pub actual: usize,
}

/// A typed multidimensional array in C (row-major) order.
///
/// `data` is the raw little-endian element buffer; its length always equals
/// the element count implied by `shape` times the element size.
#[derive(Clone, Debug, PartialEq)]
pub struct NdArray {
    dtype: DType,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl NdArray {
    pub fn new(dtype: DType, shape: Vec<usize>, data: Vec<u8>) -> Result<Self, ShapeError> {
        let expected = shape.iter().product::<usize>() * dtype.size();
        if data.len() != expected {
            return Err(ShapeError {
                dtype,
                shape,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { dtype, shape, data })
    }

    /// 1-D array of 64-bit signed integers (the SDK's timestamp/count type).
    pub fn from_i64(values: &[i64]) -> Self {
        let mut data = Vec::with_capacity(values.len() * 8);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self {
            dtype: DType::I64,
            shape: vec![values.len()],
            data,
        }
    }

    /// 1-D array of 64-bit floats.
    pub fn from_f64(values: &[f64]) -> Self {
        let mut data = Vec::with_capacity(values.len() * 8);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self {
            dtype: DType::F64,
            shape: vec![values.len()],
            data,
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decodes the buffer as `i64` elements. `None` unless `dtype` is I64.
    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        if self.dtype != DType::I64 {
            return None;
        }
        Some(
            self.data
                .chunks_exact(8)
                .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        )
    }

    /// Decodes the buffer as `f64` elements. `None` unless `dtype` is F64.
    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        if self.dtype != DType::F64 {
            return None;
        }
        Some(
            self.data
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        )
    }
}

/// Reference to a server-tracked object, as seen by remote clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Registry identity.
    pub id: String,
    /// Adapter kind name, e.g. "Tagger" or "DataObject".
    pub kind: String,
}

/// A value crossing the remote boundary.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Array(NdArray),
    Ref(ObjectRef),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object_ref(&self) -> Option<&ObjectRef> {
        match self {
            Value::Ref(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&NdArray> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Flattens a list of integers, accepting a bare integer as a list of one.
    /// Channel arguments arrive in both forms.
    pub fn as_i64_list(&self) -> Option<Vec<i64>> {
        match self {
            Value::Int(i) => Some(vec![*i]),
            Value::List(items) => items.iter().map(Value::as_i64).collect(),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
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

impl From<NdArray> for Value {
    fn from(v: NdArray) -> Self {
        Value::Array(v)
    }
}

impl From<ObjectRef> for Value {
    fn from(v: ObjectRef) -> Self {
        Value::Ref(v)
    }
}
