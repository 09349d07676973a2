//! Payload codec for the remote boundary.
//!
//! Numeric arrays are serialized in the NPY v1.0 binary format and wrapped
//! in base64 so they survive a text transport, never through a generic
//! object-graph serializer. On the JSON side an array travels as
//! `{"__class__": "ndarray", "data": "<base64>"}` and an object reference as
//! `{"__remote__": "<identity>", "kind": "<adapter kind>"}`. Decoding rejects
//! any payload that is not tagged as one of these two forms: an untagged or
//! foreign-tagged object is an error, not a passthrough.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;

use crate::value::{DType, NdArray, ObjectRef, Value};

/// JSON tag marking a base64-wrapped NPY array payload.
pub const ARRAY_TAG: &str = "ndarray";
/// JSON key carrying the identity of a server-tracked object.
pub const REMOTE_KEY: &str = "__remote__";
/// JSON key carrying a payload class tag.
pub const CLASS_KEY: &str = "__class__";

const NPY_MAGIC: &[u8; 6] = b"\x93NUMPY";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload is not in the NPY array format")]
    BadMagic,

    #[error("unsupported NPY version {0}.{1}")]
    Version(u8, u8),

    #[error("malformed NPY header: {0}")]
    Header(String),

    #[error("unsupported array dtype '{0}'")]
    Dtype(String),

    #[error("fortran-order arrays are not supported")]
    FortranOrder,

    #[error("array payload truncated: expected {expected} data bytes, found {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected payload tag '{0}'")]
    UnexpectedTag(String),

    #[error("unsupported value in payload: {0}")]
    Unsupported(String),
}

/// Serializes an array in the NPY v1.0 format (C order, little-endian).
pub fn encode_npy(arr: &NdArray) -> Vec<u8> {
    let shape = match arr.shape() {
        [] => "()".to_string(),
        [n] => format!("({},)", n),
        dims => {
            let joined = dims
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            format!("({})", joined)
        }
    };
    let mut header = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
        arr.dtype().descr(),
        shape
    );
    // Preamble (magic + version + header length) plus the newline-terminated
    // header must pad out to a 64-byte multiple.
    let unpadded = NPY_MAGIC.len() + 2 + 2 + header.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    header.extend(std::iter::repeat(' ').take(padding));
    header.push('\n');

    let mut out = Vec::with_capacity(NPY_MAGIC.len() + 4 + header.len() + arr.data().len());
    out.extend_from_slice(NPY_MAGIC);
    out.push(1);
    out.push(0);
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(arr.data());
    out
}

/// Parses an NPY payload, rejecting anything that is not a plain C-order
/// array of a supported dtype.
pub fn decode_npy(bytes: &[u8]) -> Result<NdArray, CodecError> {
    if bytes.len() < NPY_MAGIC.len() + 2 || &bytes[..NPY_MAGIC.len()] != NPY_MAGIC {
        return Err(CodecError::BadMagic);
    }
    let (major, minor) = (bytes[6], bytes[7]);
    let (header_len, header_start) = match (major, minor) {
        (1, 0) => {
            if bytes.len() < 10 {
                return Err(CodecError::Header("missing header length".into()));
            }
            (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10)
        }
        (2, 0) => {
            if bytes.len() < 12 {
                return Err(CodecError::Header("missing header length".into()));
            }
            (
                u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize,
                12,
            )
        }
        (maj, min) => return Err(CodecError::Version(maj, min)),
    };
    let data_start = header_start + header_len;
    if bytes.len() < data_start {
        return Err(CodecError::Header("header length out of bounds".into()));
    }
    let header = std::str::from_utf8(&bytes[header_start..data_start])
        .map_err(|_| CodecError::Header("header is not ASCII".into()))?;

    let descr = header_str_field(header, "descr")?;
    let dtype = DType::from_descr(&descr).ok_or(CodecError::Dtype(descr))?;
    match header_raw_field(header, "fortran_order")? {
        f if f.starts_with("False") => {}
        f if f.starts_with("True") => return Err(CodecError::FortranOrder),
        other => {
            return Err(CodecError::Header(format!(
                "bad fortran_order value '{}'",
                other
            )))
        }
    }
    let shape = header_shape_field(header)?;

    // A hostile header can declare dimensions whose product wraps; the
    // byte count must be computed checked.
    let expected = shape
        .iter()
        .try_fold(dtype.size(), |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| CodecError::Header(format!("shape {:?} overflows", shape)))?;
    let data = &bytes[data_start..];
    if data.len() < expected {
        return Err(CodecError::Truncated {
            expected,
            actual: data.len(),
        });
    }
    NdArray::new(dtype, shape, data[..expected].to_vec())
        .map_err(|e| CodecError::Header(e.to_string()))
}

/// Extracts the raw text following `'key':` in the NPY header dict.
fn header_raw_field<'a>(header: &'a str, key: &str) -> Result<&'a str, CodecError> {
    let marker = format!("'{}':", key);
    let at = header
        .find(&marker)
        .ok_or_else(|| CodecError::Header(format!("missing '{}'", key)))?;
    Ok(header[at + marker.len()..].trim_start())
}

fn header_str_field(header: &str, key: &str) -> Result<String, CodecError> {
    let rest = header_raw_field(header, key)?;
    let rest = rest
        .strip_prefix('\'')
        .ok_or_else(|| CodecError::Header(format!("'{}' is not quoted", key)))?;
    let end = rest
        .find('\'')
        .ok_or_else(|| CodecError::Header(format!("unterminated '{}'", key)))?;
    Ok(rest[..end].to_string())
}

fn header_shape_field(header: &str) -> Result<Vec<usize>, CodecError> {
    let rest = header_raw_field(header, "shape")?;
    let rest = rest
        .strip_prefix('(')
        .ok_or_else(|| CodecError::Header("shape is not a tuple".into()))?;
    let end = rest
        .find(')')
        .ok_or_else(|| CodecError::Header("unterminated shape tuple".into()))?;
    rest[..end]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .map_err(|_| CodecError::Header(format!("bad shape dimension '{}'", s)))
        })
        .collect()
}

/// Encodes a [`Value`] into its wire JSON form.
pub fn value_to_wire(value: &Value) -> serde_json::Value {
    use serde_json::json;
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Float(f) => json!(f),
        Value::Str(s) => json!(s),
        Value::List(items) => {
            serde_json::Value::Array(items.iter().map(value_to_wire).collect())
        }
        Value::Array(arr) => json!({
            CLASS_KEY: ARRAY_TAG,
            "data": BASE64.encode(encode_npy(arr)),
        }),
        Value::Ref(obj) => json!({
            REMOTE_KEY: obj.id,
            "kind": obj.kind,
        }),
    }
}

/// Decodes a wire JSON value back into a [`Value`].
pub fn value_from_wire(wire: &serde_json::Value) -> Result<Value, CodecError> {
    match wire {
        serde_json::Value::Null => Ok(Value::Null),
        serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Value::Float(f))
            } else {
                Err(CodecError::Unsupported(format!("number {}", n)))
            }
        }
        serde_json::Value::String(s) => Ok(Value::Str(s.clone())),
        serde_json::Value::Array(items) => items
            .iter()
            .map(value_from_wire)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        serde_json::Value::Object(map) => {
            if let Some(id) = map.get(REMOTE_KEY) {
                let id = id
                    .as_str()
                    .ok_or_else(|| CodecError::Unsupported("non-string identity".into()))?;
                let kind = map.get("kind").and_then(|k| k.as_str()).unwrap_or_default();
                return Ok(Value::Ref(ObjectRef {
                    id: id.to_string(),
                    kind: kind.to_string(),
                }));
            }
            let tag = map
                .get(CLASS_KEY)
                .and_then(|t| t.as_str())
                .ok_or_else(|| CodecError::Unsupported("untagged object".into()))?;
            if tag != ARRAY_TAG {
                return Err(CodecError::UnexpectedTag(tag.to_string()));
            }
            let data = map
                .get("data")
                .and_then(|d| d.as_str())
                .ok_or_else(|| CodecError::Header("array payload has no data".into()))?;
            decode_npy(&BASE64.decode(data)?).map(Value::Array)
        }
    }
}

/// Encodes a call argument list as a JSON document.
pub fn encode_args(args: &[Value]) -> String {
    serde_json::Value::Array(args.iter().map(value_to_wire).collect()).to_string()
}

/// Decodes a call argument list. An empty string means no arguments.
pub fn decode_args(json: &str) -> Result<Vec<Value>, CodecError> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let wire: serde_json::Value = serde_json::from_str(json)?;
    match wire {
        serde_json::Value::Array(items) => {
            items.iter().map(value_from_wire).collect::<Result<_, _>>()
        }
        other => Err(CodecError::Unsupported(format!(
            "argument payload must be a JSON array, got {}",
            other
        ))),
    }
}

/// Encodes a single result value as a JSON document.
pub fn encode_result(value: &Value) -> String {
    value_to_wire(value).to_string()
}

/// Decodes a single result value.
pub fn decode_result(json: &str) -> Result<Value, CodecError> {
    if json.trim().is_empty() {
        return Ok(Value::Null);
    }
    value_from_wire(&serde_json::from_str(json)?)
}
