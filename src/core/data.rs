//! Structured per-image data and the on-disk array encoding.
//!
//! Arrays are stored as JSON objects of the form
//! `{"__ndarray__": <base64 of raw little-endian bytes>, "dtype": "uint8", "shape": [h, w]}`
//! so masks and tensors survive a round trip through `image_data.json`, the
//! serialised pot matrices and the feature tensor.

use crate::core::error::DataError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use indexmap::IndexMap;
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use std::fmt;

/// Key marking an encoded array object.
pub const NDARRAY_KEY: &str = "__ndarray__";

/// Element type of an encoded array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dtype {
    Uint8,
    Int32,
    Int64,
    Float32,
    Float64,
    Bool,
}

impl Dtype {
    /// Size of one element in bytes.
    pub fn item_size(&self) -> usize {
        match self {
            Dtype::Uint8 | Dtype::Bool => 1,
            Dtype::Int32 | Dtype::Float32 => 4,
            Dtype::Int64 | Dtype::Float64 => 8,
        }
    }

    /// Name used in the encoding header.
    pub fn name(&self) -> &'static str {
        match self {
            Dtype::Uint8 => "uint8",
            Dtype::Int32 => "int32",
            Dtype::Int64 => "int64",
            Dtype::Float32 => "float32",
            Dtype::Float64 => "float64",
            Dtype::Bool => "bool",
        }
    }

    /// Parse a dtype name.
    pub fn parse(name: &str) -> Result<Self, DataError> {
        match name {
            "uint8" | "u1" | "|u1" => Ok(Dtype::Uint8),
            "int32" | "<i4" => Ok(Dtype::Int32),
            "int64" | "<i8" => Ok(Dtype::Int64),
            "float32" | "<f4" => Ok(Dtype::Float32),
            "float64" | "<f8" => Ok(Dtype::Float64),
            "bool" | "|b1" => Ok(Dtype::Bool),
            other => Err(DataError::UnsupportedDtype(other.to_string())),
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An n-dimensional array stored as raw little-endian bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    dtype: Dtype,
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

impl NdArray {
    /// Build an array, checking the payload length against the shape.
    pub fn new(dtype: Dtype, shape: Vec<usize>, bytes: Vec<u8>) -> Result<Self, DataError> {
        let expected = shape.iter().product::<usize>() * dtype.item_size();
        if expected != bytes.len() {
            return Err(DataError::SizeMismatch {
                dtype: dtype.name().to_string(),
                shape,
                expected,
                got: bytes.len(),
            });
        }
        Ok(Self { dtype, shape, bytes })
    }

    /// A `uint8` array.
    pub fn from_u8(shape: Vec<usize>, data: Vec<u8>) -> Result<Self, DataError> {
        Self::new(Dtype::Uint8, shape, data)
    }

    /// A `float64` array.
    pub fn from_f64(shape: Vec<usize>, data: &[f64]) -> Result<Self, DataError> {
        let bytes = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(Dtype::Float64, shape, bytes)
    }

    /// An `int64` array.
    pub fn from_i64(shape: Vec<usize>, data: &[i64]) -> Result<Self, DataError> {
        let bytes = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(Dtype::Int64, shape, bytes)
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Elements widened to f64, whatever the dtype.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        let size = self.dtype.item_size();
        self.bytes
            .chunks_exact(size)
            .map(|c| match self.dtype {
                Dtype::Uint8 | Dtype::Bool => c[0] as f64,
                Dtype::Int32 => i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64,
                Dtype::Float32 => f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64,
                Dtype::Int64 => {
                    i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f64
                }
                Dtype::Float64 => {
                    f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
                }
            })
            .collect()
    }
}

/// Structured data attached to images and pots.
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<DataValue>),
    Map(IndexMap<String, DataValue>),
    Array(NdArray),
}

impl DataValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DataValue::Int(i) => Some(*i as f64),
            DataValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DataValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<String, DataValue>> {
        match self {
            DataValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[DataValue]> {
        match self {
            DataValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&NdArray> {
        match self {
            DataValue::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Look up a key in a map value.
    pub fn get(&self, key: &str) -> Option<&DataValue> {
        self.as_map().and_then(|m| m.get(key))
    }
}

impl From<f64> for DataValue {
    fn from(v: f64) -> Self {
        DataValue::Float(v)
    }
}

impl From<i64> for DataValue {
    fn from(v: i64) -> Self {
        DataValue::Int(v)
    }
}

impl From<&str> for DataValue {
    fn from(v: &str) -> Self {
        DataValue::String(v.to_string())
    }
}

impl From<String> for DataValue {
    fn from(v: String) -> Self {
        DataValue::String(v)
    }
}

impl From<NdArray> for DataValue {
    fn from(v: NdArray) -> Self {
        DataValue::Array(v)
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode an array as its JSON object form.
pub fn encode_array(array: &NdArray) -> JsonValue {
    json!({
        NDARRAY_KEY: STANDARD.encode(&array.bytes),
        "dtype": array.dtype.name(),
        "shape": array.shape,
    })
}

/// Decode the JSON object form of an array.
pub fn decode_array(value: &JsonValue) -> Result<NdArray, DataError> {
    let obj = value
        .as_object()
        .ok_or_else(|| DataError::Malformed("expected an object".to_string()))?;
    let payload = obj
        .get(NDARRAY_KEY)
        .and_then(|v| v.as_str())
        .ok_or_else(|| DataError::Malformed(format!("missing '{}'", NDARRAY_KEY)))?;
    let dtype = obj
        .get("dtype")
        .and_then(|v| v.as_str())
        .ok_or_else(|| DataError::Malformed("missing 'dtype'".to_string()))?;
    let shape = obj
        .get("shape")
        .and_then(|v| v.as_array())
        .ok_or_else(|| DataError::Malformed("missing 'shape'".to_string()))?
        .iter()
        .map(|d| d.as_u64().map(|d| d as usize))
        .collect::<Option<Vec<usize>>>()
        .ok_or_else(|| DataError::Malformed("shape must hold non-negative integers".to_string()))?;
    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| DataError::Base64(e.to_string()))?;
    NdArray::new(Dtype::parse(dtype)?, shape, bytes)
}

/// Convert structured data into JSON, encoding arrays.
pub fn jsonify_data(data: &DataValue) -> JsonValue {
    match data {
        DataValue::Null => JsonValue::Null,
        DataValue::Bool(b) => JsonValue::Bool(*b),
        DataValue::Int(i) => JsonValue::from(*i),
        // Non-finite floats become null.
        DataValue::Float(f) => JsonValue::from(*f),
        DataValue::String(s) => JsonValue::String(s.clone()),
        DataValue::List(items) => JsonValue::Array(items.iter().map(jsonify_data).collect()),
        DataValue::Map(map) => {
            let mut obj = JsonMap::new();
            for (k, v) in map {
                obj.insert(k.clone(), jsonify_data(v));
            }
            JsonValue::Object(obj)
        }
        DataValue::Array(array) => encode_array(array),
    }
}

/// Convert JSON back into structured data, decoding arrays.
pub fn dejsonify_data(value: &JsonValue) -> Result<DataValue, DataError> {
    Ok(match value {
        JsonValue::Null => DataValue::Null,
        JsonValue::Bool(b) => DataValue::Bool(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => DataValue::Int(i),
            None => DataValue::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        JsonValue::String(s) => DataValue::String(s.clone()),
        JsonValue::Array(items) => {
            DataValue::List(items.iter().map(dejsonify_data).collect::<Result<_, _>>()?)
        }
        JsonValue::Object(obj) if obj.contains_key(NDARRAY_KEY) => {
            DataValue::Array(decode_array(value)?)
        }
        JsonValue::Object(obj) => {
            let mut map = IndexMap::with_capacity(obj.len());
            for (k, v) in obj {
                map.insert(k.clone(), dejsonify_data(v)?);
            }
            DataValue::Map(map)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_mask() {
        let mask = NdArray::from_u8(vec![2, 3], vec![0, 1, 1, 0, 0, 1]).unwrap();
        let encoded = encode_array(&mask);
        assert_eq!(encoded["dtype"], "uint8");
        assert_eq!(encoded["shape"], json!([2, 3]));
        assert_eq!(decode_array(&encoded).unwrap(), mask);
    }

    #[test]
    fn test_size_mismatch() {
        assert!(matches!(
            NdArray::from_u8(vec![2, 2], vec![1, 2, 3]),
            Err(DataError::SizeMismatch { expected: 4, got: 3, .. })
        ));
    }

    #[test]
    fn test_decode_errors() {
        let bad_dtype = json!({"__ndarray__": "", "dtype": "complex128", "shape": [0]});
        assert!(matches!(decode_array(&bad_dtype), Err(DataError::UnsupportedDtype(_))));
        let bad_payload = json!({"__ndarray__": "***", "dtype": "uint8", "shape": [1]});
        assert!(matches!(decode_array(&bad_payload), Err(DataError::Base64(_))));
    }

    #[test]
    fn test_nested_round_trip() {
        let mut inner = IndexMap::new();
        inner.insert("score".to_string(), DataValue::Float(0.75));
        inner.insert(
            "mask".to_string(),
            DataValue::Array(NdArray::from_u8(vec![1, 2], vec![0, 1]).unwrap()),
        );
        let mut outer = IndexMap::new();
        outer.insert("name".to_string(), DataValue::from("pot"));
        outer.insert("id".to_string(), DataValue::Int(7));
        outer.insert("inner".to_string(), DataValue::Map(inner));
        outer.insert(
            "list".to_string(),
            DataValue::List(vec![DataValue::Bool(true), DataValue::Null]),
        );
        let data = DataValue::Map(outer);

        let json = jsonify_data(&data);
        let text = serde_json::to_string(&json).unwrap();
        let back = dejsonify_data(&serde_json::from_str(&text).unwrap()).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_to_f64_vec() {
        let arr = NdArray::from_f64(vec![3], &[1.5, -2.0, 0.0]).unwrap();
        assert_eq!(arr.to_f64_vec(), vec![1.5, -2.0, 0.0]);
        let arr = NdArray::from_i64(vec![2], &[-4, 9]).unwrap();
        assert_eq!(arr.to_f64_vec(), vec![-4.0, 9.0]);
    }

    fn arb_array() -> impl Strategy<Value = NdArray> {
        let dtypes = prop_oneof![
            Just(Dtype::Uint8),
            Just(Dtype::Int32),
            Just(Dtype::Int64),
            Just(Dtype::Float32),
            Just(Dtype::Float64),
            Just(Dtype::Bool),
        ];
        (dtypes, prop::collection::vec(1usize..5, 1..4)).prop_flat_map(|(dtype, shape)| {
            let n = shape.iter().product::<usize>() * dtype.item_size();
            prop::collection::vec(any::<u8>(), n)
                .prop_map(move |bytes| NdArray::new(dtype, shape.clone(), bytes).unwrap())
        })
    }

    proptest! {
        #[test]
        fn prop_array_round_trip(array in arb_array()) {
            let encoded = encode_array(&array);
            let text = serde_json::to_string(&encoded).unwrap();
            let decoded = decode_array(&serde_json::from_str(&text).unwrap()).unwrap();
            prop_assert_eq!(decoded, array);
        }

        #[test]
        fn prop_scalar_map_round_trip(entries in prop::collection::vec(("[a-z]{1,8}", any::<i64>()), 0..8)) {
            let map: IndexMap<String, DataValue> = entries
                .into_iter()
                .map(|(k, v)| (k, DataValue::Int(v)))
                .collect();
            let data = DataValue::Map(map);
            prop_assert_eq!(dejsonify_data(&jsonify_data(&data)).unwrap(), data);
        }
    }
}
