//! Column-data codec.
//!
//! Bulk numeric columns travel either inline as
//! `{"__ndarray__": <base64>, "shape": [...], "dtype": "..."}` or out of
//! band as `{"__buffer__": <id>, "shape": [...], "dtype": "...", "order": "..."}`
//! where the bytes live in a binary buffer attached to the wire message.
//!
//! Inline payloads are written little-endian. Out-of-band payloads carry
//! their byte order and are swapped on arrival when it differs from the
//! platform's.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use indexmap::IndexMap;
use serde_json::{json, Map, Value as Json};

use crate::ndarray::{ByteOrder, DType, TypedArray};
use crate::value::Value;
use crate::{Error, Result};

/// Column name → column values.
pub type ColumnData = IndexMap<String, Value>;

/// Column name → shape of that column.
pub type Shapes = IndexMap<String, Shape>;

/// A binary side-channel buffer: a small JSON header carrying its `id`
/// and the raw payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    pub header: Json,
    pub data: Vec<u8>,
}

impl Buffer {
    pub fn new(id: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            header: json!({ "id": id.into() }),
            data,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.header.get("id").and_then(Json::as_str)
    }
}

/// Shape metadata for one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    /// Dimensions of a single typed array.
    Dims(Vec<usize>),
    /// One shape per element of a ragged column.
    Ragged(Vec<Vec<usize>>),
}

impl Shape {
    fn to_value(&self) -> Value {
        let dims = |d: &[usize]| Value::List(d.iter().map(|&n| Value::from(n)).collect());
        match self {
            Self::Dims(d) => dims(d),
            Self::Ragged(all) => Value::List(all.iter().map(|d| dims(d)).collect()),
        }
    }

    fn from_value(value: &Value) -> Option<Self> {
        let dims = |v: &Value| -> Option<Vec<usize>> {
            v.as_list()?
                .iter()
                .map(|n| n.as_i64().and_then(|n| usize::try_from(n).ok()))
                .collect()
        };
        let items = value.as_list()?;
        if items.iter().any(|v| v.as_list().is_some()) {
            items.iter().map(dims).collect::<Option<_>>().map(Self::Ragged)
        } else {
            dims(value).map(Self::Dims)
        }
    }
}

/// Shapes as a [`Value`] suitable for a model's `_shapes` attribute.
pub fn shapes_to_value(shapes: &Shapes) -> Value {
    Value::Dict(
        shapes
            .iter()
            .map(|(k, s)| (k.clone(), s.to_value()))
            .collect(),
    )
}

pub fn shapes_from_value(value: &Value) -> Shapes {
    value
        .as_dict()
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| Shape::from_value(v).map(|s| (k.clone(), s)))
                .collect()
        })
        .unwrap_or_default()
}

pub fn is_ndarray(json: &Json) -> bool {
    json.as_object().is_some_and(|o| o.contains_key("__ndarray__"))
}

pub fn is_buffer_ref(json: &Json) -> bool {
    json.as_object().is_some_and(|o| o.contains_key("__buffer__"))
}

fn parse_dtype(desc: &Json) -> Result<DType> {
    let name = desc
        .get("dtype")
        .and_then(Json::as_str)
        .ok_or_else(|| Error::InvalidDType("missing dtype".to_string()))?;
    DType::parse(name)
}

fn parse_order(desc: &Json, default: ByteOrder) -> Result<ByteOrder> {
    match desc.get("order") {
        None | Some(Json::Null) => Ok(default),
        Some(order) => Ok(serde_json::from_value(order.clone())?),
    }
}

fn parse_shape(desc: &Json, len: usize) -> Vec<usize> {
    desc.get("shape")
        .and_then(Json::as_array)
        .and_then(|dims| {
            dims.iter()
                .map(|d| d.as_u64().map(|d| d as usize))
                .collect::<Option<Vec<_>>>()
        })
        .unwrap_or_else(|| vec![len])
}

/// Encode a typed array inline, always little-endian. `shape` defaults
/// to `[len]`.
pub fn encode_ndarray(arr: &TypedArray, shape: Option<&[usize]>) -> Json {
    let shape = shape.map(<[usize]>::to_vec).unwrap_or_else(|| vec![arr.len()]);
    json!({
        "__ndarray__": STANDARD.encode(arr.to_bytes(ByteOrder::Little)),
        "shape": shape,
        "dtype": arr.dtype().as_str(),
    })
}

/// Decode an inline `__ndarray__` object into an array and its shape.
pub fn decode_ndarray(desc: &Json) -> Result<(TypedArray, Vec<usize>)> {
    let payload = desc
        .get("__ndarray__")
        .and_then(Json::as_str)
        .ok_or_else(|| Error::InvalidPayload("__ndarray__ is not a string".to_string()))?;
    let dtype = parse_dtype(desc)?;
    let order = parse_order(desc, ByteOrder::Little)?;
    let arr = TypedArray::from_bytes(dtype, STANDARD.decode(payload)?, order)?;
    let shape = parse_shape(desc, arr.len());
    Ok((arr, shape))
}

/// Encode a typed array out of band: the returned JSON names the buffer
/// that carries the platform-order bytes.
pub fn encode_buffer(arr: &TypedArray, shape: Option<&[usize]>, id: &str) -> (Json, Buffer) {
    let shape = shape.map(<[usize]>::to_vec).unwrap_or_else(|| vec![arr.len()]);
    let desc = json!({
        "__buffer__": id,
        "shape": shape,
        "dtype": arr.dtype().as_str(),
        "order": ByteOrder::native(),
    });
    (desc, Buffer::new(id, arr.to_ne_bytes()))
}

/// Resolve a `__buffer__` object against the message's binary buffers,
/// byte-swapping when the sender's order differs from ours.
pub fn process_buffer(desc: &Json, buffers: &[Buffer]) -> Result<(TypedArray, Vec<usize>)> {
    let id = desc
        .get("__buffer__")
        .and_then(Json::as_str)
        .ok_or_else(|| Error::InvalidPayload("__buffer__ is not a string".to_string()))?;
    let buffer = buffers
        .iter()
        .find(|b| b.id() == Some(id))
        .ok_or_else(|| Error::MissingBuffer(id.to_string()))?;
    let dtype = parse_dtype(desc)?;
    let order = parse_order(desc, ByteOrder::native())?;
    let arr = TypedArray::from_bytes(dtype, buffer.data.clone(), order)?;
    let shape = parse_shape(desc, arr.len());
    Ok((arr, shape))
}

/// Decode one column element. Returns `None` for values that are not
/// array payloads.
fn process_array(json: &Json, buffers: &[Buffer]) -> Result<Option<(Value, Vec<usize>)>> {
    if is_ndarray(json) {
        let (arr, shape) = decode_ndarray(json)?;
        Ok(Some((Value::Array(arr), shape)))
    } else if is_buffer_ref(json) {
        let (arr, shape) = process_buffer(json, buffers)?;
        Ok(Some((Value::Array(arr), shape)))
    } else if json.is_array() {
        Ok(Some((Value::from_json(json)?, Vec::new())))
    } else {
        Ok(None)
    }
}

/// Decode a column-data object, returning the columns and their shapes.
///
/// Columns of plain scalars pass through untouched. A column whose first
/// element is itself an array or an encoded array is ragged and decoded
/// element by element.
pub fn decode_column_data(json: &Json, buffers: &[Buffer]) -> Result<(ColumnData, Shapes)> {
    let columns = json
        .as_object()
        .ok_or_else(|| Error::InvalidPayload("column data must be an object".to_string()))?;

    let mut data = ColumnData::with_capacity(columns.len());
    let mut shapes = Shapes::new();
    for (name, column) in columns {
        match column {
            Json::Array(items) => {
                let ragged = items
                    .first()
                    .is_some_and(|first| first.is_object() || first.is_array());
                if !ragged {
                    data.insert(name.clone(), Value::from_json(column)?);
                    continue;
                }
                let mut values = Vec::with_capacity(items.len());
                let mut item_shapes = Vec::with_capacity(items.len());
                for item in items {
                    match process_array(item, buffers)? {
                        Some((value, shape)) => {
                            values.push(value);
                            item_shapes.push(shape);
                        }
                        None => {
                            values.push(Value::from_json(item)?);
                            item_shapes.push(Vec::new());
                        }
                    }
                }
                data.insert(name.clone(), Value::List(values));
                shapes.insert(name.clone(), Shape::Ragged(item_shapes));
            }
            other => match process_array(other, buffers)? {
                Some((value, shape)) => {
                    data.insert(name.clone(), value);
                    shapes.insert(name.clone(), Shape::Dims(shape));
                }
                None => {
                    data.insert(name.clone(), Value::from_json(other)?);
                }
            },
        }
    }
    Ok((data, shapes))
}

/// Encode columns for the wire. Typed arrays (top level, or elements of a
/// ragged column) become `__ndarray__` objects carrying their shape.
pub fn encode_column_data(data: &ColumnData, shapes: &Shapes) -> Json {
    let mut out = Map::with_capacity(data.len());
    for (name, column) in data {
        let encoded = match column {
            Value::Array(arr) => {
                let shape = match shapes.get(name) {
                    Some(Shape::Dims(dims)) => Some(dims.as_slice()),
                    _ => None,
                };
                encode_ndarray(arr, shape)
            }
            Value::List(items) => {
                let ragged = match shapes.get(name) {
                    Some(Shape::Ragged(all)) => Some(all),
                    _ => None,
                };
                Json::Array(
                    items
                        .iter()
                        .enumerate()
                        .map(|(i, item)| match item {
                            Value::Array(arr) => {
                                let shape = ragged
                                    .and_then(|all| all.get(i))
                                    .filter(|s| !s.is_empty())
                                    .map(Vec::as_slice);
                                encode_ndarray(arr, shape)
                            }
                            other => other.to_json(),
                        })
                        .collect(),
                )
            }
            other => other.to_json(),
        };
        out.insert(name.clone(), encoded);
    }
    Json::Object(out)
}
