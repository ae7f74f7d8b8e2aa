//! Tagged attribute values.
//!
//! Every model attribute holds a [`Value`]. Models embed other models
//! directly through [`Value::Model`], which is how the scene graph is
//! formed.

use indexmap::IndexMap;
use serde_json::Value as Json;

use crate::codec;
use crate::model::ModelRef;
use crate::ndarray::TypedArray;
use crate::Result;

#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Number(f64),
    String(String),
    List(Vec<Value>),
    Dict(IndexMap<String, Value>),
    Model(ModelRef),
    Array(TypedArray),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Number(n) if n.fract() == 0.0 => Some(*n as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Self::Dict(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_model(&self) -> Option<&ModelRef> {
        match self {
            Self::Model(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&TypedArray> {
        match self {
            Self::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Number of rows when this value is used as a data column.
    pub fn column_len(&self) -> Option<usize> {
        match self {
            Self::List(items) => Some(items.len()),
            Self::Array(arr) => Some(arr.len()),
            _ => None,
        }
    }

    /// Models embedded in this value, without descending into the models
    /// themselves.
    pub fn collect_models(&self, out: &mut Vec<ModelRef>) {
        match self {
            Self::Model(m) => out.push(m.clone()),
            Self::List(items) => items.iter().for_each(|v| v.collect_models(out)),
            Self::Dict(map) => map.values().for_each(|v| v.collect_models(out)),
            _ => {}
        }
    }

    /// Convert a JSON value that contains no model references.
    ///
    /// `__ndarray__` objects are decoded into typed arrays; every other
    /// object becomes a [`Value::Dict`].
    pub fn from_json(json: &Json) -> Result<Self> {
        Ok(match json {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Self::String(s.clone()),
            Json::Array(items) => Self::List(
                items.iter().map(Self::from_json).collect::<Result<Vec<_>>>()?,
            ),
            Json::Object(_) if codec::is_ndarray(json) => {
                Self::Array(codec::decode_ndarray(json)?.0)
            }
            Json::Object(map) => Self::Dict(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), Self::from_json(v)?)))
                    .collect::<Result<IndexMap<_, _>>>()?,
            ),
        })
    }

    /// JSON form of this value. Models become `{id, type}` references and
    /// typed arrays become `__ndarray__` objects.
    pub fn to_json(&self) -> Json {
        match self {
            Self::Null => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Int(i) => Json::from(*i),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Self::String(s) => Json::String(s.clone()),
            Self::List(items) => Json::Array(items.iter().map(Self::to_json).collect()),
            Self::Dict(map) => Json::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Self::Model(m) => m.ref_json().to_json(),
            Self::Array(arr) => codec::encode_ndarray(arr, None),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Int(_) | Self::Number(_), Self::Int(_) | Self::Number(_)) => {
                self.as_f64() == other.as_f64()
            }
            (Self::String(a), Self::String(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Dict(a), Self::Dict(b)) => a == b,
            (Self::Model(a), Self::Model(b)) => a.id() == b.id(),
            (Self::Array(a), Self::Array(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i as i64)
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Self::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(map: IndexMap<String, Value>) -> Self {
        Self::Dict(map)
    }
}

impl From<ModelRef> for Value {
    fn from(m: ModelRef) -> Self {
        Self::Model(m)
    }
}

impl From<&ModelRef> for Value {
    fn from(m: &ModelRef) -> Self {
        Self::Model(m.clone())
    }
}

impl From<TypedArray> for Value {
    fn from(arr: TypedArray) -> Self {
        Self::Array(arr)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Self::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_scalars() {
        assert_eq!(Value::from_json(&json!(null)).unwrap(), Value::Null);
        assert_eq!(Value::from_json(&json!(3)).unwrap(), Value::Int(3));
        assert_eq!(Value::from_json(&json!(2.5)).unwrap(), Value::Number(2.5));
        assert_eq!(Value::from_json(&json!("a")).unwrap(), Value::from("a"));
    }

    #[test]
    fn test_int_number_equality() {
        assert_eq!(Value::Int(2), Value::Number(2.0));
        assert_ne!(Value::Int(2), Value::Number(2.5));
        assert_ne!(Value::Int(0), Value::Bool(false));
    }

    #[test]
    fn test_nested_json_roundtrip() {
        let json = json!({"a": [1, 2, {"b": "c"}], "d": true});
        let value = Value::from_json(&json).unwrap();
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn test_ndarray_object_becomes_array() {
        let arr = TypedArray::from(vec![1.5f64, 2.5]);
        let json = codec::encode_ndarray(&arr, None);
        assert_eq!(Value::from_json(&json).unwrap(), Value::Array(arr));
    }

    #[test]
    fn test_non_finite_number_serializes_as_null() {
        assert_eq!(Value::Number(f64::NAN).to_json(), Json::Null);
    }
}
