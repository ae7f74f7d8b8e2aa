//! `{id, type}` reference objects.
//!
//! Models never appear inline in JSON. Wherever a model is held, the JSON
//! carries a reference object naming its id and type, and the full
//! definition travels once in a separate `references` list.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use indexmap::IndexMap;

use crate::codec::{self, Buffer};
use crate::model::{ModelId, ModelRef};
use crate::value::Value;
use crate::{Error, Result};

/// Models keyed by id, in discovery order.
pub type References = IndexMap<ModelId, ModelRef>;

/// A model reference, optionally carrying the model's attributes (when
/// used as a definition in a `references` list).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefJson {
    pub id: ModelId,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Map<String, Json>>,
}

impl RefJson {
    pub fn to_json(&self) -> Json {
        let mut obj = Map::new();
        obj.insert("id".into(), Json::String(self.id.to_string()));
        obj.insert("type".into(), Json::String(self.type_name.clone()));
        if let Some(subtype) = &self.subtype {
            obj.insert("subtype".into(), Json::String(subtype.clone()));
        }
        if let Some(attributes) = &self.attributes {
            obj.insert("attributes".into(), Json::Object(attributes.clone()));
        }
        Json::Object(obj)
    }
}

/// True for a bare reference: an object whose keys are exactly
/// `id` and `type`, optionally with `subtype`.
pub fn is_ref(json: &Json) -> bool {
    let Some(obj) = json.as_object() else {
        return false;
    };
    let has = |k: &str| obj.contains_key(k);
    match obj.len() {
        2 => has("id") && has("type"),
        3 => has("id") && has("type") && has("subtype"),
        _ => false,
    }
}

/// Convert JSON to a [`Value`], replacing every reference object with the
/// model `lookup` returns for its id and decoding array payloads.
pub fn resolve_refs<F>(json: &Json, lookup: &F, buffers: &[Buffer]) -> Result<Value>
where
    F: Fn(&str) -> Option<ModelRef>,
{
    if is_ref(json) {
        let id = json
            .get("id")
            .and_then(Json::as_str)
            .ok_or_else(|| Error::UnknownReference(json.to_string()))?;
        return lookup(id)
            .map(Value::Model)
            .ok_or_else(|| Error::UnknownReference(id.to_string()));
    }
    if codec::is_ndarray(json) {
        return Ok(Value::Array(codec::decode_ndarray(json)?.0));
    }
    if codec::is_buffer_ref(json) {
        return Ok(Value::Array(codec::process_buffer(json, buffers)?.0));
    }
    match json {
        Json::Array(items) => items
            .iter()
            .map(|item| resolve_refs(item, lookup, buffers))
            .collect::<Result<Vec<_>>>()
            .map(Value::List),
        Json::Object(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), resolve_refs(v, lookup, buffers)?)))
            .collect::<Result<IndexMap<_, _>>>()
            .map(Value::Dict),
        scalar => Value::from_json(scalar),
    }
}

/// Record the models held in `value`. With `recurse`, every model
/// reachable from them is recorded as well.
pub fn record_value_references(value: &Value, out: &mut References, recurse: bool) {
    let mut direct = Vec::new();
    value.collect_models(&mut direct);
    for model in direct {
        if out.contains_key(model.id()) {
            continue;
        }
        if recurse {
            for reachable in model.references() {
                out.entry(reachable.id().clone()).or_insert(reachable);
            }
        } else {
            out.insert(model.id().clone(), model);
        }
    }
}

/// Record the models referenced anywhere inside `json`, together with
/// everything reachable from them.
pub fn record_json_references<F>(json: &Json, lookup: &F, out: &mut References)
where
    F: Fn(&str) -> Option<ModelRef>,
{
    if is_ref(json) {
        if let Some(model) = json.get("id").and_then(Json::as_str).and_then(lookup) {
            record_value_references(&Value::Model(model), out, true);
        }
        return;
    }
    match json {
        Json::Array(items) => items
            .iter()
            .for_each(|item| record_json_references(item, lookup, out)),
        Json::Object(map) => map
            .values()
            .for_each(|v| record_json_references(v, lookup, out)),
        _ => {}
    }
}

/// Full definitions (reference plus attributes) of `models`.
pub fn references_json<'a, I>(models: I, include_defaults: bool) -> Result<Vec<RefJson>>
where
    I: IntoIterator<Item = &'a ModelRef>,
{
    models
        .into_iter()
        .map(|model| {
            let mut r = model.ref_json();
            r.attributes = Some(model.attributes_as_json(include_defaults)?);
            Ok(r)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ModelRegistry, ModelType, PropertyKind};
    use serde_json::json;

    #[test]
    fn test_is_ref() {
        assert!(is_ref(&json!({"id": "1", "type": "Plot"})));
        assert!(is_ref(&json!({"id": "1", "type": "Plot", "subtype": "Figure"})));
        assert!(!is_ref(&json!({"id": "1", "type": "Plot", "attributes": {}})));
        assert!(!is_ref(&json!({"id": "1"})));
        assert!(!is_ref(&json!(["id", "type"])));
    }

    #[test]
    fn test_resolve_nested_refs() {
        let registry = ModelRegistry::with_builtins();
        let m = registry.create("Model").unwrap();
        let id = m.id().clone();
        let lookup = |key: &str| (key == id.as_str()).then(|| m.clone());

        let json = json!({"items": [{"id": id.as_str(), "type": "Model"}, 4]});
        let value = resolve_refs(&json, &lookup, &[]).unwrap();
        let items = value.as_dict().unwrap()["items"].as_list().unwrap();
        assert_eq!(items[0].as_model().unwrap().id(), &id);
        assert_eq!(items[1], Value::Int(4));
    }

    #[test]
    fn test_unknown_reference() {
        let lookup = |_: &str| -> Option<ModelRef> { None };
        let json = json!([{"id": "ghost", "type": "Model"}]);
        assert!(matches!(
            resolve_refs(&json, &lookup, &[]),
            Err(Error::UnknownReference(id)) if id == "ghost"
        ));
    }

    #[test]
    fn test_record_references_recursive() {
        let mut registry = ModelRegistry::with_builtins();
        registry.register(ModelType::new("Holder").property(
            "child",
            PropertyKind::nullable(PropertyKind::Ref),
            Value::Null,
        ));
        let outer = registry.create("Holder").unwrap();
        let inner = registry.create("Holder").unwrap();
        outer.set("child", &inner).unwrap();

        let mut shallow = References::new();
        record_value_references(&Value::from(&outer), &mut shallow, false);
        assert_eq!(shallow.len(), 1);

        let mut deep = References::new();
        record_value_references(&Value::from(&outer), &mut deep, true);
        assert_eq!(deep.len(), 2);
        assert!(deep.contains_key(inner.id()));
    }

    #[test]
    fn test_ref_json_shape() {
        let r = RefJson {
            id: ModelId::from("7"),
            type_name: "Plot".to_string(),
            subtype: None,
            attributes: None,
        };
        assert_eq!(r.to_json(), json!({"id": "7", "type": "Plot"}));
        assert_eq!(serde_json::to_value(&r).unwrap(), r.to_json());
    }
}
