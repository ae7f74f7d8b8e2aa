//! Creating, applying and synthesizing JSON patches.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use serde_json::{Map, Value as Json};

use super::events::DocumentChangedEvent;
use super::json::{DocJson, EventJson, Patch};
use super::Document;
use crate::codec::{self, Buffer};
use crate::model::{ModelId, ModelRef, SetOptions};
use crate::refs::{self, RefJson, References};
use crate::registry::{ModelRegistry, ModelType};
use crate::sources::ColumnDataSource;
use crate::value::Value;
use crate::{Error, Result};

/// Find or create the instance for every definition. Ids already present
/// in `existing` keep their instance.
pub(super) fn instantiate_references(
    refs: &[RefJson],
    existing: &IndexMap<ModelId, ModelRef>,
    registry: &ModelRegistry,
) -> Result<References> {
    let mut out = References::with_capacity(refs.len());
    for r in refs {
        let model = match existing.get(&r.id) {
            Some(model) => model.clone(),
            None => {
                let model = registry.instantiate(&r.type_name, r.id.clone())?;
                model.set_subtype(r.subtype.clone());
                model
            }
        };
        out.insert(r.id.clone(), model);
    }
    Ok(out)
}

/// Convert a definition's attributes to values. Column data attributes
/// go through the column-data codec and also produce `_shapes`.
fn resolve_attributes<F>(
    model_type: &ModelType,
    attributes: Option<&Map<String, Json>>,
    lookup: &F,
    buffers: &[Buffer],
) -> Result<Vec<(String, Value)>>
where
    F: Fn(&str) -> Option<ModelRef>,
{
    let Some(attributes) = attributes else {
        return Ok(Vec::new());
    };
    let mut out = Vec::with_capacity(attributes.len());
    for (name, json) in attributes {
        if model_type.is_column_data(name) {
            let (data, shapes) = codec::decode_column_data(json, buffers)?;
            if model_type.property_def("_shapes").is_some() {
                out.push(("_shapes".to_string(), codec::shapes_to_value(&shapes)));
            }
            out.push((name.clone(), Value::Dict(data)));
        } else {
            out.push((name.clone(), refs::resolve_refs(json, lookup, buffers)?));
        }
    }
    Ok(out)
}

struct PendingInit {
    model: ModelRef,
    attributes: Vec<(String, Value)>,
    was_new: bool,
}

/// Order in which models are initialized: every model after the models
/// its attributes reference. Each id appears once, even in a cycle.
fn depth_first_order(items: &IndexMap<ModelId, PendingInit>) -> Vec<ModelId> {
    fn visit(
        value: &Value,
        items: &IndexMap<ModelId, PendingInit>,
        started: &mut HashSet<ModelId>,
        order: &mut Vec<ModelId>,
    ) {
        match value {
            Value::Model(model) => {
                let Some(pending) = items.get(model.id()) else {
                    return;
                };
                if !started.insert(model.id().clone()) {
                    return;
                }
                for (_, v) in &pending.attributes {
                    visit(v, items, started, order);
                }
                order.push(model.id().clone());
            }
            Value::List(values) => values.iter().for_each(|v| visit(v, items, started, order)),
            Value::Dict(map) => map.values().for_each(|v| visit(v, items, started, order)),
            _ => {}
        }
    }

    let mut started = HashSet::new();
    let mut order = Vec::with_capacity(items.len());
    for pending in items.values() {
        visit(&Value::Model(pending.model.clone()), items, &mut started, &mut order);
    }
    order
}

/// Set the attributes of every newly created model (silently) and then
/// finalize them, both in dependency order.
pub(super) fn initialize_references<F>(
    refs: &[RefJson],
    old: &References,
    new: &References,
    lookup: &F,
    buffers: &[Buffer],
) -> Result<()>
where
    F: Fn(&str) -> Option<ModelRef>,
{
    let mut pending = IndexMap::with_capacity(refs.len());
    for r in refs {
        let (model, was_new) = match (old.get(&r.id), new.get(&r.id)) {
            (Some(model), _) => (model.clone(), false),
            (None, Some(model)) => (model.clone(), true),
            (None, None) => return Err(Error::UnknownReference(r.id.to_string())),
        };
        let attributes =
            resolve_attributes(model.model_type(), r.attributes.as_ref(), lookup, buffers)?;
        pending.insert(
            r.id.clone(),
            PendingInit {
                model,
                attributes,
                was_new,
            },
        );
    }

    let order = depth_first_order(&pending);
    for id in &order {
        let item = &pending[id];
        if item.was_new {
            item.model
                .setv(item.attributes.iter().cloned(), SetOptions::silent())?;
        }
    }
    for id in &order {
        let item = &pending[id];
        if item.was_new {
            item.model.finalize();
        }
    }
    Ok(())
}

impl Document {
    /// Serialize `events` together with the definitions of every model
    /// they introduce.
    pub fn create_json_patch(&self, events: &[DocumentChangedEvent]) -> Result<Patch> {
        let mut references = References::new();
        let mut json_events = Vec::with_capacity(events.len());
        for event in events {
            if event.document != self.id() {
                return Err(Error::ForeignDocumentEvent);
            }
            json_events.push(event.to_json(&mut references)?);
        }
        Ok(Patch {
            references: refs::references_json(references.values(), true)?,
            events: json_events,
        })
    }

    pub fn create_json_patch_string(&self, events: &[DocumentChangedEvent]) -> Result<String> {
        Ok(serde_json::to_string(&self.create_json_patch(events)?)?)
    }

    pub fn apply_json_patch(
        &self,
        patch: &Json,
        buffers: &[Buffer],
        setter_id: Option<&str>,
    ) -> Result<()> {
        self.apply_patch(&Patch::from_json(patch)?, buffers, setter_id)
    }

    /// Apply a patch. Changes are announced with `setter_id` so the
    /// session that received the patch can recognize its own echo.
    ///
    /// Events are applied in order; a failing event aborts the patch and
    /// leaves earlier events applied.
    pub fn apply_patch(
        &self,
        patch: &Patch,
        buffers: &[Buffer],
        setter_id: Option<&str>,
    ) -> Result<()> {
        let known = self.models_snapshot();
        let mut references = instantiate_references(&patch.references, &known, self.registry())?;

        for event in &patch.events {
            let Some(target) = event.model() else { continue };
            if let Some(model) = known.get(&target.id) {
                references.insert(target.id.clone(), model.clone());
            } else if !references.contains_key(&target.id) {
                log::warn!("Got an event for unknown model {}", target.id);
                return Err(Error::UnknownModel(target.id.to_string()));
            }
        }

        let (old, new): (References, References) = references
            .iter()
            .map(|(id, m)| (id.clone(), m.clone()))
            .partition(|(id, _)| known.contains_key(id));

        let lookup = |id: &str| {
            new.get(id)
                .or_else(|| old.get(id))
                .or_else(|| known.get(id))
                .cloned()
        };
        initialize_references(&patch.references, &old, &new, &lookup, buffers)?;

        for event in &patch.events {
            self.apply_event(event, &references, &lookup, buffers, setter_id)?;
        }
        Ok(())
    }

    fn attached_model(&self, target: &RefJson) -> Result<ModelRef> {
        self.get_model_by_id(target.id.as_str())
            .ok_or_else(|| Error::UnknownModel(target.id.to_string()))
    }

    fn column_source(&self, target: &RefJson) -> Result<ColumnDataSource> {
        ColumnDataSource::new(self.attached_model(target)?)
    }

    fn apply_event<F>(
        &self,
        event: &EventJson,
        references: &References,
        lookup: &F,
        buffers: &[Buffer],
        setter_id: Option<&str>,
    ) -> Result<()>
    where
        F: Fn(&str) -> Option<ModelRef>,
    {
        let options = || SetOptions::with_setter(setter_id);
        match event {
            EventJson::ModelChanged { model, attr, new } => {
                let target = self.attached_model(model)?;
                if target.model_type().is_column_data(attr) {
                    let (data, shapes) = codec::decode_column_data(new, buffers)?;
                    let mut attrs = Vec::with_capacity(2);
                    if target.model_type().property_def("_shapes").is_some() {
                        attrs.push(("_shapes".to_string(), codec::shapes_to_value(&shapes)));
                    }
                    attrs.push((attr.clone(), Value::Dict(data)));
                    target.setv(attrs, options())
                } else {
                    let value = refs::resolve_refs(new, lookup, buffers)?;
                    target.setv([(attr.clone(), value)], options())
                }
            }
            EventJson::ColumnDataChanged {
                column_source,
                cols,
                new,
            } => {
                let source = self.column_source(column_source)?;
                let (mut data, mut shapes) = codec::decode_column_data(new, buffers)?;
                if cols.is_some() {
                    for (name, column) in source.data() {
                        data.entry(name).or_insert(column);
                    }
                    for (name, shape) in source.shapes() {
                        shapes.entry(name).or_insert(shape);
                    }
                }
                source.set_data(data, &shapes, options().without_check_eq())
            }
            EventJson::ColumnsStreamed {
                column_source,
                data,
                rollover,
            } => {
                let source = self.column_source(column_source)?;
                let (rows, shapes) =
                    codec::decode_column_data(&Json::Object(data.clone()), buffers)?;
                source.stream_with_shapes(&rows, &shapes, *rollover, setter_id)
            }
            EventJson::ColumnsPatched {
                column_source,
                patches,
            } => self.column_source(column_source)?.patch(patches, setter_id),
            EventJson::RootAdded { model } => {
                let root = references
                    .get(&model.id)
                    .ok_or_else(|| Error::UnknownReference(model.id.to_string()))?;
                self.add_root_with_setter(root, setter_id)
            }
            EventJson::RootRemoved { model } => {
                let root = references
                    .get(&model.id)
                    .ok_or_else(|| Error::UnknownReference(model.id.to_string()))?;
                self.remove_root_with_setter(root, setter_id)
            }
            EventJson::TitleChanged { title } => {
                self.set_title_with_setter(title, setter_id);
                Ok(())
            }
            EventJson::MessageSent { msg_type, msg_data } => {
                let data = match msg_data {
                    Some(json) => refs::resolve_refs(json, lookup, buffers)?,
                    None => match buffers {
                        [buffer] => Value::Array(buffer.data.clone().into()),
                        _ => {
                            return Err(Error::MissingBuffer(format!(
                                "message '{msg_type}' expects exactly one buffer, got {}",
                                buffers.len()
                            )))
                        }
                    },
                };
                self.trigger_on_message(msg_type, &data);
                Ok(())
            }
        }
    }

    /// Synthesize the patch that brings the snapshot `from` up to date
    /// with `to_doc`.
    ///
    /// Only attribute changes are diffed. A difference in the root sets
    /// is an error.
    pub fn compute_patch_since_json(from: &DocJson, to_doc: &Document) -> Result<Patch> {
        let to = to_doc.to_json(false)?;

        let index = |doc: &DocJson| -> HashMap<ModelId, RefJson> {
            doc.roots
                .references
                .iter()
                .map(|r| (r.id.clone(), r.clone()))
                .collect()
        };
        let from_refs = index(from);
        let to_refs = index(&to);

        let mut from_roots = from.roots.root_ids.clone();
        let mut to_roots = to.roots.root_ids.clone();
        from_roots.sort();
        to_roots.sort();
        if from_roots != to_roots {
            return Err(Error::RootsChanged);
        }

        let mut value_refs = References::new();
        let mut events = Vec::new();
        for model in to_doc.all_models() {
            let (Some(from_obj), Some(to_obj)) = (from_refs.get(model.id()), to_refs.get(model.id()))
            else {
                continue;
            };
            events.extend(events_to_sync_objects(from_obj, to_obj, to_doc, &mut value_refs));
        }

        Ok(Patch {
            references: refs::references_json(value_refs.values(), false)?,
            events,
        })
    }
}

fn events_to_sync_objects(
    from_obj: &RefJson,
    to_obj: &RefJson,
    to_doc: &Document,
    value_refs: &mut References,
) -> Vec<EventJson> {
    let empty = Map::new();
    let from_attrs = from_obj.attributes.as_ref().unwrap_or(&empty);
    let to_attrs = to_obj.attributes.as_ref().unwrap_or(&empty);

    for key in from_attrs.keys().filter(|k| !to_attrs.contains_key(*k)) {
        log::warn!("Server sent key {key} but we don't seem to have it in our JSON");
    }

    let mut events = Vec::new();
    for (key, new_value) in to_attrs {
        let changed = match from_attrs.get(key) {
            None => true,
            Some(old_value) => old_value != new_value,
        };
        if !changed {
            continue;
        }
        events.extend(event_for_attribute_change(
            from_obj, key, new_value, to_doc, value_refs,
        ));
    }
    events
}

fn event_for_attribute_change(
    changed: &RefJson,
    key: &str,
    new_value: &Json,
    doc: &Document,
    value_refs: &mut References,
) -> Option<EventJson> {
    let model = doc.get_model_by_id(changed.id.as_str())?;
    if !model.attribute_is_serializable(key) {
        return None;
    }
    refs::record_json_references(new_value, &|id: &str| doc.get_model_by_id(id), value_refs);
    Some(EventJson::ModelChanged {
        model: RefJson {
            id: changed.id.clone(),
            type_name: changed.type_name.clone(),
            subtype: changed.subtype.clone(),
            attributes: None,
        },
        attr: key.to_string(),
        new: new_value.clone(),
    })
}
