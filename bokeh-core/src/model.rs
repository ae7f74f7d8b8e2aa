//! Observable model objects.
//!
//! A [`Model`] has an immutable id, a type (its [`ModelType`] schema), an
//! ordered bag of typed attributes and an optional subtype. Assigning
//! attributes through [`Model::setv`] validates the values against the
//! schema, emits per-model change notifications and, when the model is
//! attached to a document, forwards serializable changes to it.

use std::borrow::Borrow;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use uuid::Uuid;

use crate::codec::{self, Shapes};
use crate::document::{Document, DocumentInner};
use crate::events::ModelEvent;
use crate::refs::RefJson;
use crate::registry::ModelType;
use crate::signal::{Signal, Subscription};
use crate::value::Value;
use crate::{Error, Result};

/// Globally unique model identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(String);

impl ModelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn unique() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ModelId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ModelId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

pub type ModelRef = Arc<Model>;

/// Options for [`Model::setv`].
#[derive(Debug, Clone)]
pub struct SetOptions {
    /// Opaque token naming the originator of the change.
    pub setter_id: Option<String>,
    /// Skip every notification.
    pub silent: bool,
    /// Skip assignments whose new value equals the old one.
    pub check_eq: bool,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            setter_id: None,
            silent: false,
            check_eq: true,
        }
    }
}

impl SetOptions {
    pub fn with_setter(setter_id: Option<&str>) -> Self {
        Self {
            setter_id: setter_id.map(str::to_string),
            ..Self::default()
        }
    }

    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::default()
        }
    }

    pub fn without_check_eq(mut self) -> Self {
        self.check_eq = false;
        self
    }
}

/// One attribute assignment, as seen by per-model listeners.
#[derive(Debug, Clone)]
pub struct AttributeChange {
    pub attr: String,
    pub old: Value,
    pub new: Value,
    pub setter_id: Option<String>,
}

struct ModelState {
    attributes: IndexMap<String, Value>,
    /// Attributes assigned after construction (serialized even when
    /// defaults are excluded).
    explicitly_set: HashSet<String>,
    subtype: Option<String>,
    document: Option<Weak<DocumentInner>>,
    finalized: bool,
}

pub struct Model {
    id: ModelId,
    model_type: Arc<ModelType>,
    state: RwLock<ModelState>,
    changed: Signal<AttributeChange>,
    events: Signal<ModelEvent>,
}

impl Model {
    pub(crate) fn new(id: ModelId, model_type: Arc<ModelType>) -> ModelRef {
        let attributes = model_type
            .properties()
            .map(|p| (p.name.clone(), p.default.clone()))
            .collect();
        Arc::new(Self {
            id,
            model_type,
            state: RwLock::new(ModelState {
                attributes,
                explicitly_set: HashSet::new(),
                subtype: None,
                document: None,
                finalized: false,
            }),
            changed: Signal::new(),
            events: Signal::new(),
        })
    }

    pub fn id(&self) -> &ModelId {
        &self.id
    }

    pub fn type_name(&self) -> &str {
        self.model_type.name()
    }

    pub fn model_type(&self) -> &Arc<ModelType> {
        &self.model_type
    }

    pub fn subtype(&self) -> Option<String> {
        self.state.read().subtype.clone()
    }

    pub fn set_subtype(&self, subtype: Option<String>) {
        self.state.write().subtype = subtype;
    }

    pub fn get(&self, attr: &str) -> Option<Value> {
        self.state.read().attributes.get(attr).cloned()
    }

    /// The user-assigned `name` attribute, if set.
    pub fn name(&self) -> Option<String> {
        self.state
            .read()
            .attributes
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn attributes(&self) -> IndexMap<String, Value> {
        self.state.read().attributes.clone()
    }

    pub fn attribute_is_serializable(&self, attr: &str) -> bool {
        self.model_type
            .property_def(attr)
            .is_some_and(|p| p.serializable)
    }

    pub fn serializable_attributes(&self) -> IndexMap<String, Value> {
        self.state
            .read()
            .attributes
            .iter()
            .filter(|(k, _)| self.attribute_is_serializable(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// `{id, type}` reference to this model.
    pub fn ref_json(&self) -> RefJson {
        RefJson {
            id: self.id.clone(),
            type_name: self.type_name().to_string(),
            subtype: self.subtype(),
            attributes: None,
        }
    }

    /// Assign attributes shorthand with default options.
    pub fn set(self: &Arc<Self>, attr: &str, value: impl Into<Value>) -> Result<()> {
        self.setv([(attr, value.into())], SetOptions::default())
    }

    /// Assign several attributes at once.
    ///
    /// All values are validated before any is written. Unless `silent`,
    /// each effective change is announced to per-model listeners and,
    /// for serializable attributes of an attached model, to the document.
    pub fn setv<I, K>(self: &Arc<Self>, attrs: I, options: SetOptions) -> Result<()>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let attrs: Vec<(String, Value)> = attrs.into_iter().map(|(k, v)| (k.into(), v)).collect();
        for (attr, value) in &attrs {
            self.validate(attr, value)?;
        }

        let (changes, document) = {
            let mut state = self.state.write();
            let mut changes = Vec::with_capacity(attrs.len());
            for (attr, value) in attrs {
                let old = state.attributes.get(&attr).cloned().unwrap_or_default();
                state.explicitly_set.insert(attr.clone());
                if options.check_eq && old == value {
                    continue;
                }
                state.attributes.insert(attr.clone(), value.clone());
                changes.push(AttributeChange {
                    attr,
                    old,
                    new: value,
                    setter_id: options.setter_id.clone(),
                });
            }
            (changes, state.document.as_ref().and_then(Weak::upgrade))
        };

        if options.silent {
            return Ok(());
        }

        for change in &changes {
            self.changed.emit(change);
            let Some(inner) = &document else { continue };
            if !self.attribute_is_serializable(&change.attr) {
                continue;
            }
            let doc = Document::from_inner(inner.clone());
            if references_differ(&change.old, &change.new) {
                doc.invalidate_all_models()?;
            }
            doc.notify_change(self, change);
        }
        Ok(())
    }

    fn validate(&self, attr: &str, value: &Value) -> Result<()> {
        if attr == "id" {
            return Err(Error::IdChanged);
        }
        let def = self
            .model_type
            .property_def(attr)
            .ok_or_else(|| Error::UnknownAttribute {
                model_type: self.type_name().to_string(),
                attr: attr.to_string(),
            })?;
        if !def.kind.accepts(value) {
            return Err(Error::InvalidValue {
                attr: attr.to_string(),
                expected: def.kind.to_string(),
            });
        }
        Ok(())
    }

    /// JSON form of one attribute value. Column data is encoded together
    /// with the model's `_shapes`.
    pub fn attribute_value_json(&self, attr: &str, value: &Value) -> Result<Json> {
        if self.model_type.is_column_data(attr) {
            if let Value::Dict(columns) = value {
                let shapes = self
                    .get("_shapes")
                    .map(|v| codec::shapes_from_value(&v))
                    .unwrap_or_else(Shapes::new);
                return Ok(codec::encode_column_data(columns, &shapes));
            }
        }
        Ok(value.to_json())
    }

    /// Serializable attributes as JSON. The `id` is never included.
    pub fn attributes_as_json(&self, include_defaults: bool) -> Result<Map<String, Json>> {
        let (attributes, explicitly_set) = {
            let state = self.state.read();
            (state.attributes.clone(), state.explicitly_set.clone())
        };
        let mut out = Map::new();
        for (attr, value) in &attributes {
            if !self.attribute_is_serializable(attr) {
                continue;
            }
            if include_defaults || explicitly_set.contains(attr) {
                out.insert(attr.clone(), self.attribute_value_json(attr, value)?);
            }
        }
        Ok(out)
    }

    /// Models held directly in serializable attributes.
    pub fn direct_references(&self) -> Vec<ModelRef> {
        let state = self.state.read();
        let mut out = Vec::new();
        for (attr, value) in &state.attributes {
            if self.attribute_is_serializable(attr) {
                value.collect_models(&mut out);
            }
        }
        out
    }

    /// Transitive closure of reachable models, this model included.
    pub fn references(self: &Arc<Self>) -> Vec<ModelRef> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut stack = vec![self.clone()];
        while let Some(model) = stack.pop() {
            if !seen.insert(model.id.clone()) {
                continue;
            }
            let children = model.direct_references();
            out.push(model);
            stack.extend(children.into_iter().rev());
        }
        out
    }

    pub fn document(&self) -> Option<Document> {
        self.state
            .read()
            .document
            .as_ref()
            .and_then(Weak::upgrade)
            .map(Document::from_inner)
    }

    pub(crate) fn attach_document(&self, doc: &Arc<DocumentInner>) -> Result<()> {
        let mut state = self.state.write();
        if let Some(current) = state.document.as_ref().and_then(Weak::upgrade) {
            if !Arc::ptr_eq(&current, doc) {
                return Err(Error::AlreadyAttached(self.to_string()));
            }
        }
        state.document = Some(Arc::downgrade(doc));
        Ok(())
    }

    pub(crate) fn detach_document(&self) {
        self.state.write().document = None;
    }

    /// Run the type's initializer. Happens at most once per model.
    pub fn finalize(self: &Arc<Self>) {
        {
            let mut state = self.state.write();
            if state.finalized {
                return;
            }
            state.finalized = true;
        }
        if let Some(init) = self.model_type.initializer() {
            init(self);
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.state.read().finalized
    }

    pub fn on_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&AttributeChange) + Send + Sync + 'static,
    {
        self.changed.connect(listener)
    }

    pub fn on_event<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ModelEvent) + Send + Sync + 'static,
    {
        self.events.connect(listener)
    }

    pub(crate) fn process_event(&self, event: &ModelEvent) {
        self.events.emit(event);
    }
}

/// True when the models directly held by `old` and `new` differ, meaning
/// the document's closure may have changed.
fn references_differ(old: &Value, new: &Value) -> bool {
    let ids = |v: &Value| {
        let mut models = Vec::new();
        v.collect_models(&mut models);
        models.into_iter().map(|m| m.id.clone()).collect::<HashSet<_>>()
    };
    ids(old) != ids(new)
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.type_name(), self.id)
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("id", &self.id)
            .field("type", &self.type_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ModelRegistry, PropertyKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry() -> ModelRegistry {
        let mut registry = ModelRegistry::with_builtins();
        registry.register(
            ModelType::new("Node")
                .property("value", PropertyKind::Number, Value::Int(0))
                .property("child", PropertyKind::nullable(PropertyKind::Ref), Value::Null)
                .property("children", PropertyKind::list(PropertyKind::Ref), Value::List(vec![]))
                .internal("hover", PropertyKind::Bool, Value::Bool(false)),
        );
        registry
    }

    #[test]
    fn test_defaults_and_set() {
        let m = registry().create("Node").unwrap();
        assert_eq!(m.get("value"), Some(Value::Int(0)));
        m.set("value", 2.5).unwrap();
        assert_eq!(m.get("value"), Some(Value::Number(2.5)));
    }

    #[test]
    fn test_setting_id_rejected() {
        let m = registry().create("Node").unwrap();
        assert!(matches!(m.set("id", "other"), Err(Error::IdChanged)));
    }

    #[test]
    fn test_validation() {
        let m = registry().create("Node").unwrap();
        assert!(matches!(
            m.set("value", "text"),
            Err(Error::InvalidValue { .. })
        ));
        assert!(matches!(
            m.set("missing", 1),
            Err(Error::UnknownAttribute { .. })
        ));
    }

    #[test]
    fn test_change_listener_and_check_eq() {
        let m = registry().create("Node").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let _sub = m.on_change(move |change| {
            assert_eq!(change.attr, "value");
            c.fetch_add(1, Ordering::SeqCst);
        });

        m.set("value", 1).unwrap();
        m.set("value", 1).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        m.setv([("value", Value::Int(1))], SetOptions::default().without_check_eq())
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        m.setv([("value", Value::Int(5))], SetOptions::silent()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_references_closure_handles_cycles() {
        let r = registry();
        let a = r.create("Node").unwrap();
        let b = r.create("Node").unwrap();
        let c = r.create("Node").unwrap();
        a.set("child", &b).unwrap();
        b.set("children", vec![Value::from(&c), Value::from(&a)]).unwrap();

        let ids: Vec<_> = a.references().iter().map(|m| m.id().clone()).collect();
        assert_eq!(ids, vec![a.id().clone(), b.id().clone(), c.id().clone()]);
    }

    #[test]
    fn test_attributes_as_json() {
        let m = registry().create("Node").unwrap();
        m.set("value", 3).unwrap();

        let all = m.attributes_as_json(true).unwrap();
        assert!(all.contains_key("value"));
        assert!(all.contains_key("child"));
        assert!(!all.contains_key("hover"));
        assert!(!all.contains_key("id"));

        let explicit = m.attributes_as_json(false).unwrap();
        assert_eq!(explicit.len(), 1);
        assert_eq!(explicit["value"], serde_json::json!(3));
    }

    #[test]
    fn test_finalize_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let mut r = ModelRegistry::new();
        r.register(ModelType::new("Counted").with_initializer(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        let m = r.create("Counted").unwrap();
        m.finalize();
        m.finalize();
        assert!(m.is_finalized());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
