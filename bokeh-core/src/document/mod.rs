//! The Document: an ordered set of root models and the closure of every
//! model reachable from them.
//!
//! ```text
//!   roots ──references()──► all_models ──name──► by_name
//!     │                         │
//!     │ add/remove_root         │ attach / detach (delta only)
//!     ▼                         ▼
//!  freeze_count == 0 ?  ──► recompute closure
//! ```
//!
//! Every mutation is announced as a [`DocumentChangedEvent`] to the
//! listeners registered with [`Document::on_change`]. Listeners run after
//! all internal locks are released, so they may freely call back into the
//! document.

mod events;
mod json;
mod patch;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value as Json;
use uuid::Uuid;

pub use events::{DocumentChange, DocumentChangedEvent};
pub use json::{DocJson, EventJson, Patch, RootsJson};

use crate::events::{EventManager, ModelEvent};
use crate::model::{AttributeChange, ModelId, ModelRef};
use crate::refs::{self, References};
use crate::registry::ModelRegistry;
use crate::signal::{Signal, Subscription};
use crate::value::Value;
use crate::{Error, Result, VERSION};

pub const DEFAULT_TITLE: &str = "Bokeh Application";

pub(crate) struct DocumentInner {
    id: Uuid,
    registry: Arc<ModelRegistry>,
    state: RwLock<DocumentState>,
    changes: Signal<DocumentChangedEvent>,
    messages: Mutex<HashMap<String, Arc<Signal<Value>>>>,
    event_manager: EventManager,
}

struct DocumentState {
    title: String,
    roots: Vec<ModelRef>,
    all_models: IndexMap<ModelId, ModelRef>,
    by_name: HashMap<String, Vec<ModelRef>>,
    freeze_count: usize,
    recomputes: usize,
}

/// Shared handle to a document. Clones refer to the same document.
#[derive(Clone)]
pub struct Document {
    inner: Arc<DocumentInner>,
}

/// Non-owning handle, held by listeners that must not keep the document
/// alive.
#[derive(Clone, Default)]
pub struct WeakDocument {
    inner: Weak<DocumentInner>,
}

impl WeakDocument {
    pub fn upgrade(&self) -> Option<Document> {
        self.inner.upgrade().map(Document::from_inner)
    }
}

impl Document {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            inner: Arc::new(DocumentInner {
                id: Uuid::new_v4(),
                registry,
                state: RwLock::new(DocumentState {
                    title: DEFAULT_TITLE.to_string(),
                    roots: Vec::new(),
                    all_models: IndexMap::new(),
                    by_name: HashMap::new(),
                    freeze_count: 0,
                    recomputes: 0,
                }),
                changes: Signal::new(),
                messages: Mutex::new(HashMap::new()),
                event_manager: EventManager::new(),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<DocumentInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.inner.registry
    }

    pub fn downgrade(&self) -> WeakDocument {
        WeakDocument {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn ptr_eq(&self, other: &Document) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn title(&self) -> String {
        self.inner.state.read().title.clone()
    }

    pub fn roots(&self) -> Vec<ModelRef> {
        self.inner.state.read().roots.clone()
    }

    /// Every attached model, in closure order.
    pub fn all_models(&self) -> Vec<ModelRef> {
        self.inner.state.read().all_models.values().cloned().collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.state.read().all_models.contains_key(id)
    }

    /// How many times the closure of all models has been recomputed.
    pub fn closure_recomputes(&self) -> usize {
        self.inner.state.read().recomputes
    }

    pub fn get_model_by_id(&self, id: &str) -> Option<ModelRef> {
        self.inner.state.read().all_models.get(id).cloned()
    }

    /// Look a model up by its `name` attribute.
    ///
    /// Fails when more than one attached model carries the name.
    pub fn get_model_by_name(&self, name: &str) -> Result<Option<ModelRef>> {
        let state = self.inner.state.read();
        match state.by_name.get(name).map(Vec::as_slice) {
            None | Some([]) => Ok(None),
            Some([model]) => Ok(Some(model.clone())),
            Some(_) => Err(Error::DuplicateName(name.to_string())),
        }
    }

    pub(crate) fn models_snapshot(&self) -> IndexMap<ModelId, ModelRef> {
        self.inner.state.read().all_models.clone()
    }

    /// Defer closure recomputation until the matching [`pop_freeze`](Self::pop_freeze).
    pub fn push_freeze(&self) {
        self.inner.state.write().freeze_count += 1;
    }

    pub fn pop_freeze(&self) -> Result<()> {
        let mut state = self.inner.state.write();
        if state.freeze_count == 0 {
            log::warn!("pop_freeze called without a matching push_freeze");
            return Ok(());
        }
        state.freeze_count -= 1;
        if state.freeze_count == 0 {
            recompute_all_models(&self.inner, &mut state)?;
        }
        Ok(())
    }

    /// Recompute the closure now unless frozen.
    pub(crate) fn invalidate_all_models(&self) -> Result<()> {
        log::debug!("Invalidating all models of document {}", self.inner.id);
        let mut state = self.inner.state.write();
        if state.freeze_count == 0 {
            recompute_all_models(&self.inner, &mut state)?;
        }
        Ok(())
    }

    pub fn add_root(&self, model: &ModelRef) -> Result<()> {
        self.add_root_with_setter(model, None)
    }

    pub fn add_root_with_setter(&self, model: &ModelRef, setter_id: Option<&str>) -> Result<()> {
        if let Some(foreign) = model.references().into_iter().find(|m| {
            m.document()
                .is_some_and(|other| !Arc::ptr_eq(&other.inner, &self.inner))
        }) {
            return Err(Error::AlreadyAttached(foreign.to_string()));
        }
        {
            let mut state = self.inner.state.write();
            if state.roots.iter().any(|r| r.id() == model.id()) {
                return Ok(());
            }
            log::debug!("Adding root: {model}");
            state.roots.push(model.clone());
            state.freeze_count += 1;
        }
        if let Err(err) = self.pop_freeze() {
            // The closure is untouched when recompute fails.
            self.inner.state.write().roots.retain(|r| r.id() != model.id());
            return Err(err);
        }
        self.trigger_on_change(DocumentChange::RootAdded { model: model.clone() }, setter_id);
        Ok(())
    }

    pub fn remove_root(&self, model: &ModelRef) -> Result<()> {
        self.remove_root_with_setter(model, None)
    }

    pub fn remove_root_with_setter(&self, model: &ModelRef, setter_id: Option<&str>) -> Result<()> {
        {
            let mut state = self.inner.state.write();
            let Some(pos) = state.roots.iter().position(|r| r.id() == model.id()) else {
                return Ok(());
            };
            state.roots.remove(pos);
            state.freeze_count += 1;
        }
        self.pop_freeze()?;
        self.trigger_on_change(DocumentChange::RootRemoved { model: model.clone() }, setter_id);
        Ok(())
    }

    pub fn set_title(&self, title: &str) {
        self.set_title_with_setter(title, None);
    }

    pub fn set_title_with_setter(&self, title: &str, setter_id: Option<&str>) {
        {
            let mut state = self.inner.state.write();
            if state.title == title {
                return;
            }
            state.title = title.to_string();
        }
        self.trigger_on_change(
            DocumentChange::TitleChanged {
                title: title.to_string(),
            },
            setter_id,
        );
    }

    /// Remove every root, recomputing the closure once at the end.
    pub fn clear(&self) -> Result<()> {
        self.push_freeze();
        let removed = self.remove_all_roots();
        let popped = self.pop_freeze();
        removed.and(popped)
    }

    fn remove_all_roots(&self) -> Result<()> {
        loop {
            let first = self.inner.state.read().roots.first().cloned();
            match first {
                Some(root) => self.remove_root(&root)?,
                None => return Ok(()),
            }
        }
    }

    /// Move every root (and the title) of this document into `dest`,
    /// leaving this document empty.
    pub fn destructively_move(&self, dest: &Document) -> Result<()> {
        if self.ptr_eq(dest) {
            return Err(Error::SelfMove);
        }
        dest.clear()?;
        let roots = self.roots();
        self.clear()?;

        for root in &roots {
            if root.document().is_some() {
                return Err(Error::DetachFailed(format!("somehow we didn't detach {root}")));
            }
        }
        let remaining = self.inner.state.read().all_models.len();
        if remaining != 0 {
            return Err(Error::DetachFailed(format!(
                "{remaining} models still attached after clearing"
            )));
        }

        for root in &roots {
            dest.add_root(root)?;
        }
        dest.set_title(&self.title());
        Ok(())
    }

    pub fn on_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&DocumentChangedEvent) + Send + Sync + 'static,
    {
        self.inner.changes.connect(listener)
    }

    pub fn remove_on_change(&self, subscription: Subscription) {
        subscription.disconnect();
    }

    /// Register a callback for `MessageSent` patch events of `msg_type`.
    pub fn on_message<F>(&self, msg_type: &str, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner
            .messages
            .lock()
            .entry(msg_type.to_string())
            .or_default()
            .connect(callback)
    }

    pub fn remove_on_message(&self, subscription: Subscription) {
        subscription.disconnect();
    }

    pub(crate) fn trigger_on_message(&self, msg_type: &str, data: &Value) {
        let signal = self.inner.messages.lock().get(msg_type).cloned();
        match signal {
            Some(signal) => signal.emit(data),
            None => log::debug!("No callbacks for message type '{msg_type}'"),
        }
    }

    pub fn event_manager(&self) -> &EventManager {
        &self.inner.event_manager
    }

    /// Forward an application event to the attached session, if any.
    pub fn send_event(&self, event: &ModelEvent) -> bool {
        self.inner.event_manager.send_event(event)
    }

    /// Dispatch an application event to subscribed models of this document.
    pub fn trigger_event(&self, event: &ModelEvent) {
        let models = self.models_snapshot();
        self.inner
            .event_manager
            .trigger(event, |id| models.get(id).cloned());
    }

    /// Called by a model after one of its serializable attributes changed.
    pub(crate) fn notify_change(&self, model: &ModelRef, change: &AttributeChange) {
        if change.attr == "name" {
            let mut state = self.inner.state.write();
            if state.all_models.contains_key(model.id()) {
                if let Some(old) = change.old.as_str() {
                    remove_name(&mut state.by_name, old, model);
                }
                if let Some(new) = change.new.as_str() {
                    state
                        .by_name
                        .entry(new.to_string())
                        .or_default()
                        .push(model.clone());
                }
            }
        }
        self.trigger_on_change(
            DocumentChange::ModelChanged {
                model: model.clone(),
                attr: change.attr.clone(),
                old: change.old.clone(),
                new: change.new.clone(),
            },
            change.setter_id.as_deref(),
        );
    }

    fn trigger_on_change(&self, kind: DocumentChange, setter_id: Option<&str>) {
        let event = DocumentChangedEvent {
            document: self.inner.id,
            setter_id: setter_id.map(str::to_string),
            kind,
        };
        self.inner.changes.emit(&event);
    }

    /// Serialize the whole closure.
    pub fn to_json(&self, include_defaults: bool) -> Result<DocJson> {
        let (title, root_ids, models) = {
            let state = self.inner.state.read();
            (
                state.title.clone(),
                state.roots.iter().map(|r| r.id().clone()).collect(),
                state.all_models.values().cloned().collect::<Vec<_>>(),
            )
        };
        Ok(DocJson {
            version: Some(VERSION.to_string()),
            title: Some(title),
            roots: RootsJson {
                root_ids,
                references: refs::references_json(&models, include_defaults)?,
            },
        })
    }

    pub fn to_json_value(&self, include_defaults: bool) -> Result<Json> {
        Ok(serde_json::to_value(self.to_json(include_defaults)?)?)
    }

    pub fn to_json_string(&self, include_defaults: bool) -> Result<String> {
        Ok(serde_json::to_string(&self.to_json(include_defaults)?)?)
    }

    /// Build a document from its JSON form.
    ///
    /// All models are instantiated before any attribute is set, so forward
    /// and cyclic references resolve.
    pub fn from_json(json: &DocJson, registry: Arc<ModelRegistry>) -> Result<Self> {
        check_version(json.version.as_deref());

        let references =
            patch::instantiate_references(&json.roots.references, &IndexMap::new(), &registry)?;
        let lookup = |id: &str| references.get(id).cloned();
        patch::initialize_references(
            &json.roots.references,
            &References::new(),
            &references,
            &lookup,
            &[],
        )?;

        let doc = Self::new(registry);
        doc.push_freeze();
        let added = json.roots.root_ids.iter().try_for_each(|id| {
            let root = references
                .get(id)
                .ok_or_else(|| Error::UnknownReference(id.to_string()))?;
            doc.add_root(root)
        });
        doc.pop_freeze()?;
        added?;
        doc.set_title(json.title.as_deref().unwrap_or(DEFAULT_TITLE));
        Ok(doc)
    }

    pub fn from_json_value(json: &Json, registry: Arc<ModelRegistry>) -> Result<Self> {
        let json: DocJson = serde_json::from_value(json.clone())?;
        Self::from_json(&json, registry)
    }

    pub fn from_json_string(json: &str, registry: Arc<ModelRegistry>) -> Result<Self> {
        let json: DocJson = serde_json::from_str(json)?;
        Self::from_json(&json, registry)
    }

    /// Replace this document's content with the document described by
    /// `json`.
    pub fn replace_with_json(&self, json: &DocJson) -> Result<()> {
        let replacement = Self::from_json(json, self.inner.registry.clone())?;
        replacement.destructively_move(self)
    }
}

fn check_version(version: Option<&str>) {
    let Some(version) = version else {
        log::warn!("'version' field is missing");
        return;
    };
    let is_dev = version.contains('+') || version.contains('-');
    if !is_dev && version != VERSION {
        log::warn!("Library version mismatch: client {VERSION}, document {version}");
    } else {
        log::debug!("Library versions: client {VERSION}, document {version}");
    }
}

fn remove_name(by_name: &mut HashMap<String, Vec<ModelRef>>, name: &str, model: &ModelRef) {
    if let Some(models) = by_name.get_mut(name) {
        models.retain(|m| m.id() != model.id());
        if models.is_empty() {
            by_name.remove(name);
        }
    }
}

/// Diff the old closure against the one reachable from the current roots
/// and attach/detach only the delta.
fn recompute_all_models(inner: &Arc<DocumentInner>, state: &mut DocumentState) -> Result<()> {
    let mut recomputed: IndexMap<ModelId, ModelRef> = IndexMap::new();
    for root in &state.roots {
        for model in root.references() {
            recomputed.entry(model.id().clone()).or_insert(model);
        }
    }

    let to_detach: Vec<ModelRef> = state
        .all_models
        .values()
        .filter(|m| !recomputed.contains_key(m.id()))
        .cloned()
        .collect();
    let to_attach: Vec<ModelRef> = recomputed
        .values()
        .filter(|m| !state.all_models.contains_key(m.id()))
        .cloned()
        .collect();

    for model in &to_attach {
        if let Some(other) = model.document() {
            if !Arc::ptr_eq(&other.inner, inner) {
                return Err(Error::AlreadyAttached(model.to_string()));
            }
        }
    }

    for model in &to_detach {
        model.detach_document();
        if let Some(name) = model.name() {
            remove_name(&mut state.by_name, &name, model);
        }
    }
    for model in &to_attach {
        model.attach_document(inner)?;
        if let Some(name) = model.name() {
            state.by_name.entry(name).or_default().push(model.clone());
        }
    }

    log::debug!(
        "Recomputed closure: {} models ({} attached, {} detached)",
        recomputed.len(),
        to_attach.len(),
        to_detach.len()
    );
    state.all_models = recomputed;
    state.recomputes += 1;
    Ok(())
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("Document")
            .field("id", &self.inner.id)
            .field("title", &state.title)
            .field("roots", &state.roots.len())
            .field("models", &state.all_models.len())
            .finish()
    }
}
