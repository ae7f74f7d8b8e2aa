use uuid::Uuid;

use super::json::EventJson;
use crate::model::ModelRef;
use crate::refs::{record_value_references, References};
use crate::value::Value;
use crate::Result;

#[derive(Debug, Clone)]
pub enum DocumentChange {
    ModelChanged {
        model: ModelRef,
        attr: String,
        old: Value,
        new: Value,
    },
    TitleChanged {
        title: String,
    },
    RootAdded {
        model: ModelRef,
    },
    RootRemoved {
        model: ModelRef,
    },
}

/// One mutation of a document, as delivered to its change listeners.
#[derive(Debug, Clone)]
pub struct DocumentChangedEvent {
    /// Id of the document that emitted the event.
    pub document: Uuid,
    /// Originator of the change, used to suppress echoes.
    pub setter_id: Option<String>,
    pub kind: DocumentChange,
}

impl DocumentChangedEvent {
    /// The model the event is about, if any.
    pub fn model(&self) -> Option<&ModelRef> {
        match &self.kind {
            DocumentChange::ModelChanged { model, .. }
            | DocumentChange::RootAdded { model }
            | DocumentChange::RootRemoved { model } => Some(model),
            DocumentChange::TitleChanged { .. } => None,
        }
    }

    /// Serialize the event, recording in `references` every model the
    /// receiver needs definitions for.
    pub fn to_json(&self, references: &mut References) -> Result<EventJson> {
        Ok(match &self.kind {
            DocumentChange::ModelChanged {
                model, attr, new, ..
            } => {
                let value = model.attribute_value_json(attr, new)?;
                let mut value_refs = References::new();
                record_value_references(new, &mut value_refs, true);
                // The receiver already knows the changed model itself.
                let is_self = matches!(new, Value::Model(m) if m.id() == model.id());
                if !is_self {
                    value_refs.shift_remove(model.id());
                }
                for (id, m) in value_refs {
                    references.entry(id).or_insert(m);
                }
                EventJson::ModelChanged {
                    model: model.ref_json(),
                    attr: attr.clone(),
                    new: value,
                }
            }
            DocumentChange::TitleChanged { title } => EventJson::TitleChanged {
                title: title.clone(),
            },
            DocumentChange::RootAdded { model } => {
                record_value_references(&Value::Model(model.clone()), references, true);
                EventJson::RootAdded {
                    model: model.ref_json(),
                }
            }
            DocumentChange::RootRemoved { model } => EventJson::RootRemoved {
                model: model.ref_json(),
            },
        })
    }
}
