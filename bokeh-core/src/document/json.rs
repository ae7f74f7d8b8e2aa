//! JSON shapes of documents and patches.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::model::ModelId;
use crate::refs::RefJson;
use crate::{Error, Result};

/// `{version?, title?, roots: {root_ids, references}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocJson {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub roots: RootsJson,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootsJson {
    pub root_ids: Vec<ModelId>,
    pub references: Vec<RefJson>,
}

/// One serialized document change, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EventJson {
    ModelChanged {
        model: RefJson,
        attr: String,
        new: Json,
    },
    TitleChanged {
        title: String,
    },
    RootAdded {
        model: RefJson,
    },
    RootRemoved {
        model: RefJson,
    },
    ColumnDataChanged {
        column_source: RefJson,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<Json>,
        new: Json,
    },
    ColumnsStreamed {
        column_source: RefJson,
        data: Map<String, Json>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rollover: Option<usize>,
    },
    ColumnsPatched {
        column_source: RefJson,
        patches: Json,
    },
    /// An application message for callbacks registered with
    /// [`Document::on_message`](super::Document::on_message). Without
    /// `msg_data` the payload is the patch's single binary buffer.
    MessageSent {
        msg_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msg_data: Option<Json>,
    },
}

impl EventJson {
    pub const KINDS: [&'static str; 8] = [
        "ModelChanged",
        "TitleChanged",
        "RootAdded",
        "RootRemoved",
        "ColumnDataChanged",
        "ColumnsStreamed",
        "ColumnsPatched",
        "MessageSent",
    ];

    /// Parse one event, rejecting kinds this library does not know.
    pub fn from_json(json: &Json) -> Result<Self> {
        let kind = json.get("kind").and_then(Json::as_str);
        match kind {
            Some(kind) if Self::KINDS.contains(&kind) => Ok(serde_json::from_value(json.clone())?),
            Some(kind) => Err(Error::UnknownPatchEvent(kind.to_string())),
            None => Err(Error::UnknownPatchEvent(json.to_string())),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ModelChanged { .. } => "ModelChanged",
            Self::TitleChanged { .. } => "TitleChanged",
            Self::RootAdded { .. } => "RootAdded",
            Self::RootRemoved { .. } => "RootRemoved",
            Self::ColumnDataChanged { .. } => "ColumnDataChanged",
            Self::ColumnsStreamed { .. } => "ColumnsStreamed",
            Self::ColumnsPatched { .. } => "ColumnsPatched",
            Self::MessageSent { .. } => "MessageSent",
        }
    }

    /// The `model` reference of events that carry one.
    pub fn model(&self) -> Option<&RefJson> {
        match self {
            Self::ModelChanged { model, .. }
            | Self::RootAdded { model }
            | Self::RootRemoved { model } => Some(model),
            _ => None,
        }
    }
}

/// A self-contained batch of events plus the definitions of every model
/// they introduce.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    #[serde(default)]
    pub references: Vec<RefJson>,
    #[serde(default)]
    pub events: Vec<EventJson>,
}

impl Patch {
    pub fn from_json(json: &Json) -> Result<Self> {
        let references = match json.get("references") {
            Some(refs) => serde_json::from_value(refs.clone())?,
            None => Vec::new(),
        };
        let events = match json.get("events").and_then(Json::as_array) {
            Some(events) => events
                .iter()
                .map(EventJson::from_json)
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };
        Ok(Self { references, events })
    }

    pub fn to_json(&self) -> Result<Json> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_kinds() {
        let event = EventJson::from_json(&json!({
            "kind": "ColumnsStreamed",
            "column_source": {"id": "s", "type": "ColumnDataSource"},
            "data": {"x": [1]},
            "rollover": null,
        }))
        .unwrap();
        assert_eq!(event.kind(), "ColumnsStreamed");
        assert!(event.model().is_none());
    }

    #[test]
    fn test_message_sent_without_data() {
        let event =
            EventJson::from_json(&json!({"kind": "MessageSent", "msg_type": "blob"})).unwrap();
        assert_eq!(
            event,
            EventJson::MessageSent {
                msg_type: "blob".to_string(),
                msg_data: None,
            }
        );
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"kind": "MessageSent", "msg_type": "blob"})
        );
    }

    #[test]
    fn test_unknown_kind() {
        let err = EventJson::from_json(&json!({"kind": "Exploded"})).unwrap_err();
        assert!(matches!(err, Error::UnknownPatchEvent(kind) if kind == "Exploded"));
    }

    #[test]
    fn test_patch_serialization_shape() {
        let patch = Patch {
            references: vec![],
            events: vec![EventJson::TitleChanged {
                title: "x".to_string(),
            }],
        };
        assert_eq!(
            patch.to_json().unwrap(),
            json!({"references": [], "events": [{"kind": "TitleChanged", "title": "x"}]})
        );
    }
}
