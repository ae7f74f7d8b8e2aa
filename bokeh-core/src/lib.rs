//! # bokeh-core — Shared scene graph for Bokeh documents
//!
//! Holds the authoritative in-memory [`Document`] that a server and its
//! browser-side clients keep in sync, plus everything needed to move it
//! across the wire as full snapshots or incremental patches.
//!
//! ## Architecture
//!
//! ```text
//! local mutation                                 incoming PATCH-DOC
//!       │                                               │
//!       ▼                                               ▼
//! Model::setv ──► Document::notify_change      Document::apply_json_patch
//!                         │                             │
//!                         ▼                             ├─ refs::resolve_refs
//!                 DocumentChangedEvent                  ├─ codec::decode_column_data
//!                         │                             └─ Model::setv(setter_id)
//!                         ▼
//!               Document::create_json_patch ──► Patch { references, events }
//! ```
//!
//! ## Modules
//!
//! - [`value`] — tagged attribute values
//! - [`ndarray`] — typed numeric arrays, dtypes and byte order
//! - [`codec`] — column-data codec (`__ndarray__` / `__buffer__`)
//! - [`signal`] — typed observer lists with explicit unsubscribe handles
//! - [`registry`] — model types, property schema, type registry
//! - [`model`] — observable model objects
//! - [`refs`] — `{id, type}` reference objects
//! - [`sources`] — column data source streaming and patching
//! - [`events`] — application-level event dispatch
//! - [`document`] — the Document, its change events and JSON formats

pub mod codec;
pub mod document;
pub mod events;
pub mod model;
pub mod ndarray;
pub mod refs;
pub mod registry;
pub mod signal;
pub mod sources;
pub mod value;

pub use codec::{decode_column_data, encode_column_data, Buffer, ColumnData, Shape, Shapes};
pub use document::{
    DocJson, Document, DocumentChange, DocumentChangedEvent, EventJson, Patch, RootsJson,
    WeakDocument, DEFAULT_TITLE,
};
pub use events::{EventManager, ModelEvent};
pub use model::{AttributeChange, Model, ModelId, ModelRef, SetOptions};
pub use ndarray::{ByteOrder, DType, TypedArray};
pub use refs::{RefJson, References};
pub use registry::{ModelRegistry, ModelType, PropertyDef, PropertyKind};
pub use signal::{Signal, Subscription};
pub use sources::ColumnDataSource;
pub use value::Value;

/// Library version, compared against the version embedded in document JSON.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Unknown model type: {0}")]
    UnknownModelType(String),

    #[error("'{attr}' is not a property of {model_type}")]
    UnknownAttribute { model_type: String, attr: String },

    #[error("Invalid value for '{attr}': expected {expected}")]
    InvalidValue { attr: String, expected: String },

    #[error("'id' field should never change, whatever code just set it is wrong")]
    IdChanged,

    #[error("Reference {0} isn't known (not in Document?)")]
    UnknownReference(String),

    #[error("Cannot apply patch to {0} which is not in the document")]
    UnknownModel(String),

    #[error("Unknown patch event: {0}")]
    UnknownPatchEvent(String),

    #[error("Cannot create a patch using events from a different document")]
    ForeignDocumentEvent,

    #[error("Duplicate name: multiple models are named '{0}'")]
    DuplicateName(String),

    #[error("Attempted to overwrite a document with itself")]
    SelfMove,

    #[error("Detach failed: {0}")]
    DetachFailed(String),

    #[error("Model {0} is already attached to another document")]
    AlreadyAttached(String),

    #[error("Not implemented: computing add/remove of document roots")]
    RootsChanged,

    #[error("{0} is not a ColumnDataSource")]
    NotColumnDataSource(String),

    #[error("Invalid dtype: {0}")]
    InvalidDType(String),

    #[error("Invalid array payload: {0}")]
    InvalidPayload(String),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Buffer {0} not found")]
    MissingBuffer(String),

    #[error("Invalid patch: {0}")]
    InvalidPatch(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
