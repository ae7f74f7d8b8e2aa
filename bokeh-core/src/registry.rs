//! Model types and the registry that resolves them by name.
//!
//! A [`ModelType`] is both the schema of a model (its ordered, typed
//! properties) and the factory that instantiates it. The
//! [`ModelRegistry`] maps type names to model types and is consulted
//! whenever a document or patch is deserialized.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::model::{Model, ModelId, ModelRef};
use crate::value::Value;
use crate::{Error, Result};

/// Declared kind of a property, used to validate assigned values.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyKind {
    Any,
    Bool,
    Int,
    Number,
    String,
    /// Another model.
    Ref,
    /// Column name → column (list or typed array).
    ColumnData,
    Nullable(Box<PropertyKind>),
    List(Box<PropertyKind>),
    Dict(Box<PropertyKind>),
}

impl PropertyKind {
    pub fn nullable(inner: PropertyKind) -> Self {
        Self::Nullable(Box::new(inner))
    }

    pub fn list(inner: PropertyKind) -> Self {
        Self::List(Box::new(inner))
    }

    pub fn dict(inner: PropertyKind) -> Self {
        Self::Dict(Box::new(inner))
    }

    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (Self::Any, _) => true,
            (Self::Nullable(_), Value::Null) => true,
            (Self::Nullable(inner), v) => inner.accepts(v),
            (Self::Bool, Value::Bool(_)) => true,
            (Self::Int, Value::Int(_)) => true,
            (Self::Int, Value::Number(n)) => n.fract() == 0.0,
            (Self::Number, Value::Int(_) | Value::Number(_)) => true,
            (Self::String, Value::String(_)) => true,
            (Self::Ref, Value::Model(_)) => true,
            (Self::ColumnData, Value::Dict(columns)) => columns
                .values()
                .all(|c| matches!(c, Value::List(_) | Value::Array(_))),
            (Self::List(inner), Value::List(items)) => items.iter().all(|v| inner.accepts(v)),
            (Self::Dict(inner), Value::Dict(map)) => map.values().all(|v| inner.accepts(v)),
            _ => false,
        }
    }
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("Any"),
            Self::Bool => f.write_str("Bool"),
            Self::Int => f.write_str("Int"),
            Self::Number => f.write_str("Number"),
            Self::String => f.write_str("String"),
            Self::Ref => f.write_str("Ref"),
            Self::ColumnData => f.write_str("ColumnData"),
            Self::Nullable(inner) => write!(f, "Nullable({inner})"),
            Self::List(inner) => write!(f, "List({inner})"),
            Self::Dict(inner) => write!(f, "Dict({inner})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PropertyDef {
    pub name: String,
    pub kind: PropertyKind,
    pub default: Value,
    /// Whether the attribute is visible to the server.
    pub serializable: bool,
}

/// Hook run once per model after all of its references are resolved.
pub type Initializer = Arc<dyn Fn(&ModelRef) + Send + Sync>;

/// Schema and factory for one model type.
#[derive(Clone)]
pub struct ModelType {
    name: String,
    properties: IndexMap<String, PropertyDef>,
    initializer: Option<Initializer>,
}

impl ModelType {
    /// A model type carrying the base `name` and `tags` properties.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: IndexMap::new(),
            initializer: None,
        }
        .property("name", PropertyKind::nullable(PropertyKind::String), Value::Null)
        .property("tags", PropertyKind::list(PropertyKind::Any), Value::List(Vec::new()))
    }

    /// Declare a serializable property.
    pub fn property(mut self, name: &str, kind: PropertyKind, default: Value) -> Self {
        self.properties.insert(
            name.to_string(),
            PropertyDef {
                name: name.to_string(),
                kind,
                default,
                serializable: true,
            },
        );
        self
    }

    /// Declare a client-only property that never travels to the server.
    pub fn internal(mut self, name: &str, kind: PropertyKind, default: Value) -> Self {
        self.properties.insert(
            name.to_string(),
            PropertyDef {
                name: name.to_string(),
                kind,
                default,
                serializable: false,
            },
        );
        self
    }

    pub fn with_initializer<F>(mut self, initializer: F) -> Self
    where
        F: Fn(&ModelRef) + Send + Sync + 'static,
    {
        self.initializer = Some(Arc::new(initializer));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn property_def(&self, name: &str) -> Option<&PropertyDef> {
        self.properties.get(name)
    }

    pub fn properties(&self) -> impl Iterator<Item = &PropertyDef> {
        self.properties.values()
    }

    /// True when `attr` holds column data (and is decoded with the
    /// column-data codec rather than the generic reference resolver).
    pub fn is_column_data(&self, attr: &str) -> bool {
        matches!(
            self.properties.get(attr).map(|p| &p.kind),
            Some(PropertyKind::ColumnData)
        )
    }

    pub(crate) fn initializer(&self) -> Option<&Initializer> {
        self.initializer.as_ref()
    }

    pub fn instantiate(self: &Arc<Self>, id: ModelId) -> ModelRef {
        Model::new(id, self.clone())
    }
}

impl fmt::Debug for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelType")
            .field("name", &self.name)
            .field("properties", &self.properties.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Type name → model type.
///
/// Built once at start-up and then shared (`Arc<ModelRegistry>`) with
/// every document that needs to deserialize models.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    types: HashMap<String, Arc<ModelType>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in `Model` and `ColumnDataSource` types.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(ModelType::new("Model"));
        registry.register(column_data_source_type());
        registry
    }

    /// Register (or replace) a model type under its own name.
    pub fn register(&mut self, model_type: ModelType) -> Arc<ModelType> {
        let model_type = Arc::new(model_type);
        self.types
            .insert(model_type.name().to_string(), model_type.clone());
        model_type
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<ModelType>> {
        self.types
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownModelType(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Instantiate `name` with a caller-supplied id (deserialization).
    pub fn instantiate(&self, name: &str, id: ModelId) -> Result<ModelRef> {
        Ok(self.resolve(name)?.instantiate(id))
    }

    /// Instantiate `name` with a fresh unique id.
    pub fn create(&self, name: &str) -> Result<ModelRef> {
        self.instantiate(name, ModelId::unique())
    }
}

/// Schema of the built-in column data source.
pub fn column_data_source_type() -> ModelType {
    ModelType::new("ColumnDataSource")
        .property("data", PropertyKind::ColumnData, Value::Dict(IndexMap::new()))
        .internal("_shapes", PropertyKind::dict(PropertyKind::Any), Value::Dict(IndexMap::new()))
}
