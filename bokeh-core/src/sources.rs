//! Column data sources.
//!
//! A column data source is any model whose type declares a `data` column
//! property and an internal `_shapes` property. [`ColumnDataSource`] wraps
//! such a model and implements the incremental edits the patch protocol
//! delegates to it: appending rows and sparse in-place updates.

use serde_json::Value as Json;

use crate::codec::{self, ColumnData, Shape, Shapes};
use crate::model::{ModelRef, SetOptions};
use crate::value::Value;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct ColumnDataSource {
    model: ModelRef,
}

/// One parsed patch index.
#[derive(Debug, Clone, PartialEq)]
enum PatchIndex {
    Single(usize),
    Slice {
        start: Option<usize>,
        stop: Option<usize>,
        step: usize,
    },
    /// Address inside the `i`-th element of a ragged column.
    Nested(usize, Box<PatchIndex>),
}

impl ColumnDataSource {
    pub fn new(model: ModelRef) -> Result<Self> {
        let ty = model.model_type();
        if !ty.is_column_data("data") || ty.property_def("_shapes").is_none() {
            return Err(Error::NotColumnDataSource(model.to_string()));
        }
        Ok(Self { model })
    }

    pub fn model(&self) -> &ModelRef {
        &self.model
    }

    pub fn data(&self) -> ColumnData {
        self.model
            .get("data")
            .and_then(|v| v.as_dict().cloned())
            .unwrap_or_default()
    }

    pub fn shapes(&self) -> Shapes {
        self.model
            .get("_shapes")
            .map(|v| codec::shapes_from_value(&v))
            .unwrap_or_default()
    }

    /// Number of rows, taken from the first column.
    pub fn len(&self) -> usize {
        self.data()
            .values()
            .next()
            .and_then(Value::column_len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace `_shapes` and `data` together.
    pub fn set_data(&self, data: ColumnData, shapes: &Shapes, options: SetOptions) -> Result<()> {
        self.model.setv(
            [
                ("_shapes", codec::shapes_to_value(shapes)),
                ("data", Value::Dict(data)),
            ],
            options,
        )
    }

    /// Append rows. With `rollover`, the oldest rows are dropped so no
    /// column grows past that length.
    pub fn stream(
        &self,
        new_data: &ColumnData,
        rollover: Option<usize>,
        setter_id: Option<&str>,
    ) -> Result<()> {
        self.stream_with_shapes(new_data, &Shapes::new(), rollover, setter_id)
    }

    /// Like [`stream`](Self::stream), with the decoded shapes of the
    /// streamed rows. Per-element shapes of ragged columns follow their
    /// rows through the append and the rollover.
    pub fn stream_with_shapes(
        &self,
        new_data: &ColumnData,
        new_shapes: &Shapes,
        rollover: Option<usize>,
        setter_id: Option<&str>,
    ) -> Result<()> {
        let mut data = self.data();
        let old_shapes = self.shapes();
        let mut shapes = old_shapes.clone();
        for (name, rows) in new_data {
            let column = data
                .entry(name.clone())
                .or_insert_with(|| Value::List(Vec::new()));
            let old_len = column.column_len().unwrap_or(0);
            stream_to_column(column, rows, rollover)?;
            let new_len = column.column_len().unwrap_or(0);
            stream_shapes(
                &mut shapes,
                name,
                old_len,
                rows,
                new_shapes.get(name),
                new_len,
            );
        }
        let mut attrs = Vec::with_capacity(2);
        if shapes != old_shapes {
            attrs.push(("_shapes", codec::shapes_to_value(&shapes)));
        }
        attrs.push(("data", Value::Dict(data)));
        self.model
            .setv(attrs, SetOptions::with_setter(setter_id).without_check_eq())
    }

    /// Apply sparse edits given as `{column: [[index, value], ...]}`.
    pub fn patch(&self, patches: &Json, setter_id: Option<&str>) -> Result<()> {
        let patches = patches
            .as_object()
            .ok_or_else(|| Error::InvalidPatch("patches must be an object".to_string()))?;

        let mut data = self.data();
        for (name, edits) in patches {
            let column = data
                .get_mut(name)
                .ok_or_else(|| Error::InvalidPatch(format!("no column named '{name}'")))?;
            let edits = edits
                .as_array()
                .ok_or_else(|| Error::InvalidPatch(format!("edits for '{name}' must be a list")))?;
            for edit in edits {
                let (index, value) = match edit.as_array().map(Vec::as_slice) {
                    Some([index, value]) => (parse_index(index)?, Value::from_json(value)?),
                    _ => {
                        return Err(Error::InvalidPatch(format!(
                            "edit must be an [index, value] pair, got {edit}"
                        )))
                    }
                };
                apply_edit(column, &index, value)?;
            }
        }
        self.model.setv(
            [("data", Value::Dict(data))],
            SetOptions::with_setter(setter_id).without_check_eq(),
        )
    }
}

fn stream_to_column(column: &mut Value, rows: &Value, rollover: Option<usize>) -> Result<()> {
    match column {
        Value::List(items) => {
            items.extend(row_values(rows)?);
            if let Some(limit) = rollover {
                let excess = items.len().saturating_sub(limit);
                items.drain(..excess);
            }
        }
        Value::Array(arr) => {
            let numbers = row_values(rows)?
                .iter()
                .map(|v| {
                    v.as_f64().ok_or_else(|| {
                        Error::InvalidPatch(format!("cannot stream {v:?} into a {} column", arr.dtype()))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            arr.extend_from_f64(&numbers);
            if let Some(limit) = rollover {
                arr.drain_front(arr.len().saturating_sub(limit));
            }
        }
        other => {
            return Err(Error::InvalidPatch(format!("cannot stream into {other:?}")));
        }
    }
    Ok(())
}

/// Keep the `_shapes` entry of a streamed column aligned with its rows.
fn stream_shapes(
    shapes: &mut Shapes,
    name: &str,
    old_len: usize,
    rows: &Value,
    incoming: Option<&Shape>,
    new_len: usize,
) {
    let existing = shapes.get(name).cloned();
    let incoming = match incoming {
        Some(Shape::Ragged(all)) => Some(all.clone()),
        _ => None,
    };
    match existing {
        Some(Shape::Dims(_)) => {
            // A flat array grew or shrank, so its stored dimensions are stale.
            shapes.shift_remove(name);
        }
        Some(Shape::Ragged(mut all)) => {
            all.resize(old_len, Vec::new());
            all.extend(incoming.unwrap_or_else(|| row_shapes(rows)));
            let excess = all.len().saturating_sub(new_len);
            all.drain(..excess);
            shapes.insert(name.to_string(), Shape::Ragged(all));
        }
        None => {
            if let Some(streamed) = incoming {
                let mut all = vec![Vec::new(); old_len];
                all.extend(streamed);
                let excess = all.len().saturating_sub(new_len);
                all.drain(..excess);
                shapes.insert(name.to_string(), Shape::Ragged(all));
            }
        }
    }
}

/// Default per-row shapes: `[len]` for typed arrays, none otherwise.
fn row_shapes(rows: &Value) -> Vec<Vec<usize>> {
    match rows {
        Value::List(items) => items
            .iter()
            .map(|item| match item {
                Value::Array(arr) => vec![arr.len()],
                _ => Vec::new(),
            })
            .collect(),
        Value::Array(arr) => vec![Vec::new(); arr.len()],
        _ => Vec::new(),
    }
}

fn row_values(rows: &Value) -> Result<Vec<Value>> {
    match rows {
        Value::List(items) => Ok(items.clone()),
        Value::Array(arr) => Ok(arr.to_f64_vec().into_iter().map(Value::Number).collect()),
        other => Err(Error::InvalidPatch(format!("streamed rows must be a list, got {other:?}"))),
    }
}

fn parse_index(json: &Json) -> Result<PatchIndex> {
    let bad = || Error::InvalidPatch(format!("invalid patch index {json}"));
    let bound = |key: &str| -> Result<Option<usize>> {
        match json.get(key) {
            None | Some(Json::Null) => Ok(None),
            Some(n) => n.as_u64().map(|n| Some(n as usize)).ok_or_else(bad),
        }
    };
    match json {
        Json::Number(n) => n.as_u64().map(|n| PatchIndex::Single(n as usize)).ok_or_else(bad),
        Json::Object(_) => {
            let step = bound("step")?.unwrap_or(1);
            if step == 0 {
                return Err(bad());
            }
            Ok(PatchIndex::Slice {
                start: bound("start")?,
                stop: bound("stop")?,
                step,
            })
        }
        Json::Array(parts) => match parts.as_slice() {
            [outer, inner] => {
                let outer = outer.as_u64().ok_or_else(bad)? as usize;
                let inner = parse_index(inner)?;
                if matches!(inner, PatchIndex::Nested(..)) {
                    return Err(bad());
                }
                Ok(PatchIndex::Nested(outer, Box::new(inner)))
            }
            _ => Err(bad()),
        },
        _ => Err(bad()),
    }
}

fn slice_positions(start: Option<usize>, stop: Option<usize>, step: usize, len: usize) -> Vec<usize> {
    let start = start.unwrap_or(0).min(len);
    let stop = stop.unwrap_or(len).min(len);
    (start..stop).step_by(step).collect()
}

fn apply_edit(column: &mut Value, index: &PatchIndex, value: Value) -> Result<()> {
    let len = column
        .column_len()
        .ok_or_else(|| Error::InvalidPatch(format!("cannot patch {column:?}")))?;
    match index {
        PatchIndex::Single(i) => assign(column, *i, value),
        PatchIndex::Slice { start, stop, step } => {
            let positions = slice_positions(*start, *stop, *step, len);
            let values = row_values(&value)?;
            if values.len() != positions.len() {
                return Err(Error::InvalidPatch(format!(
                    "slice selects {} rows but {} values were given",
                    positions.len(),
                    values.len()
                )));
            }
            for (i, v) in positions.into_iter().zip(values) {
                assign(column, i, v)?;
            }
            Ok(())
        }
        PatchIndex::Nested(outer, inner) => match column {
            Value::List(items) => {
                let item = items.get_mut(*outer).ok_or_else(|| out_of_range(*outer, len))?;
                apply_edit(item, inner, value)
            }
            _ => Err(Error::InvalidPatch(
                "nested index on a column that is not ragged".to_string(),
            )),
        },
    }
}

fn assign(column: &mut Value, index: usize, value: Value) -> Result<()> {
    match column {
        Value::List(items) => {
            let len = items.len();
            let slot = items.get_mut(index).ok_or_else(|| out_of_range(index, len))?;
            *slot = value;
            Ok(())
        }
        Value::Array(arr) => {
            let x = value
                .as_f64()
                .ok_or_else(|| Error::InvalidPatch(format!("{value:?} is not numeric")))?;
            if arr.set(index, x) {
                Ok(())
            } else {
                Err(out_of_range(index, arr.len()))
            }
        }
        other => Err(Error::InvalidPatch(format!("cannot patch {other:?}"))),
    }
}

fn out_of_range(index: usize, len: usize) -> Error {
    Error::InvalidPatch(format!("index {index} out of range for column of length {len}"))
}
