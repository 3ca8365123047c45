//! In-place operations on column data: replace, stream and patch.
//!
//! Each operation mutates the attribute and publishes a single change tagged
//! with a [`ColumnHint`], which the document turns into the matching
//! narrow event instead of resending the whole table.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::codec::{ArrayData, NdArray};
use crate::error::{Result, SyncError};
use crate::model::{AttrChange, Model, SetterId};
use crate::property::PropertyKind;
use crate::value::Value;

/// Row selector for [`Model::patch_columns`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PatchIndex {
    Index(usize),
    Slice {
        #[serde(default)]
        start: Option<usize>,
        #[serde(default)]
        stop: Option<usize>,
        #[serde(default)]
        step: Option<usize>,
    },
}

impl PatchIndex {
    pub fn slice(start: usize, stop: usize) -> Self {
        PatchIndex::Slice {
            start: Some(start),
            stop: Some(stop),
            step: None,
        }
    }

    /// Concrete positions in a column of `len` entries.
    fn positions(&self, len: usize) -> std::result::Result<Vec<usize>, String> {
        match *self {
            PatchIndex::Index(i) if i < len => Ok(vec![i]),
            PatchIndex::Index(i) => Err(format!("index {i} out of range for length {len}")),
            PatchIndex::Slice { start, stop, step } => {
                let start = start.unwrap_or(0);
                let stop = stop.unwrap_or(len);
                let step = step.unwrap_or(1);
                if step == 0 {
                    return Err("slice step must be positive".to_string());
                }
                if start > stop || stop > len {
                    return Err(format!("slice {start}..{stop} out of range for length {len}"));
                }
                Ok((start..stop).step_by(step).collect())
            }
        }
    }
}

pub type ColumnPatches = IndexMap<String, Vec<(PatchIndex, Value)>>;

/// How a column-data attribute changed.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnHint {
    /// `cols` names the replaced columns; `None` replaced the whole table.
    Replaced { cols: Option<Vec<String>> },
    Streamed {
        data: IndexMap<String, Value>,
        rollover: Option<usize>,
    },
    Patched { patches: ColumnPatches },
}

impl Model {
    /// Replace columns of `attr`. With `cols` only the named columns are
    /// taken from `data`; otherwise `data` becomes the whole table.
    pub fn replace_columns(
        &self,
        attr: &str,
        data: IndexMap<String, Value>,
        cols: Option<Vec<String>>,
        setter_id: Option<&SetterId>,
    ) -> Result<()> {
        let old = self.column_table(attr)?;
        let new = match &cols {
            Some(names) => {
                let mut merged = old.clone();
                for name in names {
                    let column = data.get(name).cloned().ok_or_else(|| {
                        SyncError::validation(self.type_name(), attr, format!("missing column '{name}'"))
                    })?;
                    merged.insert(name.clone(), column);
                }
                merged
            }
            None => data,
        };
        let new = Value::Map(new);
        PropertyKind::ColumnData
            .validate(&new)
            .map_err(|reason| SyncError::validation(self.type_name(), attr, reason))?;

        self.finish(attr, Value::Map(old), new, ColumnHint::Replaced { cols }, setter_id)
    }

    /// Append rows to the columns of `attr`, then drop the oldest rows so at
    /// most `rollover` remain.
    pub fn stream(
        &self,
        attr: &str,
        data: IndexMap<String, Value>,
        rollover: Option<usize>,
        setter_id: Option<&SetterId>,
    ) -> Result<()> {
        let old = self.column_table(attr)?;
        let mut table = old.clone();
        for (name, rows) in &data {
            let column = table
                .entry(name.clone())
                .or_insert_with(|| Value::List(Vec::new()));
            stream_column(column, rows, rollover)
                .map_err(|reason| SyncError::validation(self.type_name(), attr, format!("column '{name}': {reason}")))?;
        }
        warn_if_ragged(self, attr, &table);

        let hint = ColumnHint::Streamed { data, rollover };
        self.finish(attr, Value::Map(old), Value::Map(table), hint, setter_id)
    }

    /// Overwrite selected rows. For typed arrays positions address the
    /// flattened element buffer. Either every patch applies or none does.
    pub fn patch_columns(&self, attr: &str, patches: ColumnPatches, setter_id: Option<&SetterId>) -> Result<()> {
        let old = self.column_table(attr)?;
        let mut table = old.clone();
        for (name, edits) in &patches {
            let column = table.get_mut(name).ok_or_else(|| {
                SyncError::validation(self.type_name(), attr, format!("no column '{name}' to patch"))
            })?;
            for (index, value) in edits {
                patch_column(column, index, value)
                    .map_err(|reason| SyncError::validation(self.type_name(), attr, format!("column '{name}': {reason}")))?;
            }
        }

        let hint = ColumnHint::Patched { patches };
        self.finish(attr, Value::Map(old), Value::Map(table), hint, setter_id)
    }

    fn column_table(&self, attr: &str) -> Result<IndexMap<String, Value>> {
        if self.is_destroyed() {
            return Err(SyncError::Destroyed(self.id().clone()));
        }
        match self.get(attr)? {
            Value::Map(table) => Ok(table),
            other => Err(SyncError::validation(
                self.type_name(),
                attr,
                format!("expected column data, found {}", other.kind_name()),
            )),
        }
    }

    /// Check the edited table against the declared kind and document
    /// ownership, then store and publish it.
    fn finish(&self, attr: &str, old: Value, new: Value, hint: ColumnHint, setter_id: Option<&SetterId>) -> Result<()> {
        self.property(attr)?
            .kind
            .validate(&new)
            .map_err(|reason| SyncError::validation(self.type_name(), attr, reason))?;
        self.check_attachable(&new)?;
        self.store(attr, new.clone());
        let change = AttrChange {
            attr: attr.to_string(),
            old,
            new,
            hint: Some(hint),
        };
        self.commit(std::slice::from_ref(&change), false, setter_id);
        Ok(())
    }
}

fn stream_column(column: &mut Value, rows: &Value, rollover: Option<usize>) -> std::result::Result<(), String> {
    match (column, rows) {
        (Value::List(items), Value::List(new)) => {
            items.extend(new.iter().cloned());
            if let Some(keep) = rollover {
                let excess = items.len().saturating_sub(keep);
                items.drain(..excess);
            }
        }
        (Value::List(items), Value::Array(new)) => {
            items.extend(new.data().to_values());
            if let Some(keep) = rollover {
                let excess = items.len().saturating_sub(keep);
                items.drain(..excess);
            }
        }
        (Value::Array(array), new) => {
            let rows = match new {
                Value::Array(a) => a.clone(),
                Value::List(items) => list_as_rows(array, items)?,
                other => return Err(format!("cannot stream {} into an array", other.kind_name())),
            };
            array
                .append_rows(&rows)
                .ok_or_else(|| format!("rows of shape {:?} do not fit {:?}", rows.shape(), array.shape()))?;
            if let Some(keep) = rollover {
                array.retain_last_rows(keep);
            }
        }
        (other, _) => return Err(format!("cannot stream into {}", other.kind_name())),
    }
    Ok(())
}

/// Convert streamed list data to the element type and row shape of `target`.
fn list_as_rows(target: &NdArray, items: &[Value]) -> std::result::Result<NdArray, String> {
    let data = ArrayData::from_values(target.dtype(), items)
        .ok_or_else(|| format!("values do not fit {}", target.dtype()))?;
    let row = target.row_size().max(1);
    if items.len() % row != 0 {
        return Err(format!("{} values are not whole rows of {row}", items.len()));
    }
    let mut shape = vec![items.len() / row];
    shape.extend(target.shape().iter().skip(1));
    NdArray::new(data, shape).map_err(|e| e.to_string())
}

fn patch_column(column: &mut Value, index: &PatchIndex, value: &Value) -> std::result::Result<(), String> {
    let len = match column {
        Value::List(items) => items.len(),
        Value::Array(array) => array.len(),
        other => return Err(format!("cannot patch {}", other.kind_name())),
    };
    let positions = index.positions(len)?;
    let values: Vec<&Value> = match (index, value) {
        (PatchIndex::Index(_), v) => vec![v],
        (PatchIndex::Slice { .. }, Value::List(items)) if items.len() == positions.len() => items.iter().collect(),
        (PatchIndex::Slice { .. }, Value::Array(a)) if a.len() == positions.len() => {
            return patch_positions(column, &positions, &a.data().to_values().iter().collect::<Vec<_>>());
        }
        (PatchIndex::Slice { .. }, _) => {
            return Err(format!("slice selects {} rows but the patch value does not match", positions.len()))
        }
    };
    patch_positions(column, &positions, &values)
}

fn patch_positions(column: &mut Value, positions: &[usize], values: &[&Value]) -> std::result::Result<(), String> {
    for (&pos, &value) in positions.iter().zip(values) {
        match column {
            Value::List(items) => items[pos] = value.clone(),
            Value::Array(array) => array
                .set(pos, value)
                .ok_or_else(|| format!("cannot store {} in a {} array", value.kind_name(), array.dtype()))?,
            other => return Err(format!("cannot patch {}", other.kind_name())),
        }
    }
    Ok(())
}

fn column_len(column: &Value) -> Option<usize> {
    match column {
        Value::List(items) => Some(items.len()),
        Value::Array(array) => Some(array.rows()),
        _ => None,
    }
}

fn warn_if_ragged(model: &Model, attr: &str, table: &IndexMap<String, Value>) {
    let mut lengths = table.values().filter_map(column_len);
    if let Some(first) = lengths.next() {
        if lengths.any(|len| len != first) {
            log::warn!("{}.{attr} has columns of different lengths after streaming", model.type_name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::registry::column_data_source;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn source(columns: &[(&str, Value)]) -> Model {
        let model = Model::new(column_data_source());
        let data: IndexMap<String, Value> = columns
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        model.set("data", Value::Map(data)).unwrap();
        model
    }

    fn column(model: &Model, name: &str) -> Value {
        model.get("data").unwrap().as_map().unwrap()[name].clone()
    }

    fn ints(values: &[i64]) -> Value {
        Value::List(values.iter().map(|&v| Value::Int(v)).collect())
    }

    #[test]
    fn test_stream_with_rollover_keeps_newest() {
        let src = source(&[("x", ints(&[1, 2, 3]))]);
        let data = IndexMap::from([("x".to_string(), ints(&[4, 5]))]);
        src.stream("data", data, Some(4), None).unwrap();
        assert_eq!(column(&src, "x"), ints(&[2, 3, 4, 5]));
    }

    #[test]
    fn test_stream_rollover_larger_than_total() {
        let src = source(&[("x", ints(&[1]))]);
        let data = IndexMap::from([("x".to_string(), ints(&[2]))]);
        src.stream("data", data, Some(10), None).unwrap();
        assert_eq!(column(&src, "x"), ints(&[1, 2]));
    }

    #[test]
    fn test_stream_list_into_typed_column_converts() {
        let src = source(&[("y", Value::Array(NdArray::from_vec(vec![1.0f32, 2.0])))]);
        let data = IndexMap::from([("y".to_string(), Value::from(vec![3, 4]))]);
        src.stream("data", data, Some(3), None).unwrap();
        let y = column(&src, "y");
        assert_eq!(y.as_array().unwrap().as_slice::<f32>().unwrap(), &[2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_stream_two_dimensional_along_first_axis() {
        let image = NdArray::with_shape(vec![1u8, 2, 3, 4], vec![2, 2]).unwrap();
        let src = source(&[("img", Value::Array(image))]);
        let more = NdArray::with_shape(vec![5u8, 6], vec![1, 2]).unwrap();
        let data = IndexMap::from([("img".to_string(), Value::Array(more))]);
        src.stream("data", data, Some(2), None).unwrap();
        let img = column(&src, "img");
        let img = img.as_array().unwrap();
        assert_eq!(img.shape(), &[2, 2]);
        assert_eq!(img.as_slice::<u8>().unwrap(), &[3, 4, 5, 6]);
    }

    #[test]
    fn test_stream_rejects_mismatched_row_shape() {
        let image = NdArray::with_shape(vec![1u8, 2, 3, 4], vec![2, 2]).unwrap();
        let src = source(&[("img", Value::Array(image))]);
        let more = NdArray::with_shape(vec![5u8, 6, 7], vec![1, 3]).unwrap();
        let data = IndexMap::from([("img".to_string(), Value::Array(more))]);
        assert!(matches!(
            src.stream("data", data, None, None),
            Err(SyncError::Validation { .. })
        ));
    }

    #[test]
    fn test_patch_index_and_slice() {
        let src = source(&[("x", ints(&[0, 0, 0, 0]))]);
        let patches = IndexMap::from([(
            "x".to_string(),
            vec![
                (PatchIndex::Index(0), Value::Int(9)),
                (
                    PatchIndex::Slice { start: Some(1), stop: None, step: Some(2) },
                    ints(&[7, 8]),
                ),
            ],
        )]);
        src.patch_columns("data", patches, None).unwrap();
        assert_eq!(column(&src, "x"), ints(&[9, 7, 0, 8]));
    }

    #[test]
    fn test_patch_typed_array_flat_index() {
        let grid = NdArray::with_shape(vec![0.0f64; 4], vec![2, 2]).unwrap();
        let src = source(&[("z", Value::Array(grid))]);
        let patches = IndexMap::from([("z".to_string(), vec![(PatchIndex::Index(3), Value::Float(1.5))])]);
        src.patch_columns("data", patches, None).unwrap();
        let z = column(&src, "z");
        assert_eq!(z.as_array().unwrap().as_slice::<f64>().unwrap(), &[0.0, 0.0, 0.0, 1.5]);
    }

    #[test]
    fn test_patch_out_of_range_leaves_data_untouched() {
        let src = source(&[("x", ints(&[1, 2]))]);
        let patches = IndexMap::from([(
            "x".to_string(),
            vec![(PatchIndex::Index(0), Value::Int(5)), (PatchIndex::Index(2), Value::Int(6))],
        )]);
        let err = src.patch_columns("data", patches, None).unwrap_err();
        assert!(matches!(err, SyncError::Validation { .. }));
        assert_eq!(column(&src, "x"), ints(&[1, 2]));
    }

    #[test]
    fn test_replace_named_columns_only() {
        let src = source(&[("x", ints(&[1])), ("y", ints(&[2]))]);
        let data = IndexMap::from([("y".to_string(), ints(&[3])), ("z".to_string(), ints(&[4]))]);
        src.replace_columns("data", data, Some(vec!["y".to_string()]), None)
            .unwrap();
        let table = src.get("data").unwrap();
        let table = table.as_map().unwrap();
        assert_eq!(table.keys().collect::<Vec<_>>(), vec!["x", "y"]);
        assert_eq!(table["y"], ints(&[3]));
    }

    #[test]
    fn test_stream_checks_declared_column_kind() {
        let def = crate::registry::ModelDef::builder("Series")
            .property(
                "data",
                PropertyKind::dict(PropertyKind::list(PropertyKind::Float)),
                Value::Map(IndexMap::new()),
            )
            .build();
        let series = Model::new(def);
        series.set("data", Value::map([("y", vec![1.0])])).unwrap();

        let data = IndexMap::from([("y".to_string(), Value::from(vec!["oops"]))]);
        let err = series.stream("data", data, None, None).unwrap_err();
        assert!(matches!(err, SyncError::Validation { .. }));
        assert_eq!(column(&series, "y"), Value::from(vec![1.0]));

        let patches = IndexMap::from([("y".to_string(), vec![(PatchIndex::Index(0), Value::from("oops"))])]);
        assert!(series.patch_columns("data", patches, None).is_err());
        assert_eq!(column(&series, "y"), Value::from(vec![1.0]));
    }

    #[test]
    fn test_column_edits_reject_foreign_models() {
        let registry = Rc::new(crate::registry::ModelRegistry::with_builtins());
        let a = Document::with_registry(registry.clone());
        let b = Document::with_registry(registry);
        let src = source(&[("x", Value::List(Vec::new()))]);
        let foreign = Model::new(column_data_source());
        a.add_root(&src, None).unwrap();
        b.add_root(&foreign, None).unwrap();

        let data = IndexMap::from([("x".to_string(), Value::List(vec![Value::from(&foreign)]))]);
        let err = src.stream("data", data.clone(), None, None).unwrap_err();
        assert!(matches!(err, SyncError::AlreadyAttached(_)));
        let err = src.replace_columns("data", data, None, None).unwrap_err();
        assert!(matches!(err, SyncError::AlreadyAttached(_)));
        assert_eq!(column(&src, "x"), Value::List(Vec::new()));
        assert_eq!(foreign.document(), Some(b));
    }

    #[test]
    fn test_hint_reaches_listener() {
        let src = source(&[("x", ints(&[1]))]);
        let hints = Rc::new(RefCell::new(Vec::new()));
        let h = hints.clone();
        src.on_change(Some("data"), move |n| {
            h.borrow_mut().push(n.changes[0].hint.clone());
        });
        let data = IndexMap::from([("x".to_string(), ints(&[2]))]);
        src.stream("data", data.clone(), None, None).unwrap();
        assert_eq!(
            hints.borrow()[0],
            Some(ColumnHint::Streamed { data, rollover: None })
        );
    }

    #[test]
    fn test_patch_index_wire_forms() {
        let index: PatchIndex = serde_json::from_str("3").unwrap();
        assert_eq!(index, PatchIndex::Index(3));
        let slice: PatchIndex = serde_json::from_str(r#"{"start": 1, "stop": 4, "step": null}"#).unwrap();
        assert_eq!(slice, PatchIndex::slice(1, 4));
    }
}
