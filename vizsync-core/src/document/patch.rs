//! Patch creation, diffing and application.

use std::collections::HashSet;

use indexmap::IndexMap;
use serde_json::{Map, Value as JsonValue};

use super::events::{DocumentChangedEvent, Patch, PatchEvent, PatchOutcome, SkippedEvent};
use super::{Document, DocumentJson};
use crate::codec::Buffer;
use crate::columnar::{ColumnPatches, PatchIndex};
use crate::error::{Result, SyncError};
use crate::model::{Model, ModelId, SetOptions, SetterId};
use crate::refs::{Deserializer, ModelRep, Ref, SerializeOptions, Serializer};
use crate::registry::ModelRegistry;
use crate::value::Value;

/// A wire event resolved against live models, ready to apply.
enum Op {
    Set { model: Model, attr: String, value: Value },
    Title(String),
    AddRoot(Model),
    RemoveRoot(Model),
    Replace {
        model: Model,
        attr: String,
        data: IndexMap<String, Value>,
        cols: Option<Vec<String>>,
    },
    Stream {
        model: Model,
        attr: String,
        data: IndexMap<String, Value>,
        rollover: Option<usize>,
    },
    Patch {
        model: Model,
        attr: String,
        patches: ColumnPatches,
    },
}

impl Document {
    /// Convert live change events into a wire patch.
    ///
    /// Models attached since the previous patch travel in full in
    /// `references`; everything else the peer already has goes by ref.
    /// Events about models no longer in this document are dropped.
    pub fn create_patch(
        &self,
        events: &[DocumentChangedEvent],
        options: SerializeOptions,
    ) -> Result<(Patch, Vec<Buffer>)> {
        let known: Vec<ModelId> = {
            let state = self.0.state.borrow();
            state
                .all_models
                .keys()
                .filter(|id| !state.new_models.contains(*id))
                .cloned()
                .collect()
        };
        let mut serializer = Serializer::new(options).with_known(known);

        let mut wire = Vec::with_capacity(events.len());
        for event in events {
            if let Some(encoded) = self.encode_event(&mut serializer, event)? {
                wire.push(encoded);
            }
        }
        let (references, buffers) = serializer.into_parts();

        let mut state = self.0.state.borrow_mut();
        for rep in &references {
            state.new_models.remove(&rep.header.id);
        }
        Ok((
            Patch {
                references,
                events: wire,
            },
            buffers,
        ))
    }

    fn encode_event(&self, ser: &mut Serializer, event: &DocumentChangedEvent) -> Result<Option<PatchEvent>> {
        if let Some(model) = event.model() {
            // A removed root is already detached when its event is encoded.
            let root_event = matches!(
                event,
                DocumentChangedEvent::RootAdded { .. } | DocumentChangedEvent::RootRemoved { .. }
            );
            if !root_event && !model.is_attached_to(&self.0) {
                log::debug!("dropping {} for detached model {}", event.kind(), model.id());
                return Ok(None);
            }
        }
        let setter_id = event.setter_id().cloned();
        Ok(Some(match event {
            DocumentChangedEvent::ModelChanged { model, attr, new, .. } => PatchEvent::ModelChanged {
                model: ser.encode_model(model)?,
                attr: attr.clone(),
                new: ser.encode_value(new)?,
                setter_id,
            },
            DocumentChangedEvent::TitleChanged { title, .. } => PatchEvent::TitleChanged {
                title: title.clone(),
                setter_id,
            },
            DocumentChangedEvent::RootAdded { model, .. } => PatchEvent::RootAdded {
                model: ser.encode_model(model)?,
                setter_id,
            },
            DocumentChangedEvent::RootRemoved { model, .. } => PatchEvent::RootRemoved {
                model: model.to_ref(),
                setter_id,
            },
            DocumentChangedEvent::ColumnDataChanged { model, attr, cols, data, .. } => {
                PatchEvent::ColumnDataChanged {
                    column_source: ser.encode_model(model)?,
                    attr: attr.clone(),
                    cols: cols.clone(),
                    data: ser.encode_value(&Value::Map(data.clone()))?,
                    setter_id,
                }
            }
            DocumentChangedEvent::ColumnsStreamed { model, attr, data, rollover, .. } => {
                PatchEvent::ColumnsStreamed {
                    column_source: ser.encode_model(model)?,
                    attr: attr.clone(),
                    data: ser.encode_value(&Value::Map(data.clone()))?,
                    rollover: *rollover,
                    setter_id,
                }
            }
            DocumentChangedEvent::ColumnsPatched { model, attr, patches, .. } => {
                let mut encoded = Map::new();
                for (column, edits) in patches {
                    let mut pairs = Vec::with_capacity(edits.len());
                    for (index, value) in edits {
                        pairs.push(JsonValue::Array(vec![
                            serde_json::to_value(index)?,
                            ser.encode_value(value)?,
                        ]));
                    }
                    encoded.insert(column.clone(), JsonValue::Array(pairs));
                }
                PatchEvent::ColumnsPatched {
                    column_source: ser.encode_model(model)?,
                    attr: attr.clone(),
                    patches: JsonValue::Object(encoded),
                    setter_id,
                }
            }
        }))
    }

    /// Minimal patch that takes `prior` to the current state.
    pub fn compute_patch_since(&self, prior: &DocumentJson) -> Result<Patch> {
        let options = SerializeOptions {
            include_defaults: true,
            ..SerializeOptions::default()
        };
        let (current, _) = self.to_json_with(options)?;
        Ok(compute_patch_between(&self.0.registry, prior, &current))
    }

    /// Apply an inbound patch, tagging every mutation with `setter_id`.
    ///
    /// References are resolved first and an unresolved one fails the call
    /// before anything changes. After that, an event that cannot be applied
    /// is skipped and reported in the outcome while the rest still apply.
    pub fn apply_patch(&self, patch: &Patch, buffers: &[Buffer], setter_id: Option<&SetterId>) -> Result<PatchOutcome> {
        let mut deserializer = Deserializer::new(&self.0.registry, buffers).with_existing(self.all_models());
        let pending = deserializer.decode_references(&patch.references)?;

        let mut outcome = PatchOutcome::default();
        for skipped in deserializer.skipped() {
            outcome.skipped.push(SkippedEvent {
                index: None,
                error: SyncError::MalformedBuffer(skipped.error.clone()),
            });
        }

        let mut ops = Vec::with_capacity(patch.events.len());
        for (index, event) in patch.events.iter().enumerate() {
            match resolve_event(&deserializer, event) {
                Ok(op) => ops.push((index, op)),
                Err(e @ SyncError::UnresolvedReference(_)) => return Err(e),
                Err(error) => {
                    log::warn!("skipping patch event {index}: {error}");
                    outcome.skipped.push(SkippedEvent {
                        index: Some(index),
                        error,
                    });
                }
            }
        }

        let created: HashSet<ModelId> = deserializer
            .created()
            .iter()
            .map(|m| m.id().clone())
            .collect();
        let tagged = SetOptions::setter(setter_id.cloned());
        let guard = self.freeze_guard();

        for (model, attrs) in pending {
            let options = if created.contains(model.id()) {
                SetOptions::silent().force()
            } else {
                tagged.clone()
            };
            if let Err(error) = model.set_attrs(attrs, &options) {
                log::warn!("skipping attributes of {} {}: {error}", model.type_name(), model.id());
                outcome.skipped.push(SkippedEvent { index: None, error });
            }
        }
        for model in deserializer.created() {
            model.initialize();
        }

        for (index, op) in ops {
            match self.apply_op(op, setter_id) {
                Ok(()) => outcome.applied += 1,
                Err(error) => {
                    log::warn!("skipping patch event {index}: {error}");
                    outcome.skipped.push(SkippedEvent {
                        index: Some(index),
                        error,
                    });
                }
            }
        }
        drop(guard);

        // The peer sent these, so they are not new to it.
        let mut state = self.0.state.borrow_mut();
        for id in &created {
            state.new_models.remove(id);
        }
        Ok(outcome)
    }

    fn apply_op(&self, op: Op, setter_id: Option<&SetterId>) -> Result<()> {
        match op {
            Op::Set { model, attr, value } => model
                .set_attrs([(attr, value)], &SetOptions::setter(setter_id.cloned()))
                .map(|_| ()),
            Op::Title(title) => {
                self.set_title(&title, setter_id);
                Ok(())
            }
            Op::AddRoot(model) => self.add_root(&model, setter_id),
            Op::RemoveRoot(model) => {
                self.remove_root(&model, setter_id);
                Ok(())
            }
            Op::Replace { model, attr, data, cols } => model.replace_columns(&attr, data, cols, setter_id),
            Op::Stream { model, attr, data, rollover } => model.stream(&attr, data, rollover, setter_id),
            Op::Patch { model, attr, patches } => model.patch_columns(&attr, patches, setter_id),
        }
    }
}

fn resolve_event(de: &Deserializer<'_>, event: &PatchEvent) -> Result<Op> {
    Ok(match event {
        PatchEvent::ModelChanged { model, attr, new, .. } => Op::Set {
            model: de.resolve(&model.id)?,
            attr: attr.clone(),
            value: de.decode_value(new)?,
        },
        PatchEvent::TitleChanged { title, .. } => Op::Title(title.clone()),
        PatchEvent::RootAdded { model, .. } => Op::AddRoot(de.resolve(&model.id)?),
        PatchEvent::RootRemoved { model, .. } => Op::RemoveRoot(de.resolve(&model.id)?),
        PatchEvent::ColumnDataChanged {
            column_source,
            attr,
            cols,
            data,
            ..
        } => Op::Replace {
            model: de.resolve(&column_source.id)?,
            attr: attr.clone(),
            data: decode_table(de, column_source, attr, data)?,
            cols: cols.clone(),
        },
        PatchEvent::ColumnsStreamed {
            column_source,
            attr,
            data,
            rollover,
            ..
        } => Op::Stream {
            model: de.resolve(&column_source.id)?,
            attr: attr.clone(),
            data: decode_table(de, column_source, attr, data)?,
            rollover: *rollover,
        },
        PatchEvent::ColumnsPatched {
            column_source,
            attr,
            patches,
            ..
        } => Op::Patch {
            model: de.resolve(&column_source.id)?,
            attr: attr.clone(),
            patches: decode_patches(de, column_source, attr, patches)?,
        },
    })
}

fn decode_table(de: &Deserializer<'_>, source: &Ref, attr: &str, raw: &JsonValue) -> Result<IndexMap<String, Value>> {
    match de.decode_value(raw)? {
        Value::Map(table) => Ok(table),
        other => Err(SyncError::validation(
            &source.type_name,
            attr,
            format!("column data must be a map, got {}", other.kind_name()),
        )),
    }
}

fn decode_patches(de: &Deserializer<'_>, source: &Ref, attr: &str, raw: &JsonValue) -> Result<ColumnPatches> {
    let malformed = |reason: String| SyncError::validation(&source.type_name, attr, reason);
    let columns = raw
        .as_object()
        .ok_or_else(|| malformed("patches must be an object".to_string()))?;

    let mut patches = ColumnPatches::new();
    for (column, pairs) in columns {
        let pairs = pairs
            .as_array()
            .ok_or_else(|| malformed(format!("patches for '{column}' must be a list")))?;
        let mut edits = Vec::with_capacity(pairs.len());
        for pair in pairs {
            let (index, value) = match pair.as_array().map(Vec::as_slice) {
                Some([index, value]) => (index, value),
                _ => return Err(malformed(format!("patch for '{column}' is not an [index, value] pair"))),
            };
            let index: PatchIndex = serde_json::from_value(index.clone())
                .map_err(|e| malformed(format!("bad patch index for '{column}': {e}")))?;
            edits.push((index, de.decode_value(value)?));
        }
        patches.insert(column.clone(), edits);
    }
    Ok(patches)
}

/// Diff two snapshots of a document.
///
/// Attributes are compared as JSON, so models compare by id. An attribute
/// missing from one side is compared against its property default. Models
/// that exist only in `to` are sent in full.
pub fn compute_patch_between(registry: &ModelRegistry, from: &DocumentJson, to: &DocumentJson) -> Patch {
    let before: IndexMap<&ModelId, &ModelRep> = from
        .roots
        .references
        .iter()
        .map(|rep| (&rep.header.id, rep))
        .collect();
    let after: IndexMap<&ModelId, &ModelRep> = to
        .roots
        .references
        .iter()
        .map(|rep| (&rep.header.id, rep))
        .collect();

    let mut events = Vec::new();
    for id in &from.roots.root_ids {
        if !to.roots.root_ids.contains(id) {
            if let Some(rep) = before.get(id) {
                events.push(PatchEvent::RootRemoved {
                    model: rep.header.clone(),
                    setter_id: None,
                });
            }
        }
    }
    for id in &to.roots.root_ids {
        if !from.roots.root_ids.contains(id) {
            if let Some(rep) = after.get(id) {
                events.push(PatchEvent::RootAdded {
                    model: rep.header.clone(),
                    setter_id: None,
                });
            }
        }
    }

    let mut references = Vec::new();
    for (id, rep) in &after {
        let Some(old) = before.get(id) else {
            references.push((*rep).clone());
            continue;
        };
        let attrs: Vec<&String> = rep
            .attributes
            .keys()
            .chain(old.attributes.keys().filter(|k| !rep.attributes.contains_key(*k)))
            .collect();
        for attr in attrs {
            let new = rep
                .attributes
                .get(attr)
                .cloned()
                .unwrap_or_else(|| encoded_default(registry, &rep.header, attr));
            let prev = old
                .attributes
                .get(attr)
                .cloned()
                .unwrap_or_else(|| encoded_default(registry, &old.header, attr));
            if new != prev {
                events.push(PatchEvent::ModelChanged {
                    model: rep.header.clone(),
                    attr: attr.clone(),
                    new,
                    setter_id: None,
                });
            }
        }
    }

    if from.title != to.title {
        events.push(PatchEvent::TitleChanged {
            title: to.title.clone(),
            setter_id: None,
        });
    }
    Patch { references, events }
}

fn encoded_default(registry: &ModelRegistry, header: &Ref, attr: &str) -> JsonValue {
    let Some(prop) = registry
        .lookup(&header.type_name, header.subtype.as_deref())
        .ok()
        .and_then(|def| def.property(attr).cloned())
    else {
        return JsonValue::Null;
    };
    Serializer::new(SerializeOptions::default())
        .encode_value(&prop.default.produce())
        .unwrap_or(JsonValue::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::PropertyKind;
    use crate::refs::ArrayEncoding;
    use crate::registry::{ModelDef, ModelRegistry};
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn registry() -> Rc<ModelRegistry> {
        let mut registry = ModelRegistry::with_builtins();
        registry.register(
            ModelDef::builder("Point")
                .property("x", PropertyKind::Float, 0.0)
                .property("label", PropertyKind::nullable(PropertyKind::instance("Point")), Value::Null)
                .build(),
        );
        Rc::new(registry)
    }

    fn document_with_point(id: &str) -> (Document, Model) {
        let registry = registry();
        let doc = Document::with_registry(registry.clone());
        let point = Model::with_id(registry.lookup("Point", None).unwrap(), id.into());
        doc.add_root(&point, None).unwrap();
        (doc, point)
    }

    fn record(doc: &Document) -> Rc<RefCell<Vec<DocumentChangedEvent>>> {
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        doc.on_change(move |e| sink.borrow_mut().push(e.clone()));
        events
    }

    #[test]
    fn test_create_patch_sends_new_models_once() {
        let (doc, point) = document_with_point("p1");
        let events = record(&doc);
        let child = Model::new(doc.registry().lookup("Point", None).unwrap());
        point.set("label", &child).unwrap();

        let (patch, buffers) = doc
            .create_patch(&events.borrow(), SerializeOptions::default())
            .unwrap();
        assert!(buffers.is_empty());
        let ids: Vec<_> = patch.references.iter().map(|r| r.header.id.clone()).collect();
        // p1 was attached before any patch was made, so it is new as well.
        assert!(ids.contains(child.id()));

        child.set("x", 3.0).unwrap();
        let last = events.borrow().last().cloned().unwrap();
        let (patch, _) = doc.create_patch(&[last], SerializeOptions::default()).unwrap();
        assert!(patch.references.is_empty());
        assert_eq!(patch.events.len(), 1);
    }

    #[test]
    fn test_compute_patch_since_single_change() {
        let (doc, point) = document_with_point("p1");
        point.set("x", 1).unwrap();
        let before = doc.to_json(false).unwrap();

        point
            .set_attrs([("x", 2)], &SetOptions::default().with_setter("A"))
            .unwrap();
        let patch = doc.compute_patch_since(&before).unwrap();

        assert!(patch.references.is_empty());
        assert_eq!(
            serde_json::to_value(&patch.events).unwrap(),
            json!([{"kind": "ModelChanged", "model": {"id": "p1", "type": "Point"}, "attr": "x", "new": 2}])
        );
    }

    #[test]
    fn test_compute_patch_between_roots_and_title() {
        let registry = registry();
        let from: DocumentJson = serde_json::from_value(json!({
            "version": super::super::VERSION,
            "title": "a",
            "roots": {"root_ids": ["p1"], "references": [{"id": "p1", "type": "Point"}]}
        }))
        .unwrap();
        let to: DocumentJson = serde_json::from_value(json!({
            "version": super::super::VERSION,
            "title": "b",
            "roots": {"root_ids": ["p2"], "references": [{"id": "p2", "type": "Point", "attributes": {"x": 4}}]}
        }))
        .unwrap();
        let patch = compute_patch_between(&registry, &from, &to);
        let kinds: Vec<_> = serde_json::to_value(&patch.events).unwrap()
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["kind"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(kinds, vec!["RootRemoved", "RootAdded", "TitleChanged"]);
        assert_eq!(patch.references.len(), 1);
    }

    #[test]
    fn test_apply_patch_tags_setter_and_freezes() {
        let (doc, point) = document_with_point("p1");
        let events = record(&doc);
        let rebuilds = doc.index_rebuilds();
        let patch: Patch = serde_json::from_value(json!({
            "references": [{"id": "c1", "type": "Point", "attributes": {"x": 7}}],
            "events": [
                {"kind": "ModelChanged", "model": {"id": "p1", "type": "Point"}, "attr": "label", "new": {"id": "c1", "type": "Point"}},
                {"kind": "TitleChanged", "title": "remote"}
            ]
        }))
        .unwrap();

        let outcome = doc.apply_patch(&patch, &[], Some(&"B".into())).unwrap();
        assert!(outcome.is_complete());
        assert_eq!(outcome.applied, 2);
        assert_eq!(doc.index_rebuilds(), rebuilds + 1);
        assert_eq!(doc.title(), "remote");

        let child = doc.get_model_by_id(&"c1".into()).unwrap();
        assert_eq!(point.get("label").unwrap(), Value::Model(child.clone()));
        assert_eq!(child.get("x").unwrap(), Value::Int(7));
        assert!(events
            .borrow()
            .iter()
            .all(|e| e.setter_id().map(SetterId::as_str) == Some("B")));
    }

    #[test]
    fn test_apply_patch_unresolved_changes_nothing() {
        let (doc, point) = document_with_point("p1");
        let patch: Patch = serde_json::from_value(json!({
            "events": [
                {"kind": "ModelChanged", "model": {"id": "p1", "type": "Point"}, "attr": "x", "new": 5},
                {"kind": "ModelChanged", "model": {"id": "ghost", "type": "Point"}, "attr": "x", "new": 1}
            ]
        }))
        .unwrap();
        let err = doc.apply_patch(&patch, &[], None).unwrap_err();
        assert!(matches!(err, SyncError::UnresolvedReference(_)));
        assert_eq!(point.get("x").unwrap(), Value::Float(0.0));
    }

    #[test]
    fn test_apply_patch_skips_bad_event_only() {
        let (doc, point) = document_with_point("p1");
        let patch: Patch = serde_json::from_value(json!({
            "events": [
                {"kind": "ModelChanged", "model": {"id": "p1", "type": "Point"}, "attr": "x", "new": "wide"},
                {"kind": "ModelChanged", "model": {"id": "p1", "type": "Point"}, "attr": "x",
                 "new": {"__buffer__": "nope", "dtype": "float64", "shape": [1]}},
                {"kind": "TitleChanged", "title": "still applied"}
            ]
        }))
        .unwrap();
        let outcome = doc.apply_patch(&patch, &[], None).unwrap();
        assert_eq!(outcome.applied, 1);
        let skipped: Vec<_> = outcome.skipped.iter().map(|s| s.index).collect();
        assert_eq!(skipped, vec![Some(1), Some(0)]);
        assert!(matches!(outcome.skipped[0].error, SyncError::MalformedBuffer(_)));
        assert!(matches!(outcome.skipped[1].error, SyncError::Validation { .. }));
        assert_eq!(point.get("x").unwrap(), Value::Float(0.0));
        assert_eq!(doc.title(), "still applied");
    }

    #[test]
    fn test_model_changed_is_idempotent() {
        let (doc, point) = document_with_point("p1");
        let patch: Patch = serde_json::from_value(json!({
            "events": [{"kind": "ModelChanged", "model": {"id": "p1", "type": "Point"}, "attr": "x", "new": 9}]
        }))
        .unwrap();
        doc.apply_patch(&patch, &[], None).unwrap();
        let once = doc.to_json(true).unwrap();
        doc.apply_patch(&patch, &[], None).unwrap();
        assert_eq!(doc.to_json(true).unwrap(), once);
        assert_eq!(point.get("x").unwrap(), Value::Int(9));
    }

    #[test]
    fn test_column_events_round_trip_through_patch() {
        let registry = registry();
        let local = Document::with_registry(registry.clone());
        let source = registry.create("ColumnDataSource", [("name", "src")]).unwrap();
        source
            .set("data", Value::map([("x", Value::from(vec![1, 2]))]))
            .unwrap();
        local.add_root(&source, None).unwrap();

        let remote = Document::from_json(registry, &local.to_json(false).unwrap(), &[]).unwrap();
        local.mark_synced();
        let events = record(&local);

        source
            .stream("data", IndexMap::from([("x".to_string(), Value::from(vec![3]))]), Some(2), None)
            .unwrap();
        source
            .patch_columns(
                "data",
                IndexMap::from([("x".to_string(), vec![(PatchIndex::Index(0), Value::Int(20))])]),
                None,
            )
            .unwrap();

        let options = SerializeOptions {
            arrays: ArrayEncoding::Binary,
            ..SerializeOptions::default()
        };
        let (patch, buffers) = local.create_patch(&events.borrow(), options).unwrap();
        assert!(patch.references.is_empty());
        let kinds: Vec<_> = events.borrow().iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["ColumnsStreamed", "ColumnsPatched"]);

        let outcome = remote.apply_patch(&patch, &buffers, None).unwrap();
        assert!(outcome.is_complete());
        let copy = remote.get_model_by_id(source.id()).unwrap();
        assert_eq!(copy.get("data").unwrap(), source.get("data").unwrap());
    }
}
