//! The document: roots, derived indexes, listeners and whole-graph JSON.
//!
//! The id and name indexes are derived from the roots and rebuilt whenever the
//! reachable graph may have changed. Structural edits can be batched with
//! [`Document::freeze`] so the index is rebuilt once when the outermost
//! freeze ends.

mod events;
mod patch;

pub use events::{DocumentChangedEvent, Patch, PatchEvent, PatchOutcome, SkippedEvent};
pub use patch::compute_patch_between;

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::codec::Buffer;
use crate::columnar::ColumnHint;
use crate::error::{Result, SyncError};
use crate::model::{AttrChange, Model, ModelId, SetOptions, SetterId};
use crate::refs::{collect_references, ArrayEncoding, Deserializer, ModelRep, SerializeOptions, Serializer};
use crate::registry::ModelRegistry;
use crate::signal::SubscriptionId;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DEFAULT_TITLE: &str = "Untitled";

/// Whole-document JSON form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentJson {
    pub version: String,
    #[serde(default)]
    pub title: String,
    pub roots: RootsJson,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootsJson {
    pub root_ids: Vec<ModelId>,
    #[serde(default)]
    pub references: Vec<ModelRep>,
}

type Listener = Rc<dyn Fn(&DocumentChangedEvent)>;

struct DocState {
    title: String,
    roots: Vec<Model>,
    all_models: IndexMap<ModelId, Model>,
    by_name: HashMap<String, Vec<Model>>,
    /// Attached since the last patch; sent in full by `create_patch`.
    new_models: HashSet<ModelId>,
    /// Attached ahead of the index while frozen.
    adopted: Vec<Model>,
    freeze_count: usize,
    rebuilds: usize,
}

pub(crate) struct DocumentInner {
    registry: Rc<ModelRegistry>,
    state: RefCell<DocState>,
    listeners: RefCell<Vec<(SubscriptionId, Listener)>>,
}

#[derive(Clone)]
pub struct Document(Rc<DocumentInner>);

impl Document {
    /// An empty document over the built-in types.
    pub fn new() -> Self {
        Self::with_registry(Rc::new(ModelRegistry::with_builtins()))
    }

    pub fn with_registry(registry: Rc<ModelRegistry>) -> Self {
        Self(Rc::new(DocumentInner {
            registry,
            state: RefCell::new(DocState {
                title: DEFAULT_TITLE.to_string(),
                roots: Vec::new(),
                all_models: IndexMap::new(),
                by_name: HashMap::new(),
                new_models: HashSet::new(),
                adopted: Vec::new(),
                freeze_count: 0,
                rebuilds: 0,
            }),
            listeners: RefCell::new(Vec::new()),
        }))
    }

    pub(crate) fn from_inner(inner: Rc<DocumentInner>) -> Self {
        Self(inner)
    }

    pub fn registry(&self) -> &Rc<ModelRegistry> {
        &self.0.registry
    }

    // -----------------------------------------------------------------
    // Roots and title
    // -----------------------------------------------------------------

    /// Add a root. Adding a model that is already a root does nothing.
    pub fn add_root(&self, model: &Model, setter_id: Option<&SetterId>) -> Result<()> {
        if self.0.state.borrow().roots.contains(model) {
            return Ok(());
        }
        if model.is_destroyed() {
            return Err(SyncError::Destroyed(model.id().clone()));
        }
        for reachable in model.references() {
            if reachable.document().is_some_and(|doc| doc != *self) {
                return Err(SyncError::AlreadyAttached(reachable.id().clone()));
            }
        }

        self.0.state.borrow_mut().roots.push(model.clone());
        self.adopt(std::slice::from_ref(model));
        self.invalidate_models();
        self.emit(&DocumentChangedEvent::RootAdded {
            model: model.clone(),
            setter_id: setter_id.cloned(),
        });
        Ok(())
    }

    /// Remove a root; `false` if `model` was not one.
    pub fn remove_root(&self, model: &Model, setter_id: Option<&SetterId>) -> bool {
        {
            let mut state = self.0.state.borrow_mut();
            let Some(pos) = state.roots.iter().position(|r| r == model) else {
                return false;
            };
            state.roots.remove(pos);
        }
        self.invalidate_models();
        self.emit(&DocumentChangedEvent::RootRemoved {
            model: model.clone(),
            setter_id: setter_id.cloned(),
        });
        true
    }

    /// Detach `model` from the roots of whatever document holds it, then add
    /// it here.
    pub fn move_root(&self, model: &Model, setter_id: Option<&SetterId>) -> Result<()> {
        if let Some(current) = model.document() {
            if current != *self {
                current.remove_root(model, setter_id);
            }
        }
        self.add_root(model, setter_id)
    }

    pub fn roots(&self) -> Vec<Model> {
        self.0.state.borrow().roots.clone()
    }

    pub fn title(&self) -> String {
        self.0.state.borrow().title.clone()
    }

    pub fn set_title(&self, title: &str, setter_id: Option<&SetterId>) {
        {
            let mut state = self.0.state.borrow_mut();
            if state.title == title {
                return;
            }
            state.title = title.to_string();
        }
        self.emit(&DocumentChangedEvent::TitleChanged {
            title: title.to_string(),
            setter_id: setter_id.cloned(),
        });
    }

    /// Remove every root.
    pub fn clear(&self) {
        let _guard = self.freeze_guard();
        for root in self.roots() {
            self.remove_root(&root, None);
        }
    }

    /// Remove every root and destroy every model the document held.
    pub fn destroy(&self) {
        let models = {
            let mut state = self.0.state.borrow_mut();
            state.roots.clear();
            state.by_name.clear();
            state.new_models.clear();
            let mut models: Vec<Model> = std::mem::take(&mut state.all_models).into_values().collect();
            for model in std::mem::take(&mut state.adopted) {
                if !models.contains(&model) {
                    models.push(model);
                }
            }
            models
        };
        for model in &models {
            model.detach();
        }
        for model in &models {
            model.destroy();
        }
        self.0.listeners.borrow_mut().clear();
        log::debug!("destroyed document with {} models", models.len());
    }

    // -----------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------

    pub fn get_model_by_id(&self, id: &ModelId) -> Option<Model> {
        self.0.state.borrow().all_models.get(id).cloned()
    }

    pub fn get_models_by_name(&self, name: &str) -> Vec<Model> {
        self.0
            .state
            .borrow()
            .by_name
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// The single model called `name`; fails when several share it.
    pub fn get_model_by_name(&self, name: &str) -> Result<Option<Model>> {
        let mut models = self.get_models_by_name(name);
        match models.len() {
            0 => Ok(None),
            1 => Ok(models.pop()),
            _ => Err(SyncError::AmbiguousName(name.to_string())),
        }
    }

    /// Attached models of `type_name` or a type derived from it.
    pub fn select_by_type(&self, type_name: &str) -> Vec<Model> {
        self.0
            .state
            .borrow()
            .all_models
            .values()
            .filter(|m| m.def().is_a(type_name))
            .cloned()
            .collect()
    }

    pub fn all_models(&self) -> Vec<Model> {
        self.0.state.borrow().all_models.values().cloned().collect()
    }

    /// How many times the index has been rebuilt.
    pub fn index_rebuilds(&self) -> usize {
        self.0.state.borrow().rebuilds
    }

    /// Forget which models were attached since the last patch, for when the
    /// peer has just received the whole document.
    pub fn mark_synced(&self) {
        self.0.state.borrow_mut().new_models.clear();
    }

    // -----------------------------------------------------------------
    // Listeners
    // -----------------------------------------------------------------

    pub fn on_change(&self, callback: impl Fn(&DocumentChangedEvent) + 'static) -> SubscriptionId {
        let id = SubscriptionId::next();
        self.0.listeners.borrow_mut().push((id, Rc::new(callback)));
        id
    }

    pub fn remove_on_change(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.0.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    fn emit(&self, event: &DocumentChangedEvent) {
        let listeners: Vec<Listener> = self
            .0
            .listeners
            .borrow()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    // -----------------------------------------------------------------
    // Index maintenance
    // -----------------------------------------------------------------

    pub fn freeze(&self) {
        self.0.state.borrow_mut().freeze_count += 1;
    }

    /// End one freeze. The outermost call rebuilds the index.
    pub fn unfreeze(&self) {
        let outermost = {
            let mut state = self.0.state.borrow_mut();
            if state.freeze_count == 0 {
                log::warn!("unfreeze called on a document that is not frozen");
                return;
            }
            state.freeze_count -= 1;
            state.freeze_count == 0
        };
        if outermost {
            self.rebuild();
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.0.state.borrow().freeze_count > 0
    }

    /// Freeze until the guard is dropped.
    pub fn freeze_guard(&self) -> FreezeGuard {
        self.freeze();
        FreezeGuard { doc: self.clone() }
    }

    /// Attach `models` and everything they reach that has no document yet.
    /// Ownership is immediate; only the index waits for the next rebuild.
    pub(crate) fn adopt(&self, models: &[Model]) {
        let reached = collect_references(models);
        let mut state = self.0.state.borrow_mut();
        for model in reached {
            if model.document().is_none() {
                model.attach(&self.0);
                state.new_models.insert(model.id().clone());
                state.adopted.push(model);
            }
        }
    }

    pub(crate) fn invalidate_models(&self) {
        if !self.is_frozen() {
            self.rebuild();
        }
    }

    fn rebuild(&self) {
        let roots = self.roots();
        let reachable = collect_references(&roots);
        let names: Vec<Option<String>> = reachable
            .iter()
            .map(|m| m.get("name").ok().and_then(|v| v.as_str().map(str::to_string)))
            .collect();

        let mut all_models = IndexMap::with_capacity(reachable.len());
        let mut by_name: HashMap<String, Vec<Model>> = HashMap::new();
        for (model, name) in reachable.into_iter().zip(names) {
            if let Some(name) = name {
                by_name.entry(name).or_default().push(model.clone());
            }
            all_models.insert(model.id().clone(), model);
        }

        let mut guard = self.0.state.borrow_mut();
        let state = &mut *guard;
        let adopted = std::mem::take(&mut state.adopted);
        for model in state.all_models.values().chain(&adopted) {
            if all_models.get(model.id()) != Some(model) {
                // It may already belong to another document after a move.
                if model.is_attached_to(&self.0) {
                    model.detach();
                }
                state.new_models.remove(model.id());
            }
        }
        for (id, model) in &all_models {
            if !model.is_attached_to(&self.0) {
                model.attach(&self.0);
                state.new_models.insert(id.clone());
            }
        }
        state.all_models = all_models;
        state.by_name = by_name;
        state.rebuilds += 1;
        log::debug!("rebuilt document index: {} models", state.all_models.len());
    }

    /// Called before a model's change callbacks run.
    pub(crate) fn reindex_for(&self, changes: &[AttrChange]) {
        let mut structural = false;
        for change in changes {
            if change.new.contains_models() {
                self.adopt(&change.new.models());
                structural = true;
            } else if change.attr == "name" || change.old.contains_models() {
                structural = true;
            }
        }
        if structural {
            self.invalidate_models();
        }
    }

    pub(crate) fn notify_model_changed(&self, model: &Model, changes: &[AttrChange], setter_id: Option<&SetterId>) {
        for change in changes {
            let setter_id = setter_id.cloned();
            let model = model.clone();
            let attr = change.attr.clone();
            let event = match &change.hint {
                None => DocumentChangedEvent::ModelChanged {
                    model,
                    attr,
                    old: change.old.clone(),
                    new: change.new.clone(),
                    setter_id,
                },
                Some(ColumnHint::Replaced { cols }) => DocumentChangedEvent::ColumnDataChanged {
                    model,
                    attr,
                    cols: cols.clone(),
                    data: change.new.as_map().cloned().unwrap_or_default(),
                    setter_id,
                },
                Some(ColumnHint::Streamed { data, rollover }) => DocumentChangedEvent::ColumnsStreamed {
                    model,
                    attr,
                    data: data.clone(),
                    rollover: *rollover,
                    setter_id,
                },
                Some(ColumnHint::Patched { patches }) => DocumentChangedEvent::ColumnsPatched {
                    model,
                    attr,
                    patches: patches.clone(),
                    setter_id,
                },
            };
            self.emit(&event);
        }
    }

    // -----------------------------------------------------------------
    // Whole-document JSON
    // -----------------------------------------------------------------

    /// Serialize with inline arrays.
    pub fn to_json(&self, include_defaults: bool) -> Result<DocumentJson> {
        let options = SerializeOptions {
            include_defaults,
            arrays: ArrayEncoding::Base64,
            ..SerializeOptions::default()
        };
        self.to_json_with(options).map(|(json, _)| json)
    }

    pub fn to_json_with(&self, options: SerializeOptions) -> Result<(DocumentJson, Vec<Buffer>)> {
        let roots = self.roots();
        let mut serializer = Serializer::new(options);
        for root in &roots {
            serializer.encode_model(root)?;
        }
        let (references, buffers) = serializer.into_parts();
        let json = DocumentJson {
            version: VERSION.to_string(),
            title: self.title(),
            roots: RootsJson {
                root_ids: roots.iter().map(|r| r.id().clone()).collect(),
                references,
            },
        };
        Ok((json, buffers))
    }

    /// Build a new document from its JSON form. Fails without side effects.
    pub fn from_json(registry: Rc<ModelRegistry>, json: &DocumentJson, buffers: &[Buffer]) -> Result<Document> {
        let roots = decode_graph(&registry, json, buffers)?;
        let doc = Document::with_registry(registry);
        doc.install(&json.title, &roots, None)?;
        doc.mark_synced();
        Ok(doc)
    }

    /// Swap this document's contents for the decoded JSON. The JSON is fully
    /// decoded before anything is removed.
    pub fn replace_with_json(&self, json: &DocumentJson, buffers: &[Buffer], setter_id: Option<&SetterId>) -> Result<()> {
        let roots = decode_graph(&self.0.registry, json, buffers)?;
        self.install(&json.title, &roots, setter_id)?;
        self.mark_synced();
        Ok(())
    }

    fn install(&self, title: &str, roots: &[Model], setter_id: Option<&SetterId>) -> Result<()> {
        let _guard = self.freeze_guard();
        for old in self.roots() {
            self.remove_root(&old, setter_id);
        }
        self.set_title(title, setter_id);
        for root in roots {
            self.add_root(root, setter_id)?;
        }
        Ok(())
    }
}

/// Two-phase decode of a document's reference table, then the hooks.
fn decode_graph(registry: &ModelRegistry, json: &DocumentJson, buffers: &[Buffer]) -> Result<Vec<Model>> {
    if json.version != VERSION {
        log::warn!("document version {} differs from library version {VERSION}", json.version);
    }
    let mut deserializer = Deserializer::new(registry, buffers);
    let pending = deserializer.decode_references(&json.roots.references)?;
    let roots = json
        .roots
        .root_ids
        .iter()
        .map(|id| deserializer.resolve(id))
        .collect::<Result<Vec<_>>>()?;
    let options = SetOptions::silent().force();
    for (model, attrs) in pending {
        model.set_attrs(attrs, &options)?;
    }
    for model in deserializer.created() {
        model.initialize();
    }
    Ok(roots)
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Document {}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.state.borrow();
        f.debug_struct("Document")
            .field("title", &state.title)
            .field("roots", &state.roots.len())
            .field("models", &state.all_models.len())
            .finish()
    }
}

/// Keeps a document frozen while alive.
#[must_use = "the document unfreezes as soon as the guard is dropped"]
pub struct FreezeGuard {
    doc: Document,
}

impl Drop for FreezeGuard {
    fn drop(&mut self) {
        self.doc.unfreeze();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::PropertyKind;
    use crate::registry::ModelDef;
    use crate::value::Value;
    use std::cell::RefCell;

    fn registry() -> Rc<ModelRegistry> {
        let mut registry = ModelRegistry::with_builtins();
        let shape = ModelDef::builder("Shape")
            .property("children", PropertyKind::list(PropertyKind::instance("Shape")), Value::List(Vec::new()))
            .build();
        let circle = ModelDef::builder("Circle")
            .extends(&shape)
            .property("radius", PropertyKind::Float, 1.0)
            .build();
        registry.register(shape);
        registry.register(circle);
        Rc::new(registry)
    }

    fn shape(doc: &Document, kind: &str, name: Option<&str>) -> Model {
        doc.registry()
            .create(kind, [("name", Value::from(name))])
            .unwrap()
    }

    #[test]
    fn test_add_root_indexes_reachable_models() {
        let doc = Document::with_registry(registry());
        let parent = shape(&doc, "Shape", Some("parent"));
        let child = shape(&doc, "Circle", Some("child"));
        parent.set("children", vec![&child]).unwrap();

        doc.add_root(&parent, None).unwrap();
        assert_eq!(doc.all_models().len(), 2);
        assert_eq!(child.document(), Some(doc.clone()));
        assert_eq!(doc.get_model_by_id(child.id()), Some(child.clone()));
        assert_eq!(doc.get_model_by_name("child").unwrap(), Some(child));
    }

    #[test]
    fn test_add_existing_root_is_noop() {
        let doc = Document::with_registry(registry());
        let root = shape(&doc, "Shape", None);
        let events = Rc::new(RefCell::new(0));
        let e = events.clone();
        doc.on_change(move |_| *e.borrow_mut() += 1);
        doc.add_root(&root, None).unwrap();
        doc.add_root(&root, None).unwrap();
        assert_eq!(doc.roots().len(), 1);
        assert_eq!(*events.borrow(), 1);
    }

    #[test]
    fn test_remove_root_detaches() {
        let doc = Document::with_registry(registry());
        let root = shape(&doc, "Shape", None);
        doc.add_root(&root, None).unwrap();
        assert!(doc.remove_root(&root, None));
        assert!(!doc.remove_root(&root, None));
        assert!(root.document().is_none());
        assert!(doc.all_models().is_empty());
    }

    #[test]
    fn test_root_of_other_document_is_rejected() {
        let registry = registry();
        let a = Document::with_registry(registry.clone());
        let b = Document::with_registry(registry);
        let root = shape(&a, "Shape", None);
        a.add_root(&root, None).unwrap();
        assert!(matches!(b.add_root(&root, None), Err(SyncError::AlreadyAttached(_))));

        b.move_root(&root, None).unwrap();
        assert!(a.roots().is_empty());
        assert_eq!(root.document(), Some(b));
    }

    #[test]
    fn test_embedding_foreign_model_is_rejected() {
        let registry = registry();
        let a = Document::with_registry(registry.clone());
        let b = Document::with_registry(registry);
        let in_a = shape(&a, "Shape", None);
        let in_b = shape(&b, "Shape", None);
        a.add_root(&in_a, None).unwrap();
        b.add_root(&in_b, None).unwrap();
        let err = in_a.set("children", vec![&in_b]).unwrap_err();
        assert!(matches!(err, SyncError::AlreadyAttached(_)));
    }

    #[test]
    fn test_frozen_add_root_claims_model() {
        let registry = registry();
        let a = Document::with_registry(registry.clone());
        let b = Document::with_registry(registry);
        let root = shape(&a, "Shape", None);
        let child = shape(&a, "Circle", None);
        root.set("children", vec![&child]).unwrap();
        {
            let _frozen = a.freeze_guard();
            a.add_root(&root, None).unwrap();
            assert_eq!(child.document(), Some(a.clone()));
            assert!(matches!(b.add_root(&root, None), Err(SyncError::AlreadyAttached(_))));
            assert!(matches!(b.add_root(&child, None), Err(SyncError::AlreadyAttached(_))));
        }
        assert!(b.roots().is_empty());
        assert_eq!(a.all_models().len(), 2);
        assert_eq!(root.document(), Some(a));
    }

    #[test]
    fn test_frozen_edits_are_reported() {
        let doc = Document::with_registry(registry());
        let kinds = Rc::new(RefCell::new(Vec::new()));
        let sink = kinds.clone();
        doc.on_change(move |e| sink.borrow_mut().push(e.kind()));
        let root = shape(&doc, "Shape", None);
        let child = shape(&doc, "Circle", None);
        {
            let _frozen = doc.freeze_guard();
            doc.add_root(&root, None).unwrap();
            root.set("children", vec![&child]).unwrap();
            child.set("radius", 3.0).unwrap();
        }
        assert_eq!(*kinds.borrow(), vec!["RootAdded", "ModelChanged", "ModelChanged"]);
        assert_eq!(doc.get_model_by_id(child.id()), Some(child));
    }

    #[test]
    fn test_frozen_embed_then_drop_detaches() {
        let doc = Document::with_registry(registry());
        let root = shape(&doc, "Shape", None);
        let child = shape(&doc, "Circle", None);
        doc.add_root(&root, None).unwrap();
        {
            let _frozen = doc.freeze_guard();
            root.set("children", vec![&child]).unwrap();
            assert_eq!(child.document(), Some(doc.clone()));
            root.set("children", Value::List(Vec::new())).unwrap();
        }
        assert!(child.document().is_none());
        assert_eq!(doc.all_models().len(), 1);
    }

    #[test]
    fn test_ambiguous_name() {
        let doc = Document::with_registry(registry());
        let root = shape(&doc, "Shape", Some("dup"));
        let other = shape(&doc, "Shape", Some("dup"));
        doc.add_root(&root, None).unwrap();
        doc.add_root(&other, None).unwrap();
        assert_eq!(doc.get_models_by_name("dup").len(), 2);
        assert!(matches!(doc.get_model_by_name("dup"), Err(SyncError::AmbiguousName(_))));
    }

    #[test]
    fn test_renaming_updates_name_index() {
        let doc = Document::with_registry(registry());
        let root = shape(&doc, "Shape", Some("before"));
        doc.add_root(&root, None).unwrap();
        root.set("name", "after").unwrap();
        assert!(doc.get_models_by_name("before").is_empty());
        assert_eq!(doc.get_models_by_name("after"), vec![root]);
    }

    #[test]
    fn test_select_by_type_includes_subtypes() {
        let doc = Document::with_registry(registry());
        let root = shape(&doc, "Shape", None);
        let circle = shape(&doc, "Circle", None);
        root.set("children", vec![&circle]).unwrap();
        doc.add_root(&root, None).unwrap();
        assert_eq!(doc.select_by_type("Shape").len(), 2);
        assert_eq!(doc.select_by_type("Circle"), vec![circle]);
    }

    #[test]
    fn test_nested_freeze_rebuilds_once() {
        let doc = Document::with_registry(registry());
        let before = doc.index_rebuilds();
        {
            let _outer = doc.freeze_guard();
            {
                let _inner = doc.freeze_guard();
                for _ in 0..5 {
                    doc.add_root(&shape(&doc, "Shape", None), None).unwrap();
                }
            }
            assert_eq!(doc.index_rebuilds(), before);
            assert!(doc.is_frozen());
        }
        assert_eq!(doc.index_rebuilds(), before + 1);
        assert_eq!(doc.all_models().len(), 5);
    }

    #[test]
    fn test_title_change_event() {
        let doc = Document::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        doc.on_change(move |e| s.borrow_mut().push(e.kind()));
        doc.set_title("Sales", Some(&"A".into()));
        doc.set_title("Sales", None);
        assert_eq!(*seen.borrow(), vec!["TitleChanged"]);
    }

    #[test]
    fn test_remove_on_change() {
        let doc = Document::new();
        let id = doc.on_change(|_| {});
        assert!(doc.remove_on_change(id));
        assert!(!doc.remove_on_change(id));
    }

    #[test]
    fn test_destroy_clears_everything() {
        let doc = Document::with_registry(registry());
        let root = shape(&doc, "Shape", None);
        doc.add_root(&root, None).unwrap();
        doc.destroy();
        assert!(doc.roots().is_empty());
        assert!(root.is_destroyed());
        assert!(root.document().is_none());
    }

    #[test]
    fn test_json_round_trip() {
        let registry = registry();
        let doc = Document::with_registry(registry.clone());
        let root = shape(&doc, "Shape", Some("root"));
        let circle = shape(&doc, "Circle", None);
        circle.set("radius", 2.5).unwrap();
        root.set("children", vec![&circle]).unwrap();
        doc.add_root(&root, None).unwrap();
        doc.set_title("Chart", None);

        let json = doc.to_json(false).unwrap();
        let text = serde_json::to_string(&json).unwrap();
        let parsed: DocumentJson = serde_json::from_str(&text).unwrap();
        let copy = Document::from_json(registry, &parsed, &[]).unwrap();

        assert_eq!(copy.title(), "Chart");
        let copied_circle = copy.get_model_by_id(circle.id()).unwrap();
        assert_eq!(copied_circle.get("radius").unwrap(), Value::Float(2.5));
        assert_ne!(copied_circle, circle);
        assert_eq!(copy.to_json(false).unwrap(), json);
    }

    #[test]
    fn test_from_json_failure_builds_nothing() {
        let json: DocumentJson = serde_json::from_value(serde_json::json!({
            "version": VERSION,
            "title": "t",
            "roots": {
                "root_ids": ["a"],
                "references": [{"id": "a", "type": "Shape", "attributes": {"children": [{"id": "gone", "type": "Shape"}]}}]
            }
        }))
        .unwrap();
        let err = Document::from_json(registry(), &json, &[]).unwrap_err();
        assert!(matches!(err, SyncError::UnresolvedReference(_)));
    }

    #[test]
    fn test_replace_with_json_swaps_contents() {
        let registry = registry();
        let source = Document::with_registry(registry.clone());
        source.add_root(&shape(&source, "Circle", Some("new")), None).unwrap();
        let json = source.to_json(false).unwrap();

        let target = Document::with_registry(registry);
        let old = shape(&target, "Shape", Some("old"));
        target.add_root(&old, None).unwrap();
        target.replace_with_json(&json, &[], None).unwrap();

        assert!(old.document().is_none());
        assert_eq!(target.roots().len(), 1);
        assert!(target.get_model_by_name("new").unwrap().is_some());
    }
}
