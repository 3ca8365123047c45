//! Model instances: identity, attributes and change notification.
//!
//! A [`Model`] is a cheap handle. Clones share the same instance and compare
//! equal only to each other; two instances never compare equal, even with the
//! same id and attributes.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::columnar::ColumnHint;
use crate::document::{Document, DocumentInner};
use crate::error::{Result, SyncError};
use crate::property::PropertyDef;
use crate::refs::{collect_references, Ref};
use crate::registry::ModelDef;
use crate::signal::{Signaller, SubscriptionId};
use crate::value::Value;

/// Process-unique model identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(String);

impl ModelId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ModelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ModelId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Tags the origin of a mutation so the originator can recognize its own
/// changes when they come back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SetterId(String);

impl SetterId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SetterId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SetterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SetterId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SetterId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone)]
pub struct SetOptions {
    /// Suppress change signals and document events.
    pub silent: bool,
    /// Swallow writes equal to the current value.
    pub check_eq: bool,
    pub setter_id: Option<SetterId>,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            silent: false,
            check_eq: true,
            setter_id: None,
        }
    }
}

impl SetOptions {
    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::default()
        }
    }

    pub fn setter(setter_id: Option<SetterId>) -> Self {
        Self {
            setter_id,
            ..Self::default()
        }
    }

    pub fn with_setter(mut self, setter_id: impl Into<SetterId>) -> Self {
        self.setter_id = Some(setter_id.into());
        self
    }

    /// Emit even when the new value equals the old one.
    pub fn force(mut self) -> Self {
        self.check_eq = false;
        self
    }
}

/// One attribute transition.
#[derive(Debug, Clone)]
pub struct AttrChange {
    pub attr: String,
    pub old: Value,
    pub new: Value,
    /// Set by columnar operations so the document can report the narrower
    /// event instead of a whole-value replacement.
    pub hint: Option<ColumnHint>,
}

/// Payload delivered to change callbacks.
#[derive(Debug, Clone, Copy)]
pub struct ChangeNotice<'a> {
    pub model: &'a Model,
    pub changes: &'a [AttrChange],
    pub setter_id: Option<&'a SetterId>,
}

#[derive(Default)]
struct ModelState {
    attrs: IndexMap<String, Value>,
    /// Defaults materialized on first read.
    defaults: HashMap<String, Value>,
    destroyed: bool,
}

pub(crate) struct ModelInner {
    id: ModelId,
    def: Rc<ModelDef>,
    state: RefCell<ModelState>,
    document: RefCell<Weak<DocumentInner>>,
    pub(crate) signals: Signaller,
    /// Subscriptions this model holds as a receiver on other models.
    connections: RefCell<Vec<(Weak<ModelInner>, SubscriptionId)>>,
}

#[derive(Clone)]
pub struct Model(Rc<ModelInner>);

impl Model {
    pub fn new(def: Rc<ModelDef>) -> Self {
        Self::with_id(def, ModelId::new())
    }

    pub fn with_id(def: Rc<ModelDef>, id: ModelId) -> Self {
        Self(Rc::new(ModelInner {
            id,
            def,
            state: RefCell::new(ModelState::default()),
            document: RefCell::new(Weak::new()),
            signals: Signaller::default(),
            connections: RefCell::new(Vec::new()),
        }))
    }

    pub fn id(&self) -> &ModelId {
        &self.0.id
    }

    pub fn type_name(&self) -> &str {
        self.0.def.name()
    }

    pub fn subtype(&self) -> Option<&str> {
        self.0.def.subtype()
    }

    pub fn def(&self) -> &Rc<ModelDef> {
        &self.0.def
    }

    pub fn to_ref(&self) -> Ref {
        Ref {
            id: self.id().clone(),
            type_name: self.type_name().to_string(),
            subtype: self.subtype().map(str::to_string),
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.0.state.borrow().destroyed
    }

    /// The document this model is attached to, if any.
    pub fn document(&self) -> Option<Document> {
        self.0.document.borrow().upgrade().map(Document::from_inner)
    }

    pub(crate) fn property(&self, attr: &str) -> Result<&PropertyDef> {
        self.0
            .def
            .property(attr)
            .ok_or_else(|| SyncError::UnknownAttribute {
                type_name: self.type_name().to_string(),
                attr: attr.to_string(),
            })
    }

    /// Current value of `attr`, falling back to its default.
    pub fn get(&self, attr: &str) -> Result<Value> {
        let prop = self.property(attr)?;
        Ok(self.resolve(prop))
    }

    fn resolve(&self, prop: &PropertyDef) -> Value {
        {
            let state = self.0.state.borrow();
            if let Some(value) = state.attrs.get(&prop.name).or_else(|| state.defaults.get(&prop.name)) {
                return value.clone();
            }
        }

        let value = prop.default.produce();
        // A default holding models becomes an explicit value so the models
        // are serialized and indexed like any other reference.
        let promoted = value.contains_models();
        {
            let mut state = self.0.state.borrow_mut();
            if promoted {
                state.attrs.insert(prop.name.clone(), value.clone());
            } else {
                state.defaults.insert(prop.name.clone(), value.clone());
            }
        }
        if promoted {
            if let Some(doc) = self.document() {
                doc.adopt(&value.models());
                doc.invalidate_models();
            }
        }
        value
    }

    /// Fails if `value` reaches a model owned by a document other than ours.
    pub(crate) fn check_attachable(&self, value: &Value) -> Result<()> {
        let Some(doc) = self.document() else {
            return Ok(());
        };
        for model in collect_references(&value.models()) {
            if model.document().is_some_and(|other| other != doc) {
                return Err(SyncError::AlreadyAttached(model.id().clone()));
            }
        }
        Ok(())
    }

    /// Whether `attr` holds an explicitly assigned value.
    pub fn is_set(&self, attr: &str) -> bool {
        self.0.state.borrow().attrs.contains_key(attr)
    }

    pub fn set(&self, attr: &str, value: impl Into<Value>) -> Result<()> {
        self.set_attrs([(attr, value)], &SetOptions::default())
            .map(|_| ())
    }

    /// Validate and assign several attributes at once.
    ///
    /// Every value is validated before any is assigned, so a failure leaves
    /// the model untouched. Returns the changes that were actually applied.
    pub fn set_attrs<K, V>(
        &self,
        attrs: impl IntoIterator<Item = (K, V)>,
        options: &SetOptions,
    ) -> Result<Vec<AttrChange>>
    where
        K: Into<String>,
        V: Into<Value>,
    {
        if self.is_destroyed() {
            return Err(SyncError::Destroyed(self.id().clone()));
        }

        let mut incoming = Vec::new();
        for (attr, value) in attrs {
            let attr = attr.into();
            let prop = self.property(&attr)?;
            let value = value.into();
            prop.kind
                .validate(&value)
                .map_err(|reason| SyncError::validation(self.type_name(), &attr, reason))?;
            incoming.push((attr, prop.kind.transform(value)));
        }

        for (_, value) in &incoming {
            self.check_attachable(value)?;
        }

        let mut changes = Vec::new();
        for (attr, new) in incoming {
            let old = self.get(&attr)?;
            if options.check_eq && old == new {
                continue;
            }
            self.store(&attr, new.clone());
            changes.push(AttrChange {
                attr,
                old,
                new,
                hint: None,
            });
        }

        self.commit(&changes, options.silent, options.setter_id.as_ref());
        Ok(changes)
    }

    /// Serializable properties and their values in declaration order.
    /// Unset properties are included only with `include_defaults`.
    pub fn properties_with_values(&self, include_defaults: bool) -> IndexMap<String, Value> {
        self.0
            .def
            .properties()
            .filter(|p| !p.internal && (include_defaults || self.is_set(&p.name)))
            .map(|p| (p.name.clone(), self.resolve(p)))
            .collect()
    }

    /// Every model reachable from this one, itself included.
    pub fn references(&self) -> Vec<Model> {
        collect_references(std::slice::from_ref(self))
    }

    /// Listen to changes of one attribute, or of all of them with `None`.
    pub fn on_change(
        &self,
        attr: Option<&str>,
        callback: impl Fn(&ChangeNotice<'_>) + 'static,
    ) -> SubscriptionId {
        self.0.signals.connect(attr, None, Rc::new(callback))
    }

    /// Like [`Model::on_change`], on behalf of `receiver`. The subscription
    /// ends when either side is destroyed or the receiver is dropped.
    pub fn connect(
        &self,
        attr: Option<&str>,
        receiver: &Model,
        callback: impl Fn(&ChangeNotice<'_>) + 'static,
    ) -> SubscriptionId {
        let id = self
            .0
            .signals
            .connect(attr, Some(Rc::downgrade(&receiver.0)), Rc::new(callback));
        receiver
            .0
            .connections
            .borrow_mut()
            .push((Rc::downgrade(&self.0), id));
        id
    }

    pub fn disconnect(&self, id: SubscriptionId) -> bool {
        self.0.signals.disconnect(id)
    }

    pub fn subscription_count(&self) -> usize {
        self.0.signals.len()
    }

    /// Tear the instance down: drop every subscription it sends or receives
    /// and release its attribute values.
    pub fn destroy(&self) {
        let connections = std::mem::take(&mut *self.0.connections.borrow_mut());
        for (sender, id) in connections {
            if let Some(sender) = sender.upgrade() {
                sender.signals.disconnect(id);
            }
        }
        self.0.signals.clear();

        let released = {
            let mut state = self.0.state.borrow_mut();
            state.destroyed = true;
            state.defaults.clear();
            std::mem::take(&mut state.attrs)
        };
        log::debug!("destroyed {} {}", self.type_name(), self.id());
        if let Some(doc) = self.document() {
            doc.invalidate_models();
        }
        drop(released);
    }

    /// Identity key for visited sets.
    pub(crate) fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    pub(crate) fn attach(&self, doc: &Rc<DocumentInner>) {
        *self.0.document.borrow_mut() = Rc::downgrade(doc);
    }

    pub(crate) fn detach(&self) {
        *self.0.document.borrow_mut() = Weak::new();
    }

    pub(crate) fn is_attached_to(&self, doc: &Rc<DocumentInner>) -> bool {
        std::ptr::eq(self.0.document.borrow().as_ptr(), Rc::as_ptr(doc))
    }

    /// Models referenced directly by serializable attributes.
    pub(crate) fn child_models(&self) -> Vec<Model> {
        let state = self.0.state.borrow();
        let mut out = Vec::new();
        for (name, value) in &state.attrs {
            if self.0.def.property(name).is_some_and(|p| !p.internal) {
                value.visit_models(&mut |m| out.push(m.clone()));
            }
        }
        out
    }

    pub(crate) fn initialize(&self) {
        if let Some(hook) = self.0.def.initializer().cloned() {
            hook(self);
        }
    }

    /// Write a value that the caller already validated.
    pub(crate) fn store(&self, attr: &str, value: Value) {
        let mut state = self.0.state.borrow_mut();
        state.defaults.remove(attr);
        state.attrs.insert(attr.to_string(), value);
    }

    /// Publish applied changes: reindex the document, run this model's
    /// callbacks, then report to document listeners.
    pub(crate) fn commit(&self, changes: &[AttrChange], silent: bool, setter_id: Option<&SetterId>) {
        if changes.is_empty() {
            return;
        }
        let doc = self.document();
        if let Some(doc) = &doc {
            doc.reindex_for(changes);
        }
        if !silent {
            self.0.signals.emit(&ChangeNotice {
                model: self,
                changes,
                setter_id,
            });
            if let Some(doc) = &doc {
                doc.notify_model_changed(self, changes, setter_id);
            }
        }
    }
}

impl PartialEq for Model {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Model {}

impl Hash for Model {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("type", &self.type_name())
            .field("id", &self.id().as_str())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::PropertyKind;
    use std::cell::{Cell, RefCell};

    fn point_def() -> Rc<ModelDef> {
        ModelDef::builder("Point")
            .property("x", PropertyKind::Float, 0.0)
            .property("y", PropertyKind::Float, 0.0)
            .property("child", PropertyKind::nullable(PropertyKind::instance("Point")), Value::Null)
            .internal("hovered", PropertyKind::Bool, false)
            .build()
    }

    #[test]
    fn test_identity_equality() {
        let def = point_def();
        let a = Model::with_id(def.clone(), "p".into());
        let b = Model::with_id(def, "p".into());
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn test_default_then_set() {
        let p = Model::new(point_def());
        assert_eq!(p.get("x").unwrap(), Value::Float(0.0));
        assert!(!p.is_set("x"));
        p.set("x", 3.0).unwrap();
        assert!(p.is_set("x"));
        assert_eq!(p.get("x").unwrap(), Value::Float(3.0));
    }

    #[test]
    fn test_unknown_attribute() {
        let p = Model::new(point_def());
        let err = p.set("z", 1.0).unwrap_err();
        assert!(matches!(err, SyncError::UnknownAttribute { ref attr, .. } if attr == "z"));
        assert!(p.get("z").is_err());
    }

    #[test]
    fn test_invalid_value_rejects_whole_call() {
        let p = Model::new(point_def());
        let err = p
            .set_attrs(
                [("x", Value::from(1.0)), ("y", Value::from("high"))],
                &SetOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation { ref attr, .. } if attr == "y"));
        assert!(!p.is_set("x"));
    }

    #[test]
    fn test_per_attr_then_blanket_signal() {
        let p = Model::new(point_def());
        let log = Rc::new(RefCell::new(Vec::new()));

        let l = log.clone();
        p.on_change(Some("x"), move |n| {
            l.borrow_mut().push(format!("x:{}", n.changes.len()));
        });
        let l = log.clone();
        p.on_change(None, move |n| {
            l.borrow_mut().push(format!("all:{}", n.changes.len()));
        });

        p.set_attrs([("x", 1.0), ("y", 2.0)], &SetOptions::default())
            .unwrap();
        assert_eq!(*log.borrow(), vec!["x:1", "all:2"]);
    }

    #[test]
    fn test_equal_write_is_swallowed() {
        let p = Model::new(point_def());
        let fired = Rc::new(Cell::new(0));
        let f = fired.clone();
        p.on_change(None, move |_| f.set(f.get() + 1));

        p.set("x", 0.0).unwrap();
        assert_eq!(fired.get(), 0);

        p.set_attrs([("x", 0.0)], &SetOptions::default().force())
            .unwrap();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn test_silent_set_emits_nothing() {
        let p = Model::new(point_def());
        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        p.on_change(None, move |_| f.set(true));
        let changes = p.set_attrs([("x", 5.0)], &SetOptions::silent()).unwrap();
        assert_eq!(changes.len(), 1);
        assert!(!fired.get());
    }

    #[test]
    fn test_setter_id_reaches_callback() {
        let p = Model::new(point_def());
        let seen = Rc::new(RefCell::new(None));
        let s = seen.clone();
        p.on_change(None, move |n| *s.borrow_mut() = n.setter_id.cloned());
        p.set_attrs([("x", 1.0)], &SetOptions::default().with_setter("A"))
            .unwrap();
        assert_eq!(seen.borrow().as_ref().map(SetterId::as_str), Some("A"));
    }

    #[test]
    fn test_callback_may_subscribe_while_emitting() {
        let p = Model::new(point_def());
        let handle = p.clone();
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        p.on_change(None, move |_| {
            let c = c.clone();
            handle.on_change(None, move |_| c.set(c.get() + 1));
        });
        p.set("x", 1.0).unwrap();
        assert_eq!(count.get(), 0);
        p.set("x", 2.0).unwrap();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let sender = Model::new(point_def());
        let receiver = Model::new(point_def());
        sender.connect(None, &receiver, |_| {});
        assert_eq!(sender.subscription_count(), 1);
        drop(receiver);
        sender.set("x", 1.0).unwrap();
        assert_eq!(sender.subscription_count(), 0);
    }

    #[test]
    fn test_destroy_disconnects_both_directions() {
        let a = Model::new(point_def());
        let b = Model::new(point_def());
        a.connect(None, &b, |_| {});
        b.connect(None, &a, |_| {});
        assert_eq!(a.subscription_count(), 1);

        b.destroy();
        assert_eq!(a.subscription_count(), 0);
        assert_eq!(b.subscription_count(), 0);
        assert!(matches!(b.set("x", 1.0), Err(SyncError::Destroyed(_))));
    }

    #[test]
    fn test_destroy_breaks_cycle() {
        let a = Model::new(point_def());
        let b = Model::new(point_def());
        a.set("child", &b).unwrap();
        b.set("child", &a).unwrap();
        let weak = Rc::downgrade(&a.0);
        a.destroy();
        drop(a);
        drop(b);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_lazy_default_is_cached() {
        let calls = Rc::new(Cell::new(0));
        let c = calls.clone();
        let def = ModelDef::builder("Counter")
            .lazy_property("items", PropertyKind::list(PropertyKind::Int), move || {
                c.set(c.get() + 1);
                Value::List(Vec::new())
            })
            .build();
        let m = Model::new(def);
        m.get("items").unwrap();
        m.get("items").unwrap();
        assert_eq!(calls.get(), 1);
        assert!(!m.is_set("items"));
    }

    #[test]
    fn test_lazy_model_default_is_promoted() {
        let inner = point_def();
        let def = ModelDef::builder("Holder")
            .lazy_property("target", PropertyKind::instance("Point"), move || {
                Value::Model(Model::new(inner.clone()))
            })
            .build();
        let holder = Model::new(def);
        let first = holder.get("target").unwrap();
        assert!(holder.is_set("target"));
        assert_eq!(holder.get("target").unwrap(), first);
        assert_eq!(holder.references().len(), 2);
    }

    #[test]
    fn test_internal_properties_are_not_serialized() {
        let p = Model::new(point_def());
        p.set("hovered", true).unwrap();
        p.set("x", 2.0).unwrap();
        let explicit = p.properties_with_values(false);
        assert_eq!(explicit.keys().collect::<Vec<_>>(), vec!["x"]);
        let all = p.properties_with_values(true);
        assert!(all.contains_key("tags"));
        assert!(!all.contains_key("hovered"));
    }

    #[test]
    fn test_instance_kind_checks_type() {
        let other = ModelDef::builder("Label").build();
        let p = Model::new(point_def());
        let label = Model::new(other);
        assert!(p.set("child", &label).is_err());
    }
}
