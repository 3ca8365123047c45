//! Model type definitions and the registry that constructs them by name.
//!
//! A registry is populated once at startup and then shared read-only by every
//! document that resolves type names against it.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::error::{Result, SyncError};
use crate::model::{Model, ModelId, SetOptions};
use crate::property::{DefaultValue, PropertyDef, PropertyKind};
use crate::value::Value;

pub type Initializer = Rc<dyn Fn(&Model)>;

/// The static shape of a model type.
pub struct ModelDef {
    name: String,
    subtype: Option<String>,
    ancestors: Vec<String>,
    properties: IndexMap<String, PropertyDef>,
    initializer: Option<Initializer>,
}

impl ModelDef {
    pub fn builder(name: impl Into<String>) -> ModelDefBuilder {
        ModelDefBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subtype(&self) -> Option<&str> {
        self.subtype.as_deref()
    }

    /// Registry key: the subtype when present, otherwise the type name.
    pub fn key(&self) -> &str {
        self.subtype.as_deref().unwrap_or(&self.name)
    }

    /// True when this type is `type_name` or derives from it.
    pub fn is_a(&self, type_name: &str) -> bool {
        self.name == type_name
            || self.subtype.as_deref() == Some(type_name)
            || self.ancestors.iter().any(|a| a == type_name)
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDef> {
        self.properties.get(name)
    }

    /// All properties, inherited ones first, in declaration order.
    pub fn properties(&self) -> impl Iterator<Item = &PropertyDef> {
        self.properties.values()
    }

    pub(crate) fn initializer(&self) -> Option<&Initializer> {
        self.initializer.as_ref()
    }
}

impl fmt::Debug for ModelDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelDef")
            .field("name", &self.name)
            .field("subtype", &self.subtype)
            .field("ancestors", &self.ancestors)
            .field("properties", &self.properties.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub struct ModelDefBuilder {
    def: ModelDef,
}

impl ModelDefBuilder {
    fn new(name: impl Into<String>) -> Self {
        let mut properties = IndexMap::new();
        for (prop, kind, default) in [
            ("name", PropertyKind::nullable(PropertyKind::String), Value::Null),
            ("tags", PropertyKind::list(PropertyKind::Any), Value::List(Vec::new())),
        ] {
            properties.insert(
                prop.to_string(),
                PropertyDef {
                    name: prop.to_string(),
                    kind,
                    default: DefaultValue::Static(default),
                    internal: false,
                },
            );
        }
        Self {
            def: ModelDef {
                name: name.into(),
                subtype: None,
                ancestors: Vec::new(),
                properties,
                initializer: None,
            },
        }
    }

    pub fn subtype(mut self, subtype: impl Into<String>) -> Self {
        self.def.subtype = Some(subtype.into());
        self
    }

    /// Inherit every property and the initializer of `base`.
    pub fn extends(mut self, base: &ModelDef) -> Self {
        self.def.ancestors = base.ancestors.clone();
        self.def.ancestors.push(base.name.clone());
        for (name, prop) in &base.properties {
            self.def.properties.insert(name.clone(), prop.clone());
        }
        if self.def.initializer.is_none() {
            self.def.initializer = base.initializer.clone();
        }
        self
    }

    pub fn property(self, name: &str, kind: PropertyKind, default: impl Into<Value>) -> Self {
        self.push(name, kind, DefaultValue::Static(default.into()), false)
    }

    /// A property whose default is computed per instance on first read.
    pub fn lazy_property(
        self,
        name: &str,
        kind: PropertyKind,
        default: impl Fn() -> Value + 'static,
    ) -> Self {
        self.push(name, kind, DefaultValue::lazy(default), false)
    }

    /// Local state that is validated like any property but never serialized.
    pub fn internal(self, name: &str, kind: PropertyKind, default: impl Into<Value>) -> Self {
        self.push(name, kind, DefaultValue::Static(default.into()), true)
    }

    /// Hook run once after construction and attribute assignment.
    pub fn on_initialize(mut self, hook: impl Fn(&Model) + 'static) -> Self {
        self.def.initializer = Some(Rc::new(hook));
        self
    }

    fn push(mut self, name: &str, kind: PropertyKind, default: DefaultValue, internal: bool) -> Self {
        self.def.properties.insert(
            name.to_string(),
            PropertyDef {
                name: name.to_string(),
                kind,
                default,
                internal,
            },
        );
        self
    }

    pub fn build(self) -> Rc<ModelDef> {
        Rc::new(self.def)
    }
}

/// Explicit type-constructor table.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    defs: HashMap<String, Rc<ModelDef>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in types.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(column_data_source());
        registry
    }

    /// Register `def` under its key, replacing any previous definition.
    pub fn register(&mut self, def: Rc<ModelDef>) {
        let key = def.key().to_string();
        if self.defs.insert(key.clone(), def).is_some() {
            log::warn!("model type '{key}' registered twice, replacing the earlier definition");
        }
    }

    pub fn unregister(&mut self, key: &str) -> Option<Rc<ModelDef>> {
        self.defs.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.defs.contains_key(key)
    }

    /// Resolve a wire type tag. The subtype wins when it is registered.
    pub fn lookup(&self, type_name: &str, subtype: Option<&str>) -> Result<Rc<ModelDef>> {
        subtype
            .and_then(|s| self.defs.get(s))
            .or_else(|| self.defs.get(type_name))
            .cloned()
            .ok_or_else(|| SyncError::UnknownType(subtype.unwrap_or(type_name).to_string()))
    }

    /// Construct a fully initialized model.
    pub fn create<K, V>(&self, type_name: &str, attrs: impl IntoIterator<Item = (K, V)>) -> Result<Model>
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let model = Model::new(self.lookup(type_name, None)?);
        model.set_attrs(attrs, &SetOptions::silent())?;
        model.initialize();
        Ok(model)
    }

    /// An empty instance with a fixed id, filled in later by the resolver.
    pub(crate) fn shell(&self, type_name: &str, subtype: Option<&str>, id: ModelId) -> Result<Model> {
        Ok(Model::with_id(self.lookup(type_name, subtype)?, id))
    }
}

/// The built-in tabular data source.
pub fn column_data_source() -> Rc<ModelDef> {
    ModelDef::builder("ColumnDataSource")
        .lazy_property("data", PropertyKind::ColumnData, || Value::Map(IndexMap::new()))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn glyph() -> Rc<ModelDef> {
        ModelDef::builder("Glyph")
            .property("visible", PropertyKind::Bool, true)
            .build()
    }

    #[test]
    fn test_base_properties_present() {
        let def = glyph();
        assert!(def.property("name").is_some());
        assert!(def.property("tags").is_some());
        let names: Vec<_> = def.properties().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["name", "tags", "visible"]);
    }

    #[test]
    fn test_extends_inherits() {
        let base = glyph();
        let circle = ModelDef::builder("Circle")
            .extends(&base)
            .property("radius", PropertyKind::Float, 1.0)
            .build();
        assert!(circle.is_a("Glyph"));
        assert!(circle.is_a("Circle"));
        assert!(!circle.is_a("Line"));
        assert!(circle.property("visible").is_some());
    }

    #[test]
    fn test_lookup_prefers_subtype() {
        let mut registry = ModelRegistry::with_builtins();
        let custom = ModelDef::builder("ColumnDataSource")
            .subtype("StreamingSource")
            .extends(&column_data_source())
            .build();
        registry.register(custom);

        let def = registry.lookup("ColumnDataSource", Some("StreamingSource")).unwrap();
        assert_eq!(def.subtype(), Some("StreamingSource"));
        let def = registry.lookup("ColumnDataSource", Some("Unregistered")).unwrap();
        assert_eq!(def.subtype(), None);
    }

    #[test]
    fn test_unknown_type() {
        let registry = ModelRegistry::new();
        let err = registry.lookup("Plot", None).unwrap_err();
        assert!(matches!(err, SyncError::UnknownType(ref t) if t == "Plot"));
    }

    #[test]
    fn test_unregister() {
        let mut registry = ModelRegistry::with_builtins();
        assert!(registry.contains("ColumnDataSource"));
        assert!(registry.unregister("ColumnDataSource").is_some());
        assert!(!registry.contains("ColumnDataSource"));
    }

    #[test]
    fn test_create_runs_initializer_after_attrs() {
        use std::cell::Cell;

        let seen = Rc::new(Cell::new(0.0));
        let observed = seen.clone();
        let mut registry = ModelRegistry::new();
        registry.register(
            ModelDef::builder("Range")
                .property("start", PropertyKind::Float, 0.0)
                .on_initialize(move |m| {
                    observed.set(m.get("start").unwrap().as_f64().unwrap());
                })
                .build(),
        );
        let model = registry.create("Range", [("start", 4.5)]).unwrap();
        assert_eq!(seen.get(), 4.5);
        assert_eq!(model.type_name(), "Range");
    }

    #[test]
    fn test_create_rejects_invalid_attrs() {
        let mut registry = ModelRegistry::new();
        registry.register(glyph());
        let err = registry.create("Glyph", [("visible", "yes")]).unwrap_err();
        assert!(matches!(err, SyncError::Validation { .. }));
    }
}
