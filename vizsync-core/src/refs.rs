//! Reference-based graph serialization.
//!
//! On the wire, an embedded model is replaced by a [`Ref`] and described once
//! in a reference table of [`ModelRep`]s:
//!
//! ```text
//! {"id": "p1", "type": "Plot", "attributes": {"x_range": {"id": "r1", "type": "Range"}}}
//! ```
//!
//! Reconstruction is two-phase. Every rep first gets an empty shell so that
//! refs in any direction (cycles included) resolve against the table, then
//! the attributes are decoded. Nothing is assigned until every rep decoded.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::codec::{self, ArrayWire, Buffer, ByteOrder, CodecError};
use crate::error::{Result, SyncError};
use crate::model::{Model, ModelId};
use crate::registry::ModelRegistry;
use crate::value::Value;

/// Non-owning pointer to a model by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ref {
    pub id: ModelId,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
}

/// Full description of one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRep {
    #[serde(flatten)]
    pub header: Ref,
    #[serde(default)]
    pub attributes: Map<String, JsonValue>,
}

/// Every model reachable from `roots`, each exactly once, in depth-first
/// preorder.
pub fn collect_references(roots: &[Model]) -> Vec<Model> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut stack: Vec<Model> = roots.iter().rev().cloned().collect();
    while let Some(model) = stack.pop() {
        if !seen.insert(model.identity()) {
            continue;
        }
        stack.extend(model.child_models().into_iter().rev());
        out.push(model);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArrayEncoding {
    /// Inline base64 text.
    #[default]
    Base64,
    /// Side-channel buffers.
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerializeOptions {
    pub include_defaults: bool,
    pub arrays: ArrayEncoding,
    pub byte_order: ByteOrder,
}

impl Default for SerializeOptions {
    fn default() -> Self {
        Self {
            include_defaults: false,
            arrays: ArrayEncoding::Base64,
            byte_order: ByteOrder::Little,
        }
    }
}

impl SerializeOptions {
    pub fn binary() -> Self {
        Self {
            arrays: ArrayEncoding::Binary,
            ..Self::default()
        }
    }
}

/// Encodes values and models into JSON plus side buffers.
pub struct Serializer {
    options: SerializeOptions,
    /// Ids the receiver already holds; these are sent as refs only.
    known: HashSet<ModelId>,
    /// Identity of the instance seen under each id.
    seen: HashMap<ModelId, usize>,
    references: Vec<ModelRep>,
    buffers: Vec<Buffer>,
}

impl Serializer {
    pub fn new(options: SerializeOptions) -> Self {
        Self {
            options,
            known: HashSet::new(),
            seen: HashMap::new(),
            references: Vec::new(),
            buffers: Vec::new(),
        }
    }

    pub fn with_known(mut self, ids: impl IntoIterator<Item = ModelId>) -> Self {
        self.known.extend(ids);
        self
    }

    /// Register `model` and, unless known, describe it in the reference
    /// table. The model is registered before its attributes are encoded.
    pub fn encode_model(&mut self, model: &Model) -> Result<Ref> {
        match self.seen.get(model.id()) {
            Some(&identity) if identity == model.identity() => return Ok(model.to_ref()),
            Some(_) => return Err(SyncError::DuplicateId(model.id().clone())),
            None => {}
        }
        self.seen.insert(model.id().clone(), model.identity());
        if self.known.contains(model.id()) {
            return Ok(model.to_ref());
        }

        let slot = self.references.len();
        self.references.push(ModelRep {
            header: model.to_ref(),
            attributes: Map::new(),
        });
        let mut attributes = Map::new();
        for (name, value) in model.properties_with_values(self.options.include_defaults) {
            attributes.insert(name, self.encode_value(&value)?);
        }
        self.references[slot].attributes = attributes;
        Ok(model.to_ref())
    }

    pub fn encode_value(&mut self, value: &Value) -> Result<JsonValue> {
        Ok(match value {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int(i) => JsonValue::from(*i),
            Value::Float(f) => encode_float(*f),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::List(items) => JsonValue::Array(
                items
                    .iter()
                    .map(|v| self.encode_value(v))
                    .collect::<Result<_>>()?,
            ),
            Value::Map(map) => {
                let mut out = Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), self.encode_value(v)?);
                }
                if is_reserved_shape(&out) {
                    let mut wrapped = Map::with_capacity(1);
                    wrapped.insert(MAP_TAG.to_string(), JsonValue::Object(out));
                    JsonValue::Object(wrapped)
                } else {
                    JsonValue::Object(out)
                }
            }
            Value::Model(model) => serde_json::to_value(self.encode_model(model)?)?,
            Value::Array(array) => match self.options.arrays {
                ArrayEncoding::Base64 => {
                    serde_json::to_value(codec::encode_inline(array, self.options.byte_order))?
                }
                ArrayEncoding::Binary => {
                    let id = self.buffers.len().to_string();
                    let (wire, buffer) = codec::encode_buffer(array, self.options.byte_order, id);
                    self.buffers.push(buffer);
                    serde_json::to_value(wire)?
                }
            },
        })
    }

    pub fn references(&self) -> &[ModelRep] {
        &self.references
    }

    pub fn into_parts(self) -> (Vec<ModelRep>, Vec<Buffer>) {
        (self.references, self.buffers)
    }
}

fn encode_float(f: f64) -> JsonValue {
    if let Some(n) = serde_json::Number::from_f64(f) {
        return JsonValue::Number(n);
    }
    let tag = if f.is_nan() {
        "nan"
    } else if f > 0.0 {
        "+inf"
    } else {
        "-inf"
    };
    serde_json::json!({ "__number__": tag })
}

fn decode_number_tag(tag: &str) -> Option<f64> {
    match tag {
        "nan" => Some(f64::NAN),
        "+inf" | "inf" => Some(f64::INFINITY),
        "-inf" => Some(f64::NEG_INFINITY),
        _ => None,
    }
}

/// An attribute dropped during decoding because its array payload was bad.
#[derive(Debug, Clone)]
pub struct SkippedAttr {
    pub model: ModelId,
    pub attr: String,
    pub error: CodecError,
}

/// Decodes reference tables and values against a resolution table.
pub struct Deserializer<'a> {
    registry: &'a ModelRegistry,
    buffers: &'a [Buffer],
    existing: HashMap<ModelId, Model>,
    table: HashMap<ModelId, Model>,
    created: Vec<Model>,
    skipped: Vec<SkippedAttr>,
}

impl<'a> Deserializer<'a> {
    pub fn new(registry: &'a ModelRegistry, buffers: &'a [Buffer]) -> Self {
        Self {
            registry,
            buffers,
            existing: HashMap::new(),
            table: HashMap::new(),
            created: Vec::new(),
            skipped: Vec::new(),
        }
    }

    /// Live instances that reps with a matching id merge into.
    pub fn with_existing(mut self, models: impl IntoIterator<Item = Model>) -> Self {
        for model in models {
            self.table.insert(model.id().clone(), model.clone());
            self.existing.insert(model.id().clone(), model);
        }
        self
    }

    /// Resolve every rep to a model and decode its attributes.
    ///
    /// Nothing is assigned: the decoded attributes are returned next to their
    /// model so the caller decides how to apply them.
    pub fn decode_references(&mut self, reps: &[ModelRep]) -> Result<Vec<(Model, IndexMap<String, Value>)>> {
        let mut batch = HashSet::new();
        let mut shells = Vec::with_capacity(reps.len());
        for rep in reps {
            let id = &rep.header.id;
            if !batch.insert(id.clone()) {
                return Err(SyncError::DuplicateId(id.clone()));
            }
            let model = match self.existing.get(id) {
                Some(model) => model.clone(),
                None => {
                    let shell =
                        self.registry
                            .shell(&rep.header.type_name, rep.header.subtype.as_deref(), id.clone())?;
                    self.created.push(shell.clone());
                    shell
                }
            };
            self.table.insert(id.clone(), model.clone());
            shells.push(model);
        }

        let mut pending = Vec::with_capacity(reps.len());
        for (rep, model) in reps.iter().zip(shells) {
            let mut attrs = IndexMap::new();
            for (name, raw) in &rep.attributes {
                match self.decode_value(raw) {
                    Ok(value) => {
                        attrs.insert(name.clone(), value);
                    }
                    Err(SyncError::MalformedBuffer(error)) => {
                        log::warn!("skipping {}.{name} of {}: {error}", rep.header.type_name, rep.header.id);
                        self.skipped.push(SkippedAttr {
                            model: rep.header.id.clone(),
                            attr: name.clone(),
                            error,
                        });
                    }
                    Err(e) => return Err(e),
                }
            }
            pending.push((model, attrs));
        }
        Ok(pending)
    }

    pub fn decode_value(&self, raw: &JsonValue) -> Result<Value> {
        Ok(match raw {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::String(s) => Value::String(s.clone()),
            JsonValue::Array(items) => Value::List(
                items
                    .iter()
                    .map(|v| self.decode_value(v))
                    .collect::<Result<_>>()?,
            ),
            JsonValue::Object(obj) => {
                if let Some(inner) = map_tag(obj) {
                    let mut map = IndexMap::with_capacity(inner.len());
                    for (k, v) in inner {
                        map.insert(k.clone(), self.decode_value(v)?);
                    }
                    return Ok(Value::Map(map));
                }
                if ArrayWire::is_wire_object(obj) {
                    let wire = ArrayWire::from_json(raw)?;
                    return Ok(Value::Array(codec::decode(&wire, self.buffers)?));
                }
                if let Some(f) = number_tag(obj) {
                    return Ok(Value::Float(f));
                }
                if let Some(id) = ref_id(obj) {
                    return self.resolve(&ModelId::from(id)).map(Value::Model);
                }
                let mut map = IndexMap::with_capacity(obj.len());
                for (k, v) in obj {
                    map.insert(k.clone(), self.decode_value(v)?);
                }
                Value::Map(map)
            }
        })
    }

    pub fn resolve(&self, id: &ModelId) -> Result<Model> {
        self.table
            .get(id)
            .cloned()
            .ok_or_else(|| SyncError::UnresolvedReference(id.clone()))
    }

    /// Shells constructed by this deserializer, in rep order.
    pub fn created(&self) -> &[Model] {
        &self.created
    }

    pub fn skipped(&self) -> &[SkippedAttr] {
        &self.skipped
    }
}

/// Wraps a plain map whose own keys would otherwise decode as a ref, an
/// array or a number tag.
const MAP_TAG: &str = "__map__";

fn is_reserved_shape(obj: &Map<String, JsonValue>) -> bool {
    ArrayWire::is_wire_object(obj)
        || obj.contains_key("__number__")
        || obj.contains_key(MAP_TAG)
        || ref_id(obj).is_some()
}

fn map_tag(obj: &Map<String, JsonValue>) -> Option<&Map<String, JsonValue>> {
    if obj.len() != 1 {
        return None;
    }
    obj.get(MAP_TAG)?.as_object()
}

fn number_tag(obj: &Map<String, JsonValue>) -> Option<f64> {
    if obj.len() != 1 {
        return None;
    }
    obj.get("__number__")?.as_str().and_then(decode_number_tag)
}

/// An object is a ref when it has a string `id` and nothing beyond
/// `type` and `subtype`.
fn ref_id(obj: &Map<String, JsonValue>) -> Option<&str> {
    let id = obj.get("id")?.as_str()?;
    obj.keys()
        .all(|k| matches!(k.as_str(), "id" | "type" | "subtype"))
        .then_some(id)
}
