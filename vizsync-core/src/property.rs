//! Property kinds: validation and normalization of attribute values.
//!
//! The kind set is closed. Vectorized kinds accept three shapes:
//!
//! ```text
//! 1.5                      literal scalar
//! {"value": 1.5}           wrapped scalar
//! {"field": "x"}           column reference, resolved by the consumer
//! ```
//!
//! optionally with a `transform` model and, for unit-bearing kinds, a `units`
//! tag. Column references are never checked here.

use std::fmt;
use std::rc::Rc;

use crate::codec::DType;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyKind {
    Any,
    Bool,
    Int,
    Float,
    String,
    Enum(Vec<String>),
    Nullable(Box<PropertyKind>),
    List(Box<PropertyKind>),
    Dict(Box<PropertyKind>),
    /// A model of the named type or one of its subtypes.
    Instance(String),
    /// A typed array, optionally restricted to one element type.
    Array(Option<DType>),
    /// Map of column name to list or typed array.
    ColumnData,
    Vectorized(Box<PropertyKind>),
    Units {
        kind: Box<PropertyKind>,
        units: Vec<String>,
    },
}

impl PropertyKind {
    pub fn nullable(kind: PropertyKind) -> Self {
        PropertyKind::Nullable(Box::new(kind))
    }

    pub fn list(kind: PropertyKind) -> Self {
        PropertyKind::List(Box::new(kind))
    }

    pub fn dict(kind: PropertyKind) -> Self {
        PropertyKind::Dict(Box::new(kind))
    }

    pub fn instance(type_name: impl Into<String>) -> Self {
        PropertyKind::Instance(type_name.into())
    }

    pub fn enumeration(values: &[&str]) -> Self {
        PropertyKind::Enum(values.iter().map(|v| v.to_string()).collect())
    }

    pub fn vectorized(kind: PropertyKind) -> Self {
        PropertyKind::Vectorized(Box::new(kind))
    }

    pub fn units(kind: PropertyKind, units: &[&str]) -> Self {
        PropertyKind::Units {
            kind: Box::new(kind),
            units: units.iter().map(|u| u.to_string()).collect(),
        }
    }

    /// Check `value` against this kind. The error is a human-readable reason.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        match self {
            PropertyKind::Any => Ok(()),
            PropertyKind::Bool => expect(matches!(value, Value::Bool(_)), "bool", value),
            PropertyKind::Int => expect(matches!(value, Value::Int(_)), "int", value),
            PropertyKind::Float => {
                expect(matches!(value, Value::Int(_) | Value::Float(_)), "number", value)
            }
            PropertyKind::String => expect(matches!(value, Value::String(_)), "string", value),
            PropertyKind::Enum(allowed) => match value {
                Value::String(s) if allowed.contains(s) => Ok(()),
                _ => Err(format!("expected one of {allowed:?}, got {}", describe(value))),
            },
            PropertyKind::Nullable(inner) => match value {
                Value::Null => Ok(()),
                other => inner.validate(other),
            },
            PropertyKind::List(inner) => match value {
                Value::List(items) => items.iter().enumerate().try_for_each(|(i, item)| {
                    inner.validate(item).map_err(|e| format!("item {i}: {e}"))
                }),
                Value::Array(_) if inner.is_numeric() => Ok(()),
                other => Err(format!("expected list, got {}", describe(other))),
            },
            PropertyKind::Dict(inner) => match value {
                Value::Map(map) => map.iter().try_for_each(|(k, v)| {
                    inner.validate(v).map_err(|e| format!("key '{k}': {e}"))
                }),
                other => Err(format!("expected map, got {}", describe(other))),
            },
            PropertyKind::Instance(type_name) => match value {
                Value::Model(model) if model.def().is_a(type_name) => Ok(()),
                Value::Model(model) => Err(format!(
                    "expected instance of {type_name}, got {}",
                    model.type_name()
                )),
                other => Err(format!("expected instance of {type_name}, got {}", describe(other))),
            },
            PropertyKind::Array(dtype) => match value {
                Value::Array(array) => match dtype {
                    Some(d) if *d != array.dtype() => {
                        Err(format!("expected {d} array, got {}", array.dtype()))
                    }
                    _ => Ok(()),
                },
                other => Err(format!("expected array, got {}", describe(other))),
            },
            PropertyKind::ColumnData => match value {
                Value::Map(columns) => columns.iter().try_for_each(|(name, column)| match column {
                    Value::List(_) | Value::Array(_) => Ok(()),
                    other => Err(format!(
                        "column '{name}' must be a list or array, got {}",
                        describe(other)
                    )),
                }),
                other => Err(format!("expected column data map, got {}", describe(other))),
            },
            PropertyKind::Vectorized(inner) => validate_vectorized(inner, None, value),
            PropertyKind::Units { kind, units } => validate_vectorized(kind, Some(units), value),
        }
    }

    /// Normalize an already validated value. A bare string given to a
    /// vectorized kind that does not itself accept strings names a field.
    pub fn transform(&self, value: Value) -> Value {
        match (self, value) {
            (PropertyKind::Vectorized(inner), Value::String(s))
            | (PropertyKind::Units { kind: inner, .. }, Value::String(s))
                if !inner.accepts_string() =>
            {
                Value::map([("field", s)])
            }
            (PropertyKind::Nullable(inner), value) if !value.is_null() => inner.transform(value),
            (_, value) => value,
        }
    }

    fn accepts_string(&self) -> bool {
        match self {
            PropertyKind::Any | PropertyKind::String | PropertyKind::Enum(_) => true,
            PropertyKind::Nullable(inner) | PropertyKind::Vectorized(inner) => inner.accepts_string(),
            _ => false,
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(self, PropertyKind::Any | PropertyKind::Int | PropertyKind::Float)
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Model(model) => format!("model {}", model.type_name()),
        other => other.kind_name().to_string(),
    }
}

fn expect(ok: bool, expected: &str, value: &Value) -> Result<(), String> {
    if ok {
        Ok(())
    } else {
        Err(format!("expected {expected}, got {}", describe(value)))
    }
}

fn validate_vectorized(inner: &PropertyKind, units: Option<&Vec<String>>, value: &Value) -> Result<(), String> {
    let map = match value {
        Value::Map(map) => map,
        Value::String(_) if !inner.accepts_string() => return Ok(()),
        scalar => return inner.validate(scalar),
    };
    if inner.validate(value).is_ok() {
        // Dict-valued entries are plain values.
        return Ok(());
    }

    let selectors = ["value", "field", "expr"]
        .iter()
        .filter(|k| map.contains_key(**k))
        .count();
    if selectors != 1 {
        return Err("vectorized value must have exactly one of 'value', 'field' or 'expr'".to_string());
    }

    for (key, item) in map {
        match key.as_str() {
            "value" => inner.validate(item)?,
            "field" => expect(matches!(item, Value::String(_)), "field name", item)?,
            "expr" | "transform" => expect(matches!(item, Value::Model(_)), "model", item)
                .map_err(|e| format!("{key}: {e}"))?,
            "units" => match (units, item) {
                (Some(allowed), Value::String(u)) if allowed.contains(u) => {}
                (Some(allowed), other) => {
                    return Err(format!("units must be one of {allowed:?}, got {}", describe(other)))
                }
                (None, _) => return Err("vectorized value does not take units".to_string()),
            },
            other => return Err(format!("unexpected vectorized key '{other}'")),
        }
    }
    Ok(())
}

/// Default of a property, produced on first read.
#[derive(Clone)]
pub enum DefaultValue {
    Static(Value),
    Lazy(Rc<dyn Fn() -> Value>),
}

impl DefaultValue {
    pub fn lazy(f: impl Fn() -> Value + 'static) -> Self {
        DefaultValue::Lazy(Rc::new(f))
    }

    pub fn produce(&self) -> Value {
        match self {
            DefaultValue::Static(value) => value.clone(),
            DefaultValue::Lazy(f) => f(),
        }
    }
}

impl fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultValue::Static(value) => f.debug_tuple("Static").field(value).finish(),
            DefaultValue::Lazy(_) => f.write_str("Lazy(..)"),
        }
    }
}

/// A named property on a model type.
#[derive(Debug, Clone)]
pub struct PropertyDef {
    pub name: String,
    pub kind: PropertyKind,
    pub default: DefaultValue,
    /// Internal properties are local state and never serialized.
    pub internal: bool,
}
