//! Document change events, live and on the wire.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::columnar::ColumnPatches;
use crate::error::SyncError;
use crate::model::{Model, SetterId};
use crate::refs::{ModelRep, Ref};
use crate::value::Value;

/// A change observed on a live document, delivered to `on_change` listeners.
#[derive(Debug, Clone)]
pub enum DocumentChangedEvent {
    ModelChanged {
        model: Model,
        attr: String,
        old: Value,
        new: Value,
        setter_id: Option<SetterId>,
    },
    TitleChanged {
        title: String,
        setter_id: Option<SetterId>,
    },
    RootAdded {
        model: Model,
        setter_id: Option<SetterId>,
    },
    RootRemoved {
        model: Model,
        setter_id: Option<SetterId>,
    },
    ColumnDataChanged {
        model: Model,
        attr: String,
        cols: Option<Vec<String>>,
        data: IndexMap<String, Value>,
        setter_id: Option<SetterId>,
    },
    ColumnsStreamed {
        model: Model,
        attr: String,
        data: IndexMap<String, Value>,
        rollover: Option<usize>,
        setter_id: Option<SetterId>,
    },
    ColumnsPatched {
        model: Model,
        attr: String,
        patches: ColumnPatches,
        setter_id: Option<SetterId>,
    },
}

impl DocumentChangedEvent {
    pub fn setter_id(&self) -> Option<&SetterId> {
        match self {
            DocumentChangedEvent::ModelChanged { setter_id, .. }
            | DocumentChangedEvent::TitleChanged { setter_id, .. }
            | DocumentChangedEvent::RootAdded { setter_id, .. }
            | DocumentChangedEvent::RootRemoved { setter_id, .. }
            | DocumentChangedEvent::ColumnDataChanged { setter_id, .. }
            | DocumentChangedEvent::ColumnsStreamed { setter_id, .. }
            | DocumentChangedEvent::ColumnsPatched { setter_id, .. } => setter_id.as_ref(),
        }
    }

    /// The model the event concerns; `None` for title changes.
    pub fn model(&self) -> Option<&Model> {
        match self {
            DocumentChangedEvent::TitleChanged { .. } => None,
            DocumentChangedEvent::ModelChanged { model, .. }
            | DocumentChangedEvent::RootAdded { model, .. }
            | DocumentChangedEvent::RootRemoved { model, .. }
            | DocumentChangedEvent::ColumnDataChanged { model, .. }
            | DocumentChangedEvent::ColumnsStreamed { model, .. }
            | DocumentChangedEvent::ColumnsPatched { model, .. } => Some(model),
        }
    }

    /// The wire `kind` tag of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            DocumentChangedEvent::ModelChanged { .. } => "ModelChanged",
            DocumentChangedEvent::TitleChanged { .. } => "TitleChanged",
            DocumentChangedEvent::RootAdded { .. } => "RootAdded",
            DocumentChangedEvent::RootRemoved { .. } => "RootRemoved",
            DocumentChangedEvent::ColumnDataChanged { .. } => "ColumnDataChanged",
            DocumentChangedEvent::ColumnsStreamed { .. } => "ColumnsStreamed",
            DocumentChangedEvent::ColumnsPatched { .. } => "ColumnsPatched",
        }
    }
}

fn data_attr() -> String {
    "data".to_string()
}

/// Serialized event. Models appear as refs only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum PatchEvent {
    ModelChanged {
        model: Ref,
        attr: String,
        new: JsonValue,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        setter_id: Option<SetterId>,
    },
    TitleChanged {
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        setter_id: Option<SetterId>,
    },
    RootAdded {
        model: Ref,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        setter_id: Option<SetterId>,
    },
    RootRemoved {
        model: Ref,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        setter_id: Option<SetterId>,
    },
    ColumnDataChanged {
        column_source: Ref,
        #[serde(default = "data_attr")]
        attr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<Vec<String>>,
        data: JsonValue,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        setter_id: Option<SetterId>,
    },
    ColumnsStreamed {
        column_source: Ref,
        #[serde(default = "data_attr")]
        attr: String,
        data: JsonValue,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rollover: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        setter_id: Option<SetterId>,
    },
    /// `patches` maps a column name to `[[index, value], ...]`, where an
    /// index is an integer or a `{start, stop, step}` slice.
    ColumnsPatched {
        column_source: Ref,
        #[serde(default = "data_attr")]
        attr: String,
        patches: JsonValue,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        setter_id: Option<SetterId>,
    },
}

/// An incremental update: new models in full, then events in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    #[serde(default)]
    pub references: Vec<ModelRep>,
    #[serde(default)]
    pub events: Vec<PatchEvent>,
}

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.references.is_empty() && self.events.is_empty()
    }
}

/// A part of an inbound patch that could not be applied.
#[derive(Debug)]
pub struct SkippedEvent {
    /// Position in `Patch::events`; `None` for an attribute of a reference.
    pub index: Option<usize>,
    pub error: SyncError,
}

#[derive(Debug, Default)]
pub struct PatchOutcome {
    pub applied: usize,
    pub skipped: Vec<SkippedEvent>,
}

impl PatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}
