//! # vizsync-core: document synchronization core
//!
//! A reactive object model for interactive visualizations, kept consistent
//! with a remote copy through JSON patches.
//!
//! ## Architecture
//!
//! ```text
//!   set_attrs ──► Model ──► change signals ──► local listeners
//!                   │
//!                   ▼
//!               Document ──► DocumentChangedEvent ──► create_patch ──► Patch + buffers
//!                   ▲                                                        │
//!                   └────────── apply_patch ◄── Deserializer ◄───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`]: instances, attribute assignment, signals
//! - [`property`]: property kinds and their validation
//! - [`registry`]: type definitions and construction by name
//! - [`refs`]: reference extraction and two-phase graph (de)serialization
//! - [`codec`]: typed numeric arrays and their wire forms
//! - [`columnar`]: stream / patch / replace on column data
//! - [`document`]: roots, indexes, JSON form and the patch protocol
//!
//! Handles are `Rc`-based. Everything here runs on one thread and every
//! listener has run by the time a setter returns.

pub mod codec;
pub mod columnar;
pub mod document;
pub mod error;
pub mod model;
pub mod property;
pub mod refs;
pub mod registry;
pub mod signal;
pub mod value;

pub use codec::{ArrayData, Buffer, ByteOrder, CodecError, DType, NdArray};
pub use columnar::{ColumnHint, ColumnPatches, PatchIndex};
pub use document::{
    compute_patch_between, Document, DocumentChangedEvent, DocumentJson, FreezeGuard, Patch,
    PatchEvent, PatchOutcome, RootsJson, SkippedEvent,
};
pub use error::{Result, SyncError};
pub use model::{AttrChange, ChangeNotice, Model, ModelId, SetOptions, SetterId};
pub use property::{DefaultValue, PropertyDef, PropertyKind};
pub use refs::{collect_references, ArrayEncoding, ModelRep, Ref, SerializeOptions};
pub use registry::{ModelDef, ModelDefBuilder, ModelRegistry};
pub use signal::SubscriptionId;
pub use value::Value;
