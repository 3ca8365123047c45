//! Error taxonomy for the synchronization core.

use thiserror::Error;

use crate::codec::CodecError;
use crate::model::ModelId;

/// Errors raised by the property system, the reference resolver and the
/// document.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A value failed its property's type or shape predicate.
    #[error("invalid value for {type_name}.{attr}: {reason}")]
    Validation {
        type_name: String,
        attr: String,
        reason: String,
    },

    #[error("{type_name} has no property '{attr}'")]
    UnknownAttribute { type_name: String, attr: String },

    #[error("unknown model type '{0}'")]
    UnknownType(String),

    /// A reference named an id with no entry in the resolution table.
    #[error("unresolved reference to model {0}")]
    UnresolvedReference(ModelId),

    /// Two distinct instances claimed the same id in one resolution pass.
    #[error("duplicate model id {0}")]
    DuplicateId(ModelId),

    #[error("malformed buffer: {0}")]
    MalformedBuffer(#[from] CodecError),

    /// The model already belongs to a different document.
    #[error("model {0} is already attached to another document")]
    AlreadyAttached(ModelId),

    #[error("multiple models are named '{0}'")]
    AmbiguousName(String),

    #[error("model {0} has been destroyed")]
    Destroyed(ModelId),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    pub(crate) fn validation(
        type_name: impl Into<String>,
        attr: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Validation {
            type_name: type_name.into(),
            attr: attr.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
