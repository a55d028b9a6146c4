//! Error types surfaced by the engine and its components.

use std::fmt;

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Top-level error type of this crate.
///
/// None of these are swallowed internally: pre-checks fail before any state
/// mutation, and failures during resolution leave the engine unchanged.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A required argument was missing or empty at construction.
    #[error("{0}")]
    InvalidArgument(String),
    /// The operation is not valid in the current state, e.g. presenting a
    /// loader to an engine that did not create it.
    #[error("{0}")]
    InvalidState(String),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    NameConflict(#[from] crate::conflict::ClassNameConflict),
}

impl EngineError {
    pub(crate) fn invalid_argument(msg: impl fmt::Display) -> Self {
        EngineError::InvalidArgument(msg.to_string())
    }

    pub(crate) fn invalid_state(msg: impl fmt::Display) -> Self {
        EngineError::InvalidState(msg.to_string())
    }
}

/// Failure reported by a [`Compiler`](crate::Compiler).
///
/// Clonable so that one failed compilation can be handed to every caller
/// waiting on it.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("failed to compile \"{source_id}\": {message}")]
pub struct CompileError {
    source_id: String,
    message: String,
}

impl CompileError {
    pub fn new(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self { source_id: source_id.into(), message: message.into() }
    }

    /// Id of the source the compiler choked on.
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// The compiler's diagnostic text.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// A class lookup that came up empty.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    /// The name is defined neither by the parent, the layers, nor the top
    /// cache.
    #[error("class \"{0}\" not found")]
    ClassNotFound(String),
    /// The source is not part of any layer and no top cache is available to
    /// compile it.
    #[error("source \"{0}\" not found")]
    SourceNotFound(String),
    /// A class was requested through a source that does not declare it.
    #[error("class \"{class_name}\" is not defined by source \"{source_id}\"")]
    ClassNotInSource { class_name: String, source_id: String },
}
