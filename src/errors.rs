//! Typed error hierarchy for the Smithers engine.
//!
//! Three top-level enums cover the three subsystems:
//! - `StoreError` — persistence and reactive-layer failures
//! - `RenderError` — element expansion failures inside the reconciler
//! - `EngineError` — what the root error handler receives

use thiserror::Error;

/// Errors from the persistent store and reactive layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store is closed")]
    Closed,

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to encode value for key {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to decode value for key {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("No execution is open on this store")]
    NoExecution,

    #[error("{entity} {id} not found")]
    RowNotFound { entity: &'static str, id: String },
}

/// Errors raised while expanding an element during render.
#[derive(Debug, Error)]
pub enum RenderError {
    /// The authored tree is malformed: a required prop is missing, or an
    /// element was placed outside the context it needs.
    #[error("Author error in <{element}>: {message}")]
    Author {
        element: &'static str,
        message: String,
    },

    #[error("Condition evaluation failed: {0}")]
    Condition(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RenderError {
    /// Shorthand for author errors.
    pub fn author(element: &'static str, message: impl Into<String>) -> Self {
        Self::Author {
            element,
            message: message.into(),
        }
    }
}

/// Errors delivered to the root `on_error` handler.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Render failed at {path}: {source}")]
    Render {
        /// Slash-joined element path from the root to the failing node.
        path: String,
        #[source]
        source: RenderError,
    },

    #[error("Effect failed: {0}")]
    Effect(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Adapter failed in <{element}>: {message}")]
    Adapter {
        element: &'static str,
        message: String,
    },
}
