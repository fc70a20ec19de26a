//! Request-path error taxonomy.
//!
//! Every failure inside a tile producer unwinds to the request entry point
//! as a [`GenerateError`]; the HTTP collaborator maps the variants to
//! status codes. Reconciler and preparation failures are recorded on the
//! resource record instead and never abort the server.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by tile producers and the generator registry.
#[derive(Debug, Error)]
pub enum GenerateError {
    /// Unknown resource, unrecognised filename or tile out of range.
    #[error("not found: {0}")]
    NotFound(String),

    /// Logical "no data here"; the collaborator returns a canonical
    /// empty body instead of an error page.
    #[error("empty image")]
    EmptyImage,

    /// Debug-mask flavour of [`GenerateError::EmptyImage`].
    #[error("empty debug mask")]
    EmptyDebugMask,

    /// Catalogue or definition parsing failure; keeps the offending path.
    #[error("format error in {path}: {message}")]
    Format { path: PathBuf, message: String },

    /// File open/read/write failure.
    #[error("I/O error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Driver, assertion or conversion failure. Fatal for the request,
    /// never for the process.
    #[error("internal error: {0}")]
    Internal(String),

    /// Resource exists but has not finished preparing.
    #[error("resource not ready")]
    Unavailable,

    /// The request sink was aborted; no response body is produced.
    #[error("request cancelled")]
    Cancelled,

    /// A warper worker died while serving the request; the caller may
    /// retry once.
    #[error("warper worker lost")]
    WorkerLost,
}

impl GenerateError {
    /// Wraps an I/O error with a human-readable context string.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// The HTTP status the collaborator should map this error to.
    pub fn status(&self) -> u16 {
        match self {
            Self::NotFound(_) | Self::EmptyImage | Self::EmptyDebugMask => 404,
            Self::Unavailable => 503,
            Self::Cancelled => 499,
            Self::WorkerLost | Self::Internal(_) | Self::Io { .. } | Self::Format { .. } => 500,
        }
    }
}

/// Shorthand used throughout the producer code paths.
pub type GenerateResult<T> = Result<T, GenerateError>;
