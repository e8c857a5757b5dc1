//! Error types shared across the crate.

use thiserror::Error;

use crate::adapter::AdapterError;

/// Errors surfaced by the runtime core.
#[derive(Debug, Error)]
pub enum AmritaError {
    /// The core was used before `init`/`set_config`.
    #[error("not initialized: {0}")]
    NotInitialized(&'static str),

    /// A named resource (session, preset, tool, adapter protocol) is missing.
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// Tool arguments failed schema validation.
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    /// The model adapter failed (network, HTTP, decode, timeout).
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// A fallback handler aborted the turn.
    #[error("fallback failed: {0}")]
    FallbackFailed(String),

    /// Non-ignored exceptions aggregated from dependency factories.
    #[error("dependency resolution failed: {}", .0.join("; "))]
    DependencyResolution(Vec<String>),

    /// The response queue was used after its end-of-stream sentinel.
    #[error("response queue is closed")]
    QueueClosed,

    /// The turn was cancelled externally.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Invalid registration or mode (Depends cycle, bad sink setup, ...).
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Stable discriminant for [`AmritaError`], used by hook `exception_ignored`
/// matching and by callers that branch on the error class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotInitialized,
    NotFound,
    SchemaViolation,
    Adapter,
    FallbackFailed,
    DependencyResolution,
    QueueClosed,
    Cancelled,
    Configuration,
}

impl AmritaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AmritaError::NotInitialized(_) => ErrorKind::NotInitialized,
            AmritaError::NotFound { .. } => ErrorKind::NotFound,
            AmritaError::SchemaViolation(_) => ErrorKind::SchemaViolation,
            AmritaError::Adapter(_) => ErrorKind::Adapter,
            AmritaError::FallbackFailed(_) => ErrorKind::FallbackFailed,
            AmritaError::DependencyResolution(_) => ErrorKind::DependencyResolution,
            AmritaError::QueueClosed => ErrorKind::QueueClosed,
            AmritaError::Cancelled(_) => ErrorKind::Cancelled,
            AmritaError::Configuration(_) => ErrorKind::Configuration,
        }
    }

    pub(crate) fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        AmritaError::NotFound {
            kind,
            name: name.into(),
        }
    }
}
