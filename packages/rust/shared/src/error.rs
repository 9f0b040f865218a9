//! Error types for claimstack.
//!
//! Library crates use [`ClaimStackError`] via `thiserror`.
//! App crates (cli/web) wrap this with `color-eyre` for rich diagnostics.
//!
//! The first four variants are the operator-facing taxonomy: a resource
//! that is not ready yet, declared vs. actual configuration drift, a failed
//! managed-service call, and a missing prerequisite on the operator's side.

use std::path::PathBuf;

/// Top-level error type for all claimstack operations.
#[derive(Debug, thiserror::Error)]
pub enum ClaimStackError {
    /// A dependency has not reached the state required by the next step.
    #[error("{resource} is not ready (state: {state})")]
    NotReady { resource: String, state: String },

    /// Declared configuration disagrees with what exists remotely.
    #[error("configuration conflict: {message}")]
    ConfigConflict { message: String },

    /// A managed-service call failed or returned something unusable.
    #[error("{service} call failed: {message}")]
    ExternalCall { service: String, message: String },

    /// Missing credentials, identifiers, or other operator prerequisites.
    #[error("{message}")]
    Operator { message: String },

    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// A bounded wait ran out.
    #[error("timed out after {waited_secs}s waiting for {what}")]
    Timeout { what: String, waited_secs: u64 },

    /// An ingestion job reached `FAILED`.
    #[error("ingestion job {job_id} failed: {}", reasons.join("; "))]
    IngestionFailed { job_id: String, reasons: Vec<String> },

    /// The provisioning engine left a stack in a failed or rolled-back state.
    #[error("stack {stack} ended in {status}: {reason}")]
    Provisioning {
        stack: String,
        status: String,
        reason: String,
    },

    /// Database or journal error.
    #[error("storage error: {0}")]
    Storage(String),

    /// JSON/TOML encoding or decoding error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Invalid input (bad resource graph, out-of-range rating, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ClaimStackError>;

impl ClaimStackError {
    pub fn not_ready(resource: impl Into<String>, state: impl std::fmt::Display) -> Self {
        Self::NotReady {
            resource: resource.into(),
            state: state.to_string(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::ConfigConflict {
            message: msg.into(),
        }
    }

    /// Create an external-call error tagged with the service that failed.
    pub fn external(service: impl Into<String>, msg: impl std::fmt::Display) -> Self {
        Self::ExternalCall {
            service: service.into(),
            message: msg.to_string(),
        }
    }

    pub fn operator(msg: impl Into<String>) -> Self {
        Self::Operator {
            message: msg.into(),
        }
    }

    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_not_ready(&self) -> bool {
        matches!(self, Self::NotReady { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConfigConflict { .. })
    }

    pub fn is_external(&self) -> bool {
        matches!(self, Self::ExternalCall { .. })
    }
}

impl From<serde_json::Error> for ClaimStackError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
