//! Unified error types for the Burrow workspace.
//!
//! Higher-level crates wrap these variants in their own stage-specific
//! errors when they need to map failures onto exit codes.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum BurrowError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A permission or ownership check failed.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the denied operation.
        message: String,
    },

    /// A destructive operation targeted a path outside every safe prefix.
    #[error("refusing to modify path outside of safe prefixes: {path}")]
    UnsafePath {
        /// Offending path.
        path: PathBuf,
    },

    /// The runtime execution spec is malformed.
    #[error("invalid execution spec: {message}")]
    Spec {
        /// Description of the validation failure.
        message: String,
    },

    /// An environment variable entry is malformed.
    #[error("invalid environment entry: {entry}")]
    Environment {
        /// The rejected `KEY=VALUE` entry.
        entry: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl BurrowError {
    /// Builds an [`BurrowError::Io`] from a path and an I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, BurrowError>;
