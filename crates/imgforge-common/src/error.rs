//! Unified error types for the imgforge workspace.
//!
//! Handlers, the registry, and the orchestrator all report failures through
//! [`ForgeError`]. Per-item failures are recorded on the batch; everything
//! else propagates to the caller.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum ForgeError {
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

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },

    /// A handle is already mounted or a mount point is already claimed.
    #[error("mount conflict at {mount_point}: {reason}")]
    MountConflict {
        /// Mount point (or image) that is already in use.
        mount_point: String,
        /// What the conflicting claim was.
        reason: String,
    },

    /// The image container format is not recognized.
    #[error("unsupported image format: {path}")]
    UnsupportedFormat {
        /// Path of the unrecognized image.
        path: PathBuf,
    },

    /// The external servicing tool returned a non-zero exit code.
    #[error("{tool} failed with exit code {exit_code}: {output}")]
    ToolInvocationFailure {
        /// Name of the invoked tool or verb.
        tool: String,
        /// Exit code reported by the tool (`-1` when killed by a signal).
        exit_code: i32,
        /// Captured standard output and standard error.
        output: String,
    },

    /// A compressed container is encrypted and cannot be converted.
    #[error("encrypted source is not supported: {path}")]
    EncryptedSourceNotSupported {
        /// Path of the encrypted image.
        path: PathBuf,
    },

    /// The host reports a mount that the registry does not own.
    #[error("orphaned mount at {mount_point}")]
    OrphanedMount {
        /// Live mount point without a registry entry.
        mount_point: String,
    },

    /// A file operation was attempted on a handle that is not mounted.
    #[error("image is not mounted: {path}")]
    NotMounted {
        /// Path of the image.
        path: PathBuf,
    },

    /// A state-machine transition was rejected.
    #[error("cannot {action} {entity} in state {from}")]
    InvalidTransition {
        /// Kind of state machine (`"handle"`, `"batch"`).
        entity: &'static str,
        /// State the entity was in.
        from: String,
        /// Requested action.
        action: &'static str,
    },

    /// Cooperative cancellation was observed at a step boundary.
    #[error("cancelled before {step}")]
    Cancelled {
        /// Step that was not started.
        step: String,
    },

    /// Durable batch storage is unavailable.
    #[error("batch storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
    },
}

impl ForgeError {
    /// Returns whether repeating the same operation may succeed.
    ///
    /// Only external tool failures qualify; format, encryption, and
    /// conflict errors will fail identically on every attempt.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ToolInvocationFailure { .. })
    }

    /// Builds an [`ForgeError::Io`] from a path and an I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, ForgeError>;
