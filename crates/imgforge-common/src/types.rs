//! Domain primitive types used across the imgforge workspace.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Unique identifier for an image handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleId(String);

impl HandleId {
    /// Creates a handle ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random handle ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a batch operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchId(String);

impl BatchId {
    /// Creates a batch ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random batch ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Host-visible location through which a mounted image is accessed.
///
/// Either a directory (container formats) or a drive root such as `E:\`
/// (virtual disks).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MountPoint(PathBuf);

impl MountPoint {
    /// Creates a mount point from a directory path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// Creates a mount point for a drive letter root (`E:\`).
    #[must_use]
    pub fn drive(letter: char) -> Self {
        Self(PathBuf::from(format!("{}:\\", letter.to_ascii_uppercase())))
    }

    /// Returns the drive letter if this mount point is a drive root.
    #[must_use]
    pub fn drive_letter(&self) -> Option<char> {
        let s = self.0.to_str()?;
        let mut chars = s.chars();
        let letter = chars.next()?;
        let rest: String = chars.collect();
        (letter.is_ascii_alphabetic() && (rest == ":\\" || rest == ":"))
            .then(|| letter.to_ascii_uppercase())
    }

    /// Returns the mount point as a path.
    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for MountPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Image container format, selected once when a handle is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageFormat {
    /// Directly mountable container (`.wim`).
    DirectContainer,
    /// Compressed container that must be converted before mounting (`.esd`).
    CompressedContainer,
    /// Legacy virtual disk (`.vhd`).
    VirtualDiskLegacy,
    /// Modern virtual disk (`.vhdx`).
    VirtualDiskModern,
}

impl ImageFormat {
    /// Returns whether this format is a virtual disk.
    #[must_use]
    pub const fn is_virtual_disk(self) -> bool {
        matches!(self, Self::VirtualDiskLegacy | Self::VirtualDiskModern)
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DirectContainer => write!(f, "direct-container"),
            Self::CompressedContainer => write!(f, "compressed-container"),
            Self::VirtualDiskLegacy => write!(f, "virtual-disk-legacy"),
            Self::VirtualDiskModern => write!(f, "virtual-disk-modern"),
        }
    }
}

/// Mount lifecycle state of an image handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandleState {
    /// Not mounted; the only state from which `mount` is accepted.
    NotMounted,
    /// Mount in progress.
    Mounting,
    /// Mounted and available for file operations.
    Mounted,
    /// Dismount in progress.
    Dismounting,
    /// Mount or dismount failed and the handle is unusable.
    Error,
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotMounted => write!(f, "not-mounted"),
            Self::Mounting => write!(f, "mounting"),
            Self::Mounted => write!(f, "mounted"),
            Self::Dismounting => write!(f, "dismounting"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Lifecycle state of a batch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchState {
    /// Constructed but not yet accepted into the queue.
    Created,
    /// Waiting to be started.
    Queued,
    /// Items are being dispatched.
    Running,
    /// Dispatch suspended; in-flight items still finish.
    Paused,
    /// Every item reached a terminal status.
    Completed,
    /// Halted after an item failure or an orchestrator-level failure.
    Failed,
    /// Stopped permanently by the operator.
    Cancelled,
}

impl BatchState {
    /// Returns whether workers may be active for a batch in this state.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome status of a single batch item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemStatus {
    /// Waiting for a worker.
    Pending,
    /// Claimed by a worker.
    Running,
    /// Mounted, transformed, and committed.
    Success,
    /// Failed at some step; eligible for retry.
    Failed,
    /// Not executed (cancelled before it could run).
    Skipped,
}

impl ItemStatus {
    /// Returns whether the item has reached a final outcome.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Scheduling policy of a batch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPolicy {
    /// Size of the worker pool.
    pub max_parallel: usize,
    /// Keep dispatching after an item fails.
    pub continue_on_error: bool,
    /// Automatic re-attempts of a retryable item failure.
    pub max_retries: u32,
}

impl BatchPolicy {
    /// Checks that the policy can be scheduled.
    ///
    /// # Errors
    ///
    /// Returns `ForgeError::Config` if `max_parallel` is zero or exceeds
    /// [`MAX_PARALLEL_LIMIT`](crate::constants::MAX_PARALLEL_LIMIT).
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.max_parallel == 0 || self.max_parallel > crate::constants::MAX_PARALLEL_LIMIT {
            return Err(crate::error::ForgeError::Config {
                message: format!(
                    "max_parallel must be between 1 and {}, got {}",
                    crate::constants::MAX_PARALLEL_LIMIT,
                    self.max_parallel
                ),
            });
        }
        Ok(())
    }
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            max_parallel: crate::constants::DEFAULT_MAX_PARALLEL,
            continue_on_error: true,
            max_retries: 0,
        }
    }
}
