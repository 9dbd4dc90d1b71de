//! Global configuration model for imgforge.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ForgeError, Result};
use crate::types::BatchPolicy;

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    /// Base directory for imgforge state and data.
    pub data_dir: PathBuf,
    /// Root under which directory mount points are created.
    pub mount_root: PathBuf,
    /// Directory holding temporary working copies.
    pub work_dir: PathBuf,
    /// Directory holding persisted batch documents.
    pub batch_dir: PathBuf,
    /// External tool locations.
    pub tools: ToolPaths,
    /// Virtual-disk mount tuning.
    pub virtual_disk: VirtualDiskConfig,
    /// Policy applied when a batch does not specify one.
    pub default_policy: BatchPolicy,
    /// Logging setup.
    pub log: LogConfig,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            data_dir: crate::constants::data_dir().clone(),
            mount_root: crate::constants::default_mount_root(),
            work_dir: crate::constants::default_work_dir(),
            batch_dir: crate::constants::default_batch_dir(),
            tools: ToolPaths::default(),
            virtual_disk: VirtualDiskConfig::default(),
            default_policy: BatchPolicy::default(),
            log: LogConfig::default(),
        }
    }
}

impl ForgeConfig {
    /// Loads the configuration from a JSON file.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// if the default policy is invalid.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| ForgeError::io(path, e))?;
        let config: Self = serde_json::from_str(&content)?;
        config.default_policy.validate()?;
        Ok(config)
    }

    /// Writes the configuration as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory or file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ForgeError::io(parent, e))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| ForgeError::io(path, e))
    }
}

/// Locations of the external tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    /// Image servicing tool.
    pub servicing: PathBuf,
    /// Registry hive load/unload tool.
    pub registry: PathBuf,
    /// Shell that hosts the disk-image cmdlets.
    pub disk_shell: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            servicing: PathBuf::from(crate::constants::DEFAULT_SERVICING_TOOL),
            registry: PathBuf::from(crate::constants::DEFAULT_REGISTRY_TOOL),
            disk_shell: PathBuf::from(crate::constants::DEFAULT_DISK_SHELL),
        }
    }
}

/// Tuning for virtual-disk mounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualDiskConfig {
    /// Wait between partition enumeration attempts, in milliseconds.
    pub settle_delay_ms: u64,
    /// Number of enumeration attempts after attaching a disk.
    pub settle_attempts: u32,
    /// Candidate drive letters, scanned in order.
    pub drive_letters: String,
}

impl Default for VirtualDiskConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: crate::constants::DEFAULT_SETTLE_DELAY_MS,
            settle_attempts: crate::constants::DEFAULT_SETTLE_ATTEMPTS,
            drive_letters: crate::constants::DRIVE_LETTER_CANDIDATES.to_string(),
        }
    }
}

impl VirtualDiskConfig {
    /// Returns the candidate letters, uppercased and de-duplicated.
    #[must_use]
    pub fn candidates(&self) -> Vec<char> {
        let mut letters = Vec::new();
        for c in self.drive_letters.chars().filter(char::is_ascii_alphabetic) {
            let c = c.to_ascii_uppercase();
            if !letters.contains(&c) {
                letters.push(c);
            }
        }
        letters
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: crate::constants::DEFAULT_LOG_FILTER.to_string(),
            json: false,
        }
    }
}
