//! Scoped loading of offline registry hives.
//!
//! A hive key is an exclusive resource: while a [`HiveGuard`] for a key is
//! alive, other loaders of the same key block. The guard unloads the hive
//! when dropped, so the unload runs on every exit path, unwinding included.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use imgforge_common::error::{ForgeError, Result};

use crate::tool::ServicingTool;

/// Standard hive files inside a mounted Windows image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineHive {
    /// `HKLM\SOFTWARE`.
    Software,
    /// `HKLM\SYSTEM`.
    System,
    /// `HKLM\SECURITY`.
    Security,
    /// `HKLM\SAM`.
    Sam,
    /// `HKU\.DEFAULT`.
    Default,
    /// Profile hive applied to newly created users.
    DefaultUser,
}

impl OfflineHive {
    /// Path of the hive file relative to the image root.
    #[must_use]
    pub const fn relative_path(self) -> &'static str {
        match self {
            Self::Software => "Windows/System32/config/SOFTWARE",
            Self::System => "Windows/System32/config/SYSTEM",
            Self::Security => "Windows/System32/config/SECURITY",
            Self::Sam => "Windows/System32/config/SAM",
            Self::Default => "Windows/System32/config/DEFAULT",
            Self::DefaultUser => "Users/Default/NTUSER.DAT",
        }
    }

    /// Key name the hive is conventionally loaded under.
    #[must_use]
    pub const fn default_key(self) -> &'static str {
        match self {
            Self::Software => "OFFLINE_SOFTWARE",
            Self::System => "OFFLINE_SYSTEM",
            Self::Security => "OFFLINE_SECURITY",
            Self::Sam => "OFFLINE_SAM",
            Self::Default => "OFFLINE_DEFAULT",
            Self::DefaultUser => "OFFLINE_NTUSER",
        }
    }

    /// Resolves the hive file under a mount point.
    #[must_use]
    pub fn file_in(self, mount_root: &Path) -> PathBuf {
        self.relative_path()
            .split('/')
            .fold(mount_root.to_path_buf(), |path, part| path.join(part))
    }
}

/// Loads hives through the servicing tool with per-key exclusivity.
pub struct HiveManager {
    tool: Arc<dyn ServicingTool>,
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl std::fmt::Debug for HiveManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HiveManager")
            .field("held", &self.held)
            .finish_non_exhaustive()
    }
}

impl HiveManager {
    /// Creates a manager over the given tool.
    #[must_use]
    pub fn new(tool: Arc<dyn ServicingTool>) -> Self {
        Self {
            tool,
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        }
    }

    /// Loads `hive_file` under `HKLM\<key>`, waiting while another guard
    /// holds the same key.
    ///
    /// # Errors
    ///
    /// Returns `ForgeError::ToolInvocationFailure` if the load verb fails,
    /// or a `Config` error if the key table lock is poisoned.
    pub fn load(&self, hive_file: &Path, key: &str) -> Result<HiveGuard<'_>> {
        let slot = key.to_ascii_uppercase();
        {
            let mut held = self.held.lock().map_err(|_| ForgeError::Config {
                message: "hive key lock poisoned".into(),
            })?;
            while held.contains(&slot) {
                tracing::debug!(key, "waiting for hive key");
                held = self.released.wait(held).map_err(|_| ForgeError::Config {
                    message: "hive key lock poisoned".into(),
                })?;
            }
            let _ = held.insert(slot.clone());
        }

        let loaded = self
            .tool
            .load_hive(hive_file, key)
            .and_then(|out| out.check("reg load"));
        if let Err(e) = loaded {
            self.release(&slot);
            return Err(e);
        }
        tracing::debug!(key, hive = %hive_file.display(), "hive loaded");
        Ok(HiveGuard {
            manager: self,
            key: key.to_string(),
            slot,
        })
    }

    /// Loads a hive, runs `f`, and unloads the hive whatever `f` returns.
    ///
    /// # Errors
    ///
    /// Returns the load error or the error returned by `f`.
    pub fn with_hive<T>(
        &self,
        hive_file: &Path,
        key: &str,
        f: impl FnOnce(&HiveGuard<'_>) -> Result<T>,
    ) -> Result<T> {
        let guard = self.load(hive_file, key)?;
        f(&guard)
    }

    /// Returns the keys currently held.
    #[must_use]
    pub fn held_keys(&self) -> Vec<String> {
        let held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<_> = held.iter().cloned().collect();
        keys.sort();
        keys
    }

    fn release(&self, slot: &str) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = held.remove(slot);
        drop(held);
        self.released.notify_all();
    }
}

/// A loaded hive; unloads on drop.
#[derive(Debug)]
pub struct HiveGuard<'a> {
    manager: &'a HiveManager,
    key: String,
    slot: String,
}

impl HiveGuard<'_> {
    /// Key name the hive is loaded under.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Full registry root of the loaded hive (`HKLM\<key>`).
    #[must_use]
    pub fn root(&self) -> String {
        format!("HKLM\\{}", self.key)
    }
}

impl Drop for HiveGuard<'_> {
    fn drop(&mut self) {
        let unloaded = self
            .manager
            .tool
            .unload_hive(&self.key)
            .and_then(|out| out.check("reg unload"));
        match unloaded {
            Ok(_) => tracing::debug!(key = %self.key, "hive unloaded"),
            Err(e) => tracing::warn!(key = %self.key, error = %e, "failed to unload hive"),
        }
        self.manager.release(&self.slot);
    }
}
