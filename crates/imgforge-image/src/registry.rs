//! Process-wide table of active mount points.
//!
//! The registry is an explicitly owned object shared through
//! [`MountServices`](crate::services::MountServices); tests construct
//! isolated instances. All operations take the same lock, so register,
//! unregister, drive-letter claims, and reconcile are mutually exclusive.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use imgforge_common::error::{ForgeError, Result};
use imgforge_common::types::{HandleId, ImageFormat, MountPoint};

/// One claimed mount point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    /// Claimed mount point.
    pub mount_point: MountPoint,
    /// Handle that owns the mount.
    pub handle: HandleId,
    /// Image mounted there.
    pub image: PathBuf,
    /// Sub-image index.
    pub index: u32,
    /// Format of the mounted image.
    pub format: ImageFormat,
    /// RFC 3339 registration time.
    pub registered_at: String,
}

impl RegistryEntry {
    /// Creates an entry stamped with the current time.
    #[must_use]
    pub fn new(
        mount_point: MountPoint,
        handle: HandleId,
        image: impl Into<PathBuf>,
        index: u32,
        format: ImageFormat,
    ) -> Self {
        Self {
            mount_point,
            handle,
            image: image.into(),
            index,
            format,
            registered_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Source of the mounts the host actually has live.
pub trait MountProbe {
    /// Returns every live mount point on the host.
    ///
    /// # Errors
    ///
    /// Returns an error if the host cannot be queried.
    fn live_mounts(&self) -> Result<Vec<MountPoint>>;
}

/// Outcome of [`MountRegistry::reconcile`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Entries dropped because the host no longer has them mounted.
    pub dropped: Vec<RegistryEntry>,
    /// Live host mounts that no entry owns; reported, never adopted.
    pub unowned: Vec<MountPoint>,
}

impl ReconcileReport {
    /// Returns whether the registry and the host agreed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.dropped.is_empty() && self.unowned.is_empty()
    }

    /// Returns one `OrphanedMount` error per unowned host mount.
    #[must_use]
    pub fn orphans(&self) -> Vec<ForgeError> {
        self.unowned
            .iter()
            .map(|mp| ForgeError::OrphanedMount {
                mount_point: mp.to_string(),
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    entries: HashMap<MountPoint, RegistryEntry>,
    reserved_letters: HashSet<char>,
}

impl RegistryState {
    fn letter_taken(&self, letter: char) -> bool {
        self.reserved_letters.contains(&letter)
            || self
                .entries
                .keys()
                .any(|mp| mp.drive_letter() == Some(letter))
    }
}

/// Table of active mount points.
#[derive(Debug, Default)]
pub struct MountRegistry {
    state: Mutex<RegistryState>,
}

impl MountRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, RegistryState>> {
        self.state.lock().map_err(|_| ForgeError::Config {
            message: "mount registry lock poisoned".into(),
        })
    }

    /// Claims a mount point for a handle.
    ///
    /// # Errors
    ///
    /// Returns `ForgeError::MountConflict` if the mount point is already
    /// registered, or if the same image index is mounted elsewhere.
    pub fn register(&self, entry: RegistryEntry) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(existing) = state.entries.get(&entry.mount_point) {
            return Err(ForgeError::MountConflict {
                mount_point: entry.mount_point.to_string(),
                reason: format!("already claimed by handle {}", existing.handle),
            });
        }
        if let Some(existing) = state
            .entries
            .values()
            .find(|e| e.image == entry.image && e.index == entry.index)
        {
            return Err(ForgeError::MountConflict {
                mount_point: existing.mount_point.to_string(),
                reason: format!(
                    "{} index {} is already mounted",
                    entry.image.display(),
                    entry.index
                ),
            });
        }
        if let Some(letter) = entry.mount_point.drive_letter() {
            let _ = state.reserved_letters.remove(&letter);
        }
        tracing::debug!(
            mount_point = %entry.mount_point,
            handle = %entry.handle,
            "mount point registered"
        );
        let _ = state.entries.insert(entry.mount_point.clone(), entry);
        Ok(())
    }

    /// Releases a mount point. Removing an absent entry is a no-op.
    pub fn unregister(&self, mount_point: &MountPoint) -> Option<RegistryEntry> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(letter) = mount_point.drive_letter() {
            let _ = state.reserved_letters.remove(&letter);
        }
        let removed = state.entries.remove(mount_point);
        if removed.is_some() {
            tracing::debug!(mount_point = %mount_point, "mount point unregistered");
        }
        removed
    }

    /// Returns whether a mount point is claimed.
    #[must_use]
    pub fn contains(&self, mount_point: &MountPoint) -> bool {
        self.lock()
            .is_ok_and(|state| state.entries.contains_key(mount_point))
    }

    /// Looks up the entry holding `index` of `image`.
    #[must_use]
    pub fn find_image(&self, image: &Path, index: u32) -> Option<RegistryEntry> {
        let state = self.lock().ok()?;
        state
            .entries
            .values()
            .find(|e| e.image == image && e.index == index)
            .cloned()
    }

    /// Returns a snapshot of all entries, ordered by mount point.
    #[must_use]
    pub fn entries(&self) -> Vec<RegistryEntry> {
        let Ok(state) = self.lock() else {
            return Vec::new();
        };
        let mut entries: Vec<_> = state.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.mount_point.cmp(&b.mount_point));
        entries
    }

    /// Reserves the first candidate drive letter that is neither in use on
    /// the host nor held by this registry.
    ///
    /// The reservation lasts until the letter's mount point is registered
    /// and later unregistered, or until [`release_drive_letter`](Self::release_drive_letter).
    ///
    /// # Errors
    ///
    /// Returns `ForgeError::MountConflict` if every candidate is taken.
    pub fn claim_drive_letter(&self, candidates: &[char], host_in_use: &[char]) -> Result<char> {
        let mut state = self.lock()?;
        let letter = candidates
            .iter()
            .map(char::to_ascii_uppercase)
            .find(|c| {
                !host_in_use.iter().any(|h| h.eq_ignore_ascii_case(c)) && !state.letter_taken(*c)
            })
            .ok_or_else(|| ForgeError::MountConflict {
                mount_point: "drive letters".into(),
                reason: "no unused drive letter available".into(),
            })?;
        let _ = state.reserved_letters.insert(letter);
        tracing::debug!(letter = %letter, "drive letter reserved");
        Ok(letter)
    }

    /// Drops a drive-letter reservation that was never registered.
    pub fn release_drive_letter(&self, letter: char) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = state.reserved_letters.remove(&letter.to_ascii_uppercase());
    }

    /// Compares the registry with the host's live mounts.
    ///
    /// Entries the host no longer has are dropped. Live mounts without an
    /// entry are reported as orphans and left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the probe fails or the registry lock is poisoned.
    pub fn reconcile(&self, probe: &dyn MountProbe) -> Result<ReconcileReport> {
        let live: HashSet<MountPoint> = probe.live_mounts()?.into_iter().collect();
        let mut state = self.lock()?;

        let stale: Vec<MountPoint> = state
            .entries
            .keys()
            .filter(|mp| !live.contains(*mp))
            .cloned()
            .collect();
        let mut report = ReconcileReport::default();
        for mp in stale {
            if let Some(entry) = state.entries.remove(&mp) {
                tracing::warn!(mount_point = %mp, handle = %entry.handle, "dropping stale registry entry");
                report.dropped.push(entry);
            }
        }

        report.unowned = live
            .into_iter()
            .filter(|mp| !state.entries.contains_key(mp))
            .collect();
        report.unowned.sort();
        drop(state);

        for orphan in report.orphans() {
            tracing::warn!(error = %orphan, "host mount not owned by registry");
        }
        Ok(report)
    }
}
