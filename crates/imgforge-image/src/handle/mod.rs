//! Image handles and the mount lifecycle.
//!
//! An [`ImageHandle`] binds one image file and sub-image index to a host
//! mount point. The format driver is chosen once when the handle is opened;
//! every driver follows the same state machine:
//!
//! ```text
//! NotMounted -> Mounting -> Mounted -> Dismounting -> NotMounted
//!                  \                       \
//!                   `-> Error               `-> Error
//! ```

mod compressed;
mod direct;
mod virtual_disk;

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use imgforge_common::error::{ForgeError, Result};
use imgforge_common::types::{HandleId, HandleState, ImageFormat, MountPoint};

use crate::services::MountServices;
use crate::tool::Compression;

use self::compressed::CompressedDriver;
use self::direct::DirectDriver;
use self::virtual_disk::VirtualDiskDriver;

/// Outcome of a dismount.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DismountReport {
    /// Whether the mount was released (false when the handle was not mounted).
    pub released: bool,
    /// Whether changes were persisted.
    pub committed: bool,
    /// Why saving failed, when a save was requested and did not happen.
    pub save_error: Option<String>,
}

/// One directory entry inside a mounted image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Entry name.
    pub name: String,
    /// Whether the entry is a directory.
    pub is_dir: bool,
    /// Size in bytes (zero for directories).
    pub size: u64,
}

/// Snapshot of a handle's file metadata and mount status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDescriptor {
    /// Handle identifier.
    pub id: HandleId,
    /// Image file path.
    pub path: PathBuf,
    /// Detected format.
    pub format: ImageFormat,
    /// Selected sub-image index.
    pub index: u32,
    /// Current lifecycle state.
    pub state: HandleState,
    /// Mount point while mounted.
    pub mount_point: Option<MountPoint>,
    /// Image file size, if the file exists.
    pub size_bytes: Option<u64>,
    /// Last modification time (RFC 3339), if available.
    pub modified: Option<String>,
    /// Attached disk number (virtual disks).
    pub disk_number: Option<u32>,
    /// Exposed partition number (virtual disks).
    pub partition_number: Option<u32>,
    /// Converted working copy (compressed containers).
    pub working_copy: Option<PathBuf>,
}

/// Inputs every driver needs for one mount or dismount.
pub(crate) struct MountContext<'a> {
    pub(crate) id: &'a HandleId,
    pub(crate) path: &'a Path,
    pub(crate) index: u32,
    pub(crate) format: ImageFormat,
    pub(crate) services: &'a MountServices,
}

#[derive(Debug)]
enum Driver {
    Direct(DirectDriver),
    Compressed(CompressedDriver),
    VirtualDisk(VirtualDiskDriver),
}

impl Driver {
    fn for_format(format: ImageFormat) -> Self {
        match format {
            ImageFormat::DirectContainer => Self::Direct(DirectDriver::default()),
            ImageFormat::CompressedContainer => Self::Compressed(CompressedDriver::default()),
            ImageFormat::VirtualDiskLegacy | ImageFormat::VirtualDiskModern => {
                Self::VirtualDisk(VirtualDiskDriver::default())
            }
        }
    }

    fn preflight(&mut self, ctx: &MountContext<'_>) -> Result<()> {
        match self {
            Self::Direct(d) => d.preflight(ctx),
            Self::Compressed(d) => d.preflight(ctx),
            Self::VirtualDisk(d) => d.preflight(ctx),
        }
    }

    fn mount(&mut self, ctx: &MountContext<'_>) -> Result<MountPoint> {
        match self {
            Self::Direct(d) => d.mount(ctx),
            Self::Compressed(d) => d.mount(ctx),
            Self::VirtualDisk(d) => d.mount(ctx),
        }
    }

    fn dismount(
        &mut self,
        ctx: &MountContext<'_>,
        mount_point: &MountPoint,
        save: bool,
    ) -> Result<DismountReport> {
        match self {
            Self::Direct(d) => d.dismount(ctx, mount_point, save),
            Self::Compressed(d) => d.dismount(save),
            Self::VirtualDisk(d) => d.dismount(ctx, mount_point, save),
        }
    }
}

/// In-process representation of one image's mount state.
#[derive(Debug)]
pub struct ImageHandle {
    id: HandleId,
    path: PathBuf,
    format: ImageFormat,
    index: u32,
    state: HandleState,
    mount_point: Option<MountPoint>,
    driver: Driver,
    services: MountServices,
}

impl ImageHandle {
    /// Opens a handle, detecting the format from the file extension.
    ///
    /// # Errors
    ///
    /// Returns `ForgeError::UnsupportedFormat` for unrecognized extensions.
    pub fn open(path: impl Into<PathBuf>, services: MountServices) -> Result<Self> {
        let path = path.into();
        let format = crate::format::detect(&path)?;
        Ok(Self::with_format(path, format, services))
    }

    /// Creates a handle for an image whose format is already known.
    #[must_use]
    pub fn with_format(path: impl Into<PathBuf>, format: ImageFormat, services: MountServices) -> Self {
        Self {
            id: HandleId::generate(),
            path: path.into(),
            format,
            index: 1,
            state: HandleState::NotMounted,
            mount_point: None,
            driver: Driver::for_format(format),
            services,
        }
    }

    /// Mounts container formats at `dir` instead of `<mount_root>/<id>`.
    ///
    /// Ignored by virtual disks, which are exposed through a drive letter.
    #[must_use]
    pub fn with_mount_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        match &mut self.driver {
            Driver::Direct(d) => d.mount_dir = Some(dir),
            Driver::Compressed(d) => d.mount_dir = Some(dir),
            Driver::VirtualDisk(_) => {
                tracing::debug!(path = %self.path.display(), "mount dir ignored for virtual disk");
            }
        }
        self
    }

    /// Exposes partition `number` of a virtual disk instead of the first
    /// mountable one. Ignored by container formats.
    #[must_use]
    pub fn with_partition(mut self, number: u32) -> Self {
        if let Driver::VirtualDisk(d) = &mut self.driver {
            d.wanted_partition = Some(number);
        }
        self
    }

    /// Handle identifier.
    #[must_use]
    pub const fn id(&self) -> &HandleId {
        &self.id
    }

    /// Image file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Image format.
    #[must_use]
    pub const fn format(&self) -> ImageFormat {
        self.format
    }

    /// Selected sub-image index.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> HandleState {
        self.state
    }

    /// Mount point, present only while mounted or dismounting.
    #[must_use]
    pub const fn mount_point(&self) -> Option<&MountPoint> {
        self.mount_point.as_ref()
    }

    /// Working copy of a compressed container, while mounted or after a
    /// saving dismount kept it.
    #[must_use]
    pub fn working_copy(&self) -> Option<&Path> {
        match &self.driver {
            Driver::Compressed(d) => d.working_copy(),
            _ => None,
        }
    }

    /// Mounts sub-image `index` (1-based).
    ///
    /// # Errors
    ///
    /// - `MountConflict` if the handle is already mounted or the target is
    ///   claimed by another handle.
    /// - `InvalidTransition` if the handle is mid-transition or in `Error`.
    /// - `EncryptedSourceNotSupported` for encrypted compressed sources; the
    ///   handle stays `NotMounted`.
    /// - `ToolInvocationFailure` if the servicing tool rejects the mount; the
    ///   handle moves to `Error`.
    pub fn mount(&mut self, index: u32) -> Result<MountPoint> {
        match self.state {
            HandleState::NotMounted => {}
            HandleState::Mounted => {
                return Err(ForgeError::MountConflict {
                    mount_point: self
                        .mount_point
                        .as_ref()
                        .map_or_else(|| self.path.display().to_string(), ToString::to_string),
                    reason: "handle is already mounted".into(),
                });
            }
            other => {
                return Err(ForgeError::InvalidTransition {
                    entity: "handle",
                    from: other.to_string(),
                    action: "mount",
                });
            }
        }
        if index == 0 {
            return Err(ForgeError::Config {
                message: "image index is 1-based".into(),
            });
        }

        self.index = index;
        let ctx = MountContext {
            id: &self.id,
            path: &self.path,
            index,
            format: self.format,
            services: &self.services,
        };
        self.driver.preflight(&ctx)?;

        self.state = HandleState::Mounting;
        tracing::info!(handle = %self.id, path = %self.path.display(), index, format = %self.format, "mounting image");
        match self.driver.mount(&ctx) {
            Ok(mount_point) => {
                tracing::info!(handle = %self.id, mount_point = %mount_point, "image mounted");
                self.mount_point = Some(mount_point.clone());
                self.state = HandleState::Mounted;
                Ok(mount_point)
            }
            Err(e) => {
                tracing::warn!(handle = %self.id, error = %e, "mount failed");
                self.state = HandleState::Error;
                Err(e)
            }
        }
    }

    /// Dismounts the image, persisting changes when `save` is set.
    ///
    /// A failed save still releases the mount; the failure is carried in
    /// the report. Calling this on a handle that is not mounted logs a
    /// warning and does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error, leaving the handle in `Error`, only when the mount
    /// could not be released.
    pub fn dismount(&mut self, save: bool) -> Result<DismountReport> {
        if self.state != HandleState::Mounted {
            tracing::warn!(handle = %self.id, state = %self.state, "dismount ignored: image is not mounted");
            return Ok(DismountReport::default());
        }
        let Some(mount_point) = self.mount_point.clone() else {
            self.state = HandleState::Error;
            return Err(ForgeError::NotMounted {
                path: self.path.clone(),
            });
        };

        self.state = HandleState::Dismounting;
        tracing::info!(handle = %self.id, mount_point = %mount_point, save, "dismounting image");
        let ctx = MountContext {
            id: &self.id,
            path: &self.path,
            index: self.index,
            format: self.format,
            services: &self.services,
        };
        let outcome = self.driver.dismount(&ctx, &mount_point, save);
        self.mount_point = None;
        match outcome {
            Ok(report) => {
                if let Some(reason) = &report.save_error {
                    tracing::warn!(handle = %self.id, error = %reason, "changes were not saved");
                }
                self.state = HandleState::NotMounted;
                Ok(report)
            }
            Err(e) => {
                tracing::error!(handle = %self.id, error = %e, "dismount failed");
                self.state = HandleState::Error;
                Err(e)
            }
        }
    }

    /// Lists the entries of a directory inside the mounted image, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns `NotMounted` outside the `Mounted` state, or an I/O error.
    pub fn list_files(&self, dir: impl AsRef<Path>) -> Result<Vec<FileEntry>> {
        let view = self.view()?;
        let target = view.resolve(dir.as_ref())?;
        let reader = std::fs::read_dir(&target).map_err(|e| ForgeError::io(&target, e))?;
        let mut entries = Vec::new();
        for entry in reader {
            let entry = entry.map_err(|e| ForgeError::io(&target, e))?;
            let meta = entry.metadata().map_err(|e| ForgeError::io(entry.path(), e))?;
            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: meta.is_dir(),
                size: if meta.is_dir() { 0 } else { meta.len() },
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Copies a host file into the mounted image.
    ///
    /// # Errors
    ///
    /// Returns `NotMounted` outside the `Mounted` state, or an I/O error.
    pub fn add_file(&self, source: &Path, dest: impl AsRef<Path>) -> Result<()> {
        let view = self.view()?;
        let target = view.resolve(dest.as_ref())?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ForgeError::io(parent, e))?;
        }
        let _ = std::fs::copy(source, &target).map_err(|e| ForgeError::io(source, e))?;
        tracing::debug!(handle = %self.id, dest = %target.display(), "file added");
        Ok(())
    }

    /// Removes a file or directory tree from the mounted image.
    ///
    /// # Errors
    ///
    /// Returns `NotMounted` outside the `Mounted` state, or an I/O error.
    pub fn remove_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let view = self.view()?;
        let target = view.resolve(path.as_ref())?;
        if target == view.mounted_root()? {
            return Err(ForgeError::Config {
                message: "refusing to remove the image root".into(),
            });
        }
        let removed = if target.is_dir() {
            std::fs::remove_dir_all(&target)
        } else {
            std::fs::remove_file(&target)
        };
        removed.map_err(|e| ForgeError::io(&target, e))?;
        tracing::debug!(handle = %self.id, path = %target.display(), "file removed");
        Ok(())
    }

    /// Copies a file out of the mounted image to a host path.
    ///
    /// # Errors
    ///
    /// Returns `NotMounted` outside the `Mounted` state, or an I/O error.
    pub fn extract_file(&self, source: impl AsRef<Path>, dest: &Path) -> Result<()> {
        let view = self.view()?;
        let origin = view.resolve(source.as_ref())?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ForgeError::io(parent, e))?;
        }
        let _ = std::fs::copy(&origin, dest).map_err(|e| ForgeError::io(&origin, e))?;
        Ok(())
    }

    /// Returns file metadata and mount status. Available in every state.
    #[must_use]
    pub fn get_info(&self) -> ImageDescriptor {
        let meta = std::fs::metadata(&self.path).ok();
        let (disk_number, partition_number) = match &self.driver {
            Driver::VirtualDisk(d) => (d.disk_number, d.partition_number),
            _ => (None, None),
        };
        ImageDescriptor {
            id: self.id.clone(),
            path: self.path.clone(),
            format: self.format,
            index: self.index,
            state: self.state,
            mount_point: self.mount_point.clone(),
            size_bytes: meta.as_ref().map(std::fs::Metadata::len),
            modified: meta
                .and_then(|m| m.modified().ok())
                .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339()),
            disk_number,
            partition_number,
            working_copy: self.working_copy().map(Path::to_path_buf),
        }
    }

    /// Re-encodes a kept working copy into `destination`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless the handle is `NotMounted`,
    /// `NotFound` if there is no kept working copy, or the tool failure.
    pub fn export_working_copy(&self, destination: &Path, compression: Compression) -> Result<()> {
        if self.state != HandleState::NotMounted {
            return Err(ForgeError::InvalidTransition {
                entity: "handle",
                from: self.state.to_string(),
                action: "export",
            });
        }
        let kept = match &self.driver {
            Driver::Compressed(d) => d.kept.as_deref(),
            _ => None,
        }
        .ok_or_else(|| ForgeError::NotFound {
            kind: "working copy",
            id: self.path.display().to_string(),
        })?;
        let _ = self
            .services
            .tool
            .export_image(kept, 1, destination, compression)?
            .check("export-image")?;
        tracing::info!(handle = %self.id, destination = %destination.display(), "working copy exported");
        Ok(())
    }

    /// Handle whose filesystem view backs file operations.
    fn view(&self) -> Result<&Self> {
        let _ = self.mounted_root()?;
        match &self.driver {
            Driver::Compressed(d) => d.inner().ok_or_else(|| ForgeError::NotMounted {
                path: self.path.clone(),
            }),
            _ => Ok(self),
        }
    }

    fn mounted_root(&self) -> Result<&Path> {
        match (&self.state, &self.mount_point) {
            (HandleState::Mounted, Some(mp)) => Ok(mp.as_path()),
            _ => Err(ForgeError::NotMounted {
                path: self.path.clone(),
            }),
        }
    }

    /// Joins `relative` onto the mount root, rejecting escapes.
    fn resolve(&self, relative: &Path) -> Result<PathBuf> {
        let mut target = self.mounted_root()?.to_path_buf();
        for component in relative.components() {
            match component {
                Component::Normal(part) => target.push(part),
                Component::CurDir | Component::RootDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(ForgeError::Config {
                        message: format!("path escapes the image root: {}", relative.display()),
                    });
                }
            }
        }
        Ok(target)
    }
}

impl Drop for ImageHandle {
    fn drop(&mut self) {
        if self.state != HandleState::Mounted {
            return;
        }
        tracing::warn!(handle = %self.id, "handle dropped while mounted, discarding changes");
        if let Err(e) = self.dismount(false) {
            tracing::warn!(handle = %self.id, error = %e, "failed to release mount on drop");
        }
    }
}
