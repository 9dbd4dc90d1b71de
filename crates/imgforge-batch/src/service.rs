//! Single-image mount service.
//!
//! Interactive collaborators mount one image at a time; the service keeps
//! the handles alive between calls and shares the mount registry with the
//! orchestrator, so the two cannot double-mount the same image.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use imgforge_common::error::{ForgeError, Result};
use imgforge_common::types::{HandleState, MountPoint};
use imgforge_image::handle::{DismountReport, ImageDescriptor, ImageHandle};
use imgforge_image::registry::{ReconcileReport, RegistryEntry};
use imgforge_image::services::MountServices;

/// Keeps interactively mounted images alive between calls.
pub struct ImageService {
    services: MountServices,
    handles: Mutex<HashMap<MountPoint, ImageHandle>>,
}

impl std::fmt::Debug for ImageService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageService")
            .field("services", &self.services)
            .finish_non_exhaustive()
    }
}

impl ImageService {
    /// Creates a service over shared mount services.
    #[must_use]
    pub fn new(services: MountServices) -> Self {
        Self {
            services,
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn handles(&self) -> Result<MutexGuard<'_, HashMap<MountPoint, ImageHandle>>> {
        self.handles.lock().map_err(|_| ForgeError::Config {
            message: "image service lock poisoned".into(),
        })
    }

    /// Mounts `index` of the image at `path` and keeps it mounted.
    ///
    /// # Errors
    ///
    /// Returns the mount failure; nothing is retained on error.
    pub fn mount(&self, path: impl AsRef<Path>, index: u32) -> Result<ImageDescriptor> {
        let mut handle = ImageHandle::open(path.as_ref(), self.services.clone())?;
        let mount_point = handle.mount(index)?;
        let descriptor = handle.get_info();
        tracing::info!(image = %path.as_ref().display(), mount_point = %mount_point, "image mounted");
        let _ = self.handles()?.insert(mount_point, handle);
        Ok(descriptor)
    }

    /// Dismounts the image at `mount_point`.
    ///
    /// A handle whose dismount fails is kept so the call can be repeated.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if this service did not mount it, or the dismount
    /// failure.
    pub fn unmount(&self, mount_point: &MountPoint, save: bool) -> Result<DismountReport> {
        // Taken out first: the tool call can run for minutes.
        let mut handle = self
            .handles()?
            .remove(mount_point)
            .ok_or_else(|| ForgeError::NotFound {
                kind: "mount",
                id: mount_point.to_string(),
            })?;
        match handle.dismount(save) {
            Ok(report) => {
                tracing::info!(mount_point = %mount_point, committed = report.committed, "image dismounted");
                Ok(report)
            }
            Err(e) => {
                if handle.state() == HandleState::Error || handle.mount_point().is_some() {
                    let _ = self.handles()?.insert(mount_point.clone(), handle);
                }
                Err(e)
            }
        }
    }

    /// Descriptors of the images this service holds, ordered by mount point.
    ///
    /// # Errors
    ///
    /// Returns an error if the service lock is poisoned.
    pub fn mounted(&self) -> Result<Vec<ImageDescriptor>> {
        let handles = self.handles()?;
        let mut descriptors: Vec<_> = handles.values().map(ImageHandle::get_info).collect();
        descriptors.sort_by(|a, b| a.mount_point.cmp(&b.mount_point));
        Ok(descriptors)
    }

    /// Every registered mount, including those held by batch workers.
    #[must_use]
    pub fn registry_entries(&self) -> Vec<RegistryEntry> {
        self.services.registry.entries()
    }

    /// Descriptor of an image without mounting it.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedFormat` for unknown extensions.
    pub fn info(&self, path: impl AsRef<Path>) -> Result<ImageDescriptor> {
        Ok(ImageHandle::open(path.as_ref(), self.services.clone())?.get_info())
    }

    /// Reconciles the shared registry with the host.
    ///
    /// # Errors
    ///
    /// Returns an error if the host cannot be probed.
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        self.services.reconcile()
    }
}
