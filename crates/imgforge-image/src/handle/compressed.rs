//! Compressed containers are exported to a temporary direct container and
//! mounted through an inner handle.

use std::path::{Path, PathBuf};

use imgforge_common::error::{ForgeError, Result};
use imgforge_common::types::{ImageFormat, MountPoint};

use super::direct::Origin;
use super::{DismountReport, Driver, ImageHandle, MountContext};
use crate::tool::Compression;
use crate::workcopy::WorkingCopy;

#[derive(Debug, Default)]
pub(super) struct CompressedDriver {
    pub(super) mount_dir: Option<PathBuf>,
    /// Working copy kept by the last saving dismount. A later mount leaves
    /// it in place; only a later saving dismount replaces it.
    pub(super) kept: Option<PathBuf>,
    /// Mounts started on this handle, used to name working copies.
    mounts: u32,
    working: Option<WorkingCopy>,
    inner: Option<Box<ImageHandle>>,
}

impl CompressedDriver {
    pub(super) fn inner(&self) -> Option<&ImageHandle> {
        self.inner.as_deref()
    }

    pub(super) fn working_copy(&self) -> Option<&Path> {
        self.working
            .as_ref()
            .map(WorkingCopy::path)
            .or(self.kept.as_deref())
    }

    /// Rejects encrypted sources and unknown indexes before any state change.
    pub(super) fn preflight(&self, ctx: &MountContext<'_>) -> Result<()> {
        if let Some(existing) = ctx.services.registry.find_image(ctx.path, ctx.index) {
            return Err(ForgeError::MountConflict {
                mount_point: existing.mount_point.to_string(),
                reason: format!("{} index {} is already mounted", ctx.path.display(), ctx.index),
            });
        }
        let info = ctx.services.tool.inspect(ctx.path)?;
        if info.encrypted {
            tracing::warn!(path = %ctx.path.display(), "compressed source is encrypted");
            return Err(ForgeError::EncryptedSourceNotSupported {
                path: ctx.path.to_path_buf(),
            });
        }
        if !info.indexes.is_empty() && !info.indexes.iter().any(|i| i.index == ctx.index) {
            return Err(ForgeError::NotFound {
                kind: "image index",
                id: format!("{}#{}", ctx.path.display(), ctx.index),
            });
        }
        Ok(())
    }

    pub(super) fn mount(&mut self, ctx: &MountContext<'_>) -> Result<MountPoint> {
        let copy = WorkingCopy::reserve(&ctx.services.settings.work_dir, ctx.id, self.mounts)?;
        self.mounts += 1;
        tracing::info!(
            source = %ctx.path.display(),
            index = ctx.index,
            working_copy = %copy.path().display(),
            "converting compressed source"
        );
        let _ = ctx
            .services
            .tool
            .export_image(ctx.path, ctx.index, copy.path(), Compression::Max)?
            .check("export-image")?;

        let direct = super::direct::DirectDriver {
            mount_dir: self.mount_dir.clone(),
            origin: Some(Origin {
                image: ctx.path.to_path_buf(),
                index: ctx.index,
                format: ImageFormat::CompressedContainer,
            }),
        };
        let mut inner = ImageHandle::with_format(
            copy.path(),
            ImageFormat::DirectContainer,
            ctx.services.clone(),
        );
        inner.driver = Driver::Direct(direct);
        let mount_point = inner.mount(1)?;

        if let Some(kept) = &self.kept {
            tracing::debug!(working_copy = %kept.display(), "earlier saved copy left in place");
        }
        self.working = Some(copy);
        self.inner = Some(Box::new(inner));
        Ok(mount_point)
    }

    pub(super) fn dismount(&mut self, save: bool) -> Result<DismountReport> {
        let Some(mut inner) = self.inner.take() else {
            return Err(ForgeError::NotMounted {
                path: self
                    .working
                    .as_ref()
                    .map_or_else(PathBuf::new, |w| w.path().to_path_buf()),
            });
        };
        let report = match inner.dismount(save) {
            Ok(report) => report,
            Err(e) => {
                self.inner = Some(inner);
                return Err(e);
            }
        };
        drop(inner);

        if let Some(copy) = self.working.take() {
            if report.committed {
                let path = copy.keep();
                tracing::info!(working_copy = %path.display(), "modified working copy kept");
                self.kept = Some(path);
            }
        }
        Ok(report)
    }
}
