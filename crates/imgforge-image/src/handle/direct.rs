//! Directly mountable containers: mount and unmount map onto the servicing
//! tool's verbs.

use std::path::{Path, PathBuf};

use imgforge_common::error::{ForgeError, Result};
use imgforge_common::types::{ImageFormat, MountPoint};

use super::{DismountReport, MountContext};
use crate::registry::RegistryEntry;

/// Image identity recorded in the registry when it differs from the file
/// actually mounted (a converted working copy).
#[derive(Debug, Clone)]
pub(super) struct Origin {
    pub(super) image: PathBuf,
    pub(super) index: u32,
    pub(super) format: ImageFormat,
}

#[derive(Debug, Default)]
pub(super) struct DirectDriver {
    pub(super) mount_dir: Option<PathBuf>,
    pub(super) origin: Option<Origin>,
}

impl DirectDriver {
    fn claim(&self, ctx: &MountContext<'_>) -> (PathBuf, u32, ImageFormat) {
        self.origin.as_ref().map_or_else(
            || (ctx.path.to_path_buf(), ctx.index, ctx.format),
            |o| (o.image.clone(), o.index, o.format),
        )
    }

    pub(super) fn preflight(&self, ctx: &MountContext<'_>) -> Result<()> {
        let (image, index, _) = self.claim(ctx);
        if let Some(existing) = ctx.services.registry.find_image(&image, index) {
            return Err(ForgeError::MountConflict {
                mount_point: existing.mount_point.to_string(),
                reason: format!("{} index {index} is already mounted", image.display()),
            });
        }
        Ok(())
    }

    pub(super) fn mount(&self, ctx: &MountContext<'_>) -> Result<MountPoint> {
        let dir = self
            .mount_dir
            .clone()
            .unwrap_or_else(|| ctx.services.settings.mount_root.join(ctx.id.as_str()));
        let mount_point = MountPoint::new(&dir);
        if ctx.services.registry.contains(&mount_point) {
            return Err(ForgeError::MountConflict {
                mount_point: mount_point.to_string(),
                reason: "mount point already claimed".into(),
            });
        }
        std::fs::create_dir_all(&dir).map_err(|e| ForgeError::io(&dir, e))?;

        if let Err(e) = ctx
            .services
            .tool
            .mount_image(ctx.path, ctx.index, &dir)
            .and_then(|out| out.check("mount-image"))
        {
            self.remove_own_dir(&dir);
            return Err(e);
        }

        let (image, index, format) = self.claim(ctx);
        let entry = RegistryEntry::new(mount_point.clone(), ctx.id.clone(), image, index, format);
        if let Err(e) = ctx.services.registry.register(entry) {
            tracing::warn!(mount_point = %mount_point, error = %e, "lost registration race, discarding mount");
            if let Err(undo) = ctx
                .services
                .tool
                .unmount_image(&dir, false)
                .and_then(|out| out.check("unmount-image"))
            {
                tracing::warn!(mount_point = %mount_point, error = %undo, "failed to undo mount");
            } else {
                self.remove_own_dir(&dir);
            }
            return Err(e);
        }
        Ok(mount_point)
    }

    pub(super) fn dismount(
        &self,
        ctx: &MountContext<'_>,
        mount_point: &MountPoint,
        save: bool,
    ) -> Result<DismountReport> {
        let dir = mount_point.as_path();
        let tool = &ctx.services.tool;
        let mut report = DismountReport {
            released: true,
            committed: false,
            save_error: None,
        };

        if save {
            match tool.unmount_image(dir, true).and_then(|out| out.check("unmount-image /commit")) {
                Ok(_) => report.committed = true,
                Err(e) => report.save_error = Some(e.to_string()),
            }
        }
        if !report.committed {
            let _ = tool
                .unmount_image(dir, false)?
                .check("unmount-image /discard")?;
        }

        let _ = ctx.services.registry.unregister(mount_point);
        self.remove_own_dir(dir);
        Ok(report)
    }

    /// Removes a generated mount directory; caller-supplied ones stay.
    fn remove_own_dir(&self, dir: &Path) {
        if self.mount_dir.is_some() {
            return;
        }
        if let Err(e) = std::fs::remove_dir(dir) {
            tracing::debug!(dir = %dir.display(), error = %e, "mount directory left in place");
        }
    }
}
