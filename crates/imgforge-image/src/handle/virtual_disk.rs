//! Virtual disks are attached through the host disk facility and exposed
//! through a drive letter.

use imgforge_common::error::{ForgeError, Result};
use imgforge_common::types::MountPoint;

use super::{DismountReport, MountContext};
use crate::disk::{PartitionInfo, select_partition};
use crate::registry::RegistryEntry;

#[derive(Debug, Default)]
pub(super) struct VirtualDiskDriver {
    pub(super) wanted_partition: Option<u32>,
    pub(super) disk_number: Option<u32>,
    pub(super) partition_number: Option<u32>,
}

impl VirtualDiskDriver {
    pub(super) fn preflight(&self, ctx: &MountContext<'_>) -> Result<()> {
        if let Some(existing) = ctx.services.registry.find_image(ctx.path, ctx.index) {
            return Err(ForgeError::MountConflict {
                mount_point: existing.mount_point.to_string(),
                reason: format!("{} is already attached", ctx.path.display()),
            });
        }
        Ok(())
    }

    pub(super) fn mount(&mut self, ctx: &MountContext<'_>) -> Result<MountPoint> {
        let disks = &ctx.services.disks;
        let disk = disks.attach(ctx.path)?;
        tracing::debug!(path = %ctx.path.display(), disk, "virtual disk attached");

        match self.expose(ctx, disk) {
            Ok(mount_point) => Ok(mount_point),
            Err(e) => {
                if let Err(detach) = disks.detach(ctx.path) {
                    tracing::warn!(path = %ctx.path.display(), error = %detach, "failed to detach after mount failure");
                }
                Err(e)
            }
        }
    }

    /// Waits for the partition table, picks a partition, and gives it a letter.
    fn expose(&mut self, ctx: &MountContext<'_>, disk: u32) -> Result<MountPoint> {
        let services = ctx.services;
        let partition = self.settle(ctx, disk)?;

        let (letter, reserved) = if let Some(letter) = partition.drive_letter {
            (letter, false)
        } else {
            let in_use = services.disks.drive_letters_in_use()?;
            let letter = services
                .registry
                .claim_drive_letter(&services.settings.drive_letters, &in_use)?;
            if let Err(e) = services
                .disks
                .assign_drive_letter(disk, partition.number, letter)
            {
                services.registry.release_drive_letter(letter);
                return Err(e);
            }
            tracing::debug!(disk, partition = partition.number, letter = %letter, "drive letter assigned");
            (letter, true)
        };

        let mount_point = MountPoint::drive(letter);
        let entry = RegistryEntry::new(
            mount_point.clone(),
            ctx.id.clone(),
            ctx.path,
            ctx.index,
            ctx.format,
        );
        if let Err(e) = services.registry.register(entry) {
            if reserved {
                services.registry.release_drive_letter(letter);
            }
            return Err(e);
        }

        self.disk_number = Some(disk);
        self.partition_number = Some(partition.number);
        Ok(mount_point)
    }

    fn settle(&self, ctx: &MountContext<'_>, disk: u32) -> Result<PartitionInfo> {
        let settings = &ctx.services.settings;
        let mut partitions = Vec::new();
        for attempt in 1..=settings.settle_attempts {
            std::thread::sleep(settings.settle_delay);
            partitions = ctx.services.disks.partitions(disk)?;
            if let Some(found) = select_partition(&partitions, self.wanted_partition) {
                return Ok(found.clone());
            }
            tracing::debug!(disk, attempt, seen = partitions.len(), "waiting for partitions");
        }
        Err(ForgeError::NotFound {
            kind: "partition",
            id: format!(
                "disk {disk} ({} partitions, wanted {})",
                partitions.len(),
                self.wanted_partition
                    .map_or_else(|| "first mountable".to_string(), |n| n.to_string())
            ),
        })
    }

    /// Detaches the disk. Virtual disks persist writes as they happen, so
    /// there is no separate save step and `save = false` cannot roll back.
    pub(super) fn dismount(
        &mut self,
        ctx: &MountContext<'_>,
        mount_point: &MountPoint,
        save: bool,
    ) -> Result<DismountReport> {
        if !save {
            tracing::warn!(path = %ctx.path.display(), "virtual disk changes are already persisted and cannot be discarded");
        }
        ctx.services.disks.detach(ctx.path)?;
        let _ = ctx.services.registry.unregister(mount_point);
        self.disk_number = None;
        self.partition_number = None;
        Ok(DismountReport {
            released: true,
            committed: true,
            save_error: None,
        })
    }
}
