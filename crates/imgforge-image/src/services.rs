//! Shared collaborators injected into every image handle.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use imgforge_common::config::ForgeConfig;
use imgforge_common::error::Result;
use imgforge_common::types::MountPoint;

use crate::disk::{DiskFacility, PowerShellDisks};
use crate::hive::HiveManager;
use crate::registry::{MountProbe, MountRegistry, ReconcileReport};
use crate::tool::{DismTool, ServicingTool};

/// Mount tuning shared by all handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSettings {
    /// Root under which per-handle mount directories are created.
    pub mount_root: PathBuf,
    /// Directory for converted working copies.
    pub work_dir: PathBuf,
    /// Wait between partition enumeration attempts.
    pub settle_delay: Duration,
    /// Enumeration attempts after attaching a virtual disk.
    pub settle_attempts: u32,
    /// Candidate drive letters, in scan order.
    pub drive_letters: Vec<char>,
}

impl MountSettings {
    /// Extracts the mount settings from the global configuration.
    #[must_use]
    pub fn from_config(config: &ForgeConfig) -> Self {
        Self {
            mount_root: config.mount_root.clone(),
            work_dir: config.work_dir.clone(),
            settle_delay: Duration::from_millis(config.virtual_disk.settle_delay_ms),
            settle_attempts: config.virtual_disk.settle_attempts.max(1),
            drive_letters: config.virtual_disk.candidates(),
        }
    }
}

/// Tool adapters, the mount registry, and the hive manager, bundled for
/// cheap cloning into handles and workers.
#[derive(Clone)]
pub struct MountServices {
    /// External servicing tool.
    pub tool: Arc<dyn ServicingTool>,
    /// Host disk-image facility.
    pub disks: Arc<dyn DiskFacility>,
    /// Mount point table.
    pub registry: Arc<MountRegistry>,
    /// Offline hive manager.
    pub hives: Arc<HiveManager>,
    /// Mount tuning.
    pub settings: Arc<MountSettings>,
}

impl std::fmt::Debug for MountServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountServices")
            .field("registry", &self.registry)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl MountServices {
    /// Bundles the given collaborators with a fresh registry.
    #[must_use]
    pub fn new(
        tool: Arc<dyn ServicingTool>,
        disks: Arc<dyn DiskFacility>,
        settings: MountSettings,
    ) -> Self {
        let hives = Arc::new(HiveManager::new(Arc::clone(&tool)));
        Self {
            tool,
            disks,
            registry: Arc::new(MountRegistry::new()),
            hives,
            settings: Arc::new(settings),
        }
    }

    /// Builds process-backed services from the configuration.
    #[must_use]
    pub fn from_config(config: &ForgeConfig) -> Self {
        let tool = DismTool::from_config(&config.tools);
        if !tool.is_available() {
            tracing::warn!(tool = %config.tools.servicing.display(), "servicing tool not found on PATH");
        }
        Self::new(
            Arc::new(tool),
            Arc::new(PowerShellDisks::new(&config.tools.disk_shell)),
            MountSettings::from_config(config),
        )
    }

    /// Reconciles the registry against the host's live mounts.
    ///
    /// # Errors
    ///
    /// Returns an error if the host cannot be queried.
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        self.registry.reconcile(self)
    }
}

impl MountProbe for MountServices {
    fn live_mounts(&self) -> Result<Vec<MountPoint>> {
        let mut live: Vec<MountPoint> = self
            .tool
            .mounted_images()?
            .into_iter()
            .map(MountPoint::new)
            .collect();
        live.extend(self.disks.virtual_disk_mounts()?);
        Ok(live)
    }
}
