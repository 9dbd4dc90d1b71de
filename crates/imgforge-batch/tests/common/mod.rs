//! Fakes and helpers shared by the orchestrator tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use imgforge_batch::batch::BatchStatus;
use imgforge_batch::orchestrator::Orchestrator;
use imgforge_batch::store::{BatchStore, MemoryStore};
use imgforge_batch::transform::{FnTransform, TransformCatalog, TransformContext};
use imgforge_common::error::{ForgeError, Result};
use imgforge_common::types::{BatchId, MountPoint};
use imgforge_image::disk::{DiskFacility, PartitionInfo};
use imgforge_image::services::{MountServices, MountSettings};
use imgforge_image::tool::{Compression, ImageIndex, ImageInfo, ServicingTool, ToolOutput};

fn name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[derive(Default)]
struct Mounts {
    active: HashSet<PathBuf>,
    peak: usize,
}

/// Servicing tool that records verbs, tracks concurrent mounts, and fails
/// mounts of chosen images a set number of times.
#[derive(Default)]
pub struct FakeTool {
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, u32>>,
    encrypted: Mutex<HashSet<String>>,
    mounts: Mutex<Mounts>,
    unmount_gate: Mutex<Option<Arc<Gate>>>,
    pub fail_commit: AtomicBool,
}

impl FakeTool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every mount of `file_name` fails until [`allow`](Self::allow).
    pub fn fail_mount_of(&self, file_name: &str) {
        self.fail_mount_times(file_name, u32::MAX);
    }

    pub fn fail_mount_times(&self, file_name: &str, times: u32) {
        let _ = self.failures.lock().unwrap().insert(file_name.to_string(), times);
    }

    pub fn allow(&self, file_name: &str) {
        let _ = self.failures.lock().unwrap().remove(file_name);
    }

    pub fn mark_encrypted(&self, file_name: &str) {
        let _ = self.encrypted.lock().unwrap().insert(file_name.to_string());
    }

    /// Every later unmount waits at `gate` before returning.
    pub fn hold_unmounts(&self, gate: Arc<Gate>) {
        *self.unmount_gate.lock().unwrap() = Some(gate);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Image names in the order they were mounted.
    pub fn mount_order(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| c.strip_prefix("mount ").map(|rest| rest.split(' ').next().unwrap_or_default().to_string()))
            .collect()
    }

    pub fn mounts_of(&self, file_name: &str) -> usize {
        self.mount_order().iter().filter(|n| *n == file_name).count()
    }

    pub fn unmounts(&self, mode: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with("unmount ") && c.ends_with(mode))
            .count()
    }

    pub fn peak_mounts(&self) -> usize {
        self.mounts.lock().unwrap().peak
    }

    pub fn active_mounts(&self) -> usize {
        self.mounts.lock().unwrap().active.len()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl ServicingTool for FakeTool {
    fn mount_image(&self, image: &Path, index: u32, mount_dir: &Path) -> Result<ToolOutput> {
        let name = name_of(image);
        self.record(format!("mount {name} {index}"));
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(&name) {
                if *left > 0 {
                    *left -= 1;
                    return Ok(ToolOutput::failed(5, "Error: 5\nAccess is denied."));
                }
            }
        }
        let mut mounts = self.mounts.lock().unwrap();
        let _ = mounts.active.insert(mount_dir.to_path_buf());
        mounts.peak = mounts.peak.max(mounts.active.len());
        Ok(ToolOutput::ok("The operation completed successfully."))
    }

    fn unmount_image(&self, mount_dir: &Path, commit: bool) -> Result<ToolOutput> {
        self.record(format!(
            "unmount {} {}",
            name_of(mount_dir),
            if commit { "commit" } else { "discard" }
        ));
        let gate = self.unmount_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.pass(name_of(mount_dir));
        }
        if commit && self.fail_commit.load(Ordering::SeqCst) {
            return Ok(ToolOutput::failed(-2_147_467_259, "Error: 0x80004005"));
        }
        let _ = self.mounts.lock().unwrap().active.remove(mount_dir);
        Ok(ToolOutput::ok("The operation completed successfully."))
    }

    fn export_image(
        &self,
        source: &Path,
        index: u32,
        destination: &Path,
        _compression: Compression,
    ) -> Result<ToolOutput> {
        self.record(format!("export {} {index}", name_of(source)));
        std::fs::write(destination, b"exported").unwrap();
        Ok(ToolOutput::ok("The operation completed successfully."))
    }

    fn inspect(&self, image: &Path) -> Result<ImageInfo> {
        let name = name_of(image);
        if self.encrypted.lock().unwrap().contains(&name) {
            return Ok(ImageInfo {
                indexes: Vec::new(),
                encrypted: true,
            });
        }
        Ok(ImageInfo {
            indexes: vec![ImageIndex {
                index: 1,
                name: "Pro".into(),
                size_bytes: None,
            }],
            encrypted: false,
        })
    }

    fn load_hive(&self, _hive_file: &Path, key: &str) -> Result<ToolOutput> {
        self.record(format!("load {key}"));
        Ok(ToolOutput::ok(""))
    }

    fn unload_hive(&self, key: &str) -> Result<ToolOutput> {
        self.record(format!("unload {key}"));
        Ok(ToolOutput::ok(""))
    }

    fn mounted_images(&self) -> Result<Vec<PathBuf>> {
        Ok(self.mounts.lock().unwrap().active.iter().cloned().collect())
    }
}

/// Disk facility for runs that never touch virtual disks.
pub struct NoDisks;

impl DiskFacility for NoDisks {
    fn attach(&self, path: &Path) -> Result<u32> {
        Err(ForgeError::UnsupportedFormat {
            path: path.to_path_buf(),
        })
    }
    fn detach(&self, _: &Path) -> Result<()> {
        Ok(())
    }
    fn partitions(&self, _: u32) -> Result<Vec<PartitionInfo>> {
        Ok(Vec::new())
    }
    fn drive_letters_in_use(&self) -> Result<Vec<char>> {
        Ok(Vec::new())
    }
    fn assign_drive_letter(&self, _: u32, _: u32, _: char) -> Result<()> {
        Ok(())
    }
    fn virtual_disk_mounts(&self) -> Result<Vec<MountPoint>> {
        Ok(Vec::new())
    }
}

pub fn services(root: &Path, tool: &Arc<FakeTool>) -> MountServices {
    MountServices::new(
        Arc::clone(tool) as Arc<dyn ServicingTool>,
        Arc::new(NoDisks),
        MountSettings {
            mount_root: root.join("mounts"),
            work_dir: root.join("work"),
            settle_delay: Duration::ZERO,
            settle_attempts: 1,
            drive_letters: vec!['X', 'Y'],
        },
    )
}

/// Blocks transforms until opened, remembering which images entered.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    opened: Condvar,
    entered: Mutex<Vec<String>>,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.opened.notify_all();
    }

    pub fn entered(&self) -> Vec<String> {
        self.entered.lock().unwrap().clone()
    }

    fn pass(&self, name: String) {
        self.entered.lock().unwrap().push(name);
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.opened.wait(open).unwrap();
        }
    }

    pub async fn wait_entered(&self, count: usize) {
        let waited = tokio::time::timeout(Duration::from_secs(10), async {
            while self.entered.lock().unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "only {:?} entered the gate", self.entered());
    }
}

/// Transform named `operation` that waits at `gate` before succeeding.
pub fn gated(
    operation: &'static str,
    gate: Arc<Gate>,
) -> FnTransform<impl Fn(&mut TransformContext<'_>) -> Result<()> + Send + Sync> {
    FnTransform::new(operation, move |ctx: &mut TransformContext<'_>| {
        gate.pass(name_of(ctx.handle().path()));
        Ok(())
    })
}

/// Transform that sleeps, then succeeds.
pub fn slow(
    operation: &'static str,
    delay: Duration,
) -> FnTransform<impl Fn(&mut TransformContext<'_>) -> Result<()> + Send + Sync> {
    FnTransform::new(operation, move |ctx: &mut TransformContext<'_>| {
        ctx.report(50.0, "working");
        std::thread::sleep(delay);
        Ok(())
    })
}

/// Transform that succeeds immediately.
pub fn noop(operation: &'static str) -> FnTransform<impl Fn(&mut TransformContext<'_>) -> Result<()> + Send + Sync> {
    FnTransform::new(operation, |_: &mut TransformContext<'_>| Ok(()))
}

pub struct Harness {
    pub root: TempDir,
    pub tool: Arc<FakeTool>,
    pub orchestrator: Orchestrator,
}

pub fn harness(catalog: TransformCatalog) -> Harness {
    harness_with_store(catalog, Arc::new(MemoryStore::new()))
}

pub fn harness_with_store(catalog: TransformCatalog, store: Arc<dyn BatchStore>) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let tool = FakeTool::new();
    let orchestrator = Orchestrator::builder(services(root.path(), &tool), catalog)
        .store(store)
        .build()
        .unwrap();
    Harness {
        root,
        tool,
        orchestrator,
    }
}

/// Waits for the batch to settle, failing the test after ten seconds.
pub async fn settled(orchestrator: &Orchestrator, id: &BatchId) -> BatchStatus {
    tokio::time::timeout(Duration::from_secs(10), orchestrator.wait_settled(id))
        .await
        .expect("batch did not settle in time")
        .unwrap()
}

/// Waits for a snapshot matching `predicate`, failing after ten seconds.
pub async fn until(
    orchestrator: &Orchestrator,
    id: &BatchId,
    predicate: impl FnMut(&BatchStatus) -> bool,
) -> BatchStatus {
    tokio::time::timeout(Duration::from_secs(10), orchestrator.wait_for(id, predicate))
        .await
        .expect("condition not reached in time")
        .unwrap()
}
