//! In-process fakes for the servicing tool and the disk facility.

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use imgforge_common::error::Result;
use imgforge_common::types::MountPoint;
use imgforge_image::disk::{DiskFacility, PartitionInfo, PartitionKind};
use imgforge_image::services::{MountServices, MountSettings};
use imgforge_image::tool::{Compression, ImageIndex, ImageInfo, ServicingTool, ToolOutput};

fn name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Servicing tool that records every verb and fails on request.
#[derive(Default)]
pub struct FakeTool {
    calls: Mutex<Vec<String>>,
    fail_mount: Mutex<HashSet<String>>,
    encrypted: Mutex<HashSet<String>>,
    mounted: Mutex<HashSet<PathBuf>>,
    pub fail_commit: AtomicBool,
    pub fail_discard: AtomicBool,
}

impl FakeTool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_mount_of(&self, file_name: &str) {
        let _ = self.fail_mount.lock().unwrap().insert(file_name.to_string());
    }

    pub fn mark_encrypted(&self, file_name: &str) {
        let _ = self.encrypted.lock().unwrap().insert(file_name.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    pub fn is_mounted(&self, dir: &Path) -> bool {
        self.mounted.lock().unwrap().contains(dir)
    }

    /// Simulates a host mount this process never registered.
    pub fn add_foreign_mount(&self, dir: &Path) {
        let _ = self.mounted.lock().unwrap().insert(dir.to_path_buf());
    }

    /// Simulates a mount that vanished behind the registry's back.
    pub fn forget_mount(&self, dir: &Path) {
        let _ = self.mounted.lock().unwrap().remove(dir);
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl ServicingTool for FakeTool {
    fn mount_image(&self, image: &Path, index: u32, mount_dir: &Path) -> Result<ToolOutput> {
        let name = name_of(image);
        self.record(format!("mount {name} {index}"));
        if self.fail_mount.lock().unwrap().contains(&name) {
            return Ok(ToolOutput::failed(
                5,
                "Error: 5\nAccess is denied.\nThe DISM log file can be found at C:\\Windows\\Logs\\DISM\\dism.log",
            ));
        }
        let _ = self.mounted.lock().unwrap().insert(mount_dir.to_path_buf());
        Ok(ToolOutput::ok("The operation completed successfully."))
    }

    fn unmount_image(&self, mount_dir: &Path, commit: bool) -> Result<ToolOutput> {
        self.record(format!("unmount {} {}", name_of(mount_dir), if commit { "commit" } else { "discard" }));
        if commit && self.fail_commit.load(Ordering::SeqCst) {
            return Ok(ToolOutput::failed(-2_147_467_259, "Error: 0x80004005"));
        }
        if !commit && self.fail_discard.load(Ordering::SeqCst) {
            return Ok(ToolOutput::failed(50, "Error: 50"));
        }
        let _ = self.mounted.lock().unwrap().remove(mount_dir);
        Ok(ToolOutput::ok("The operation completed successfully."))
    }

    fn export_image(
        &self,
        source: &Path,
        index: u32,
        destination: &Path,
        _compression: Compression,
    ) -> Result<ToolOutput> {
        self.record(format!("export {} {index} {}", name_of(source), name_of(destination)));
        std::fs::write(destination, b"exported").unwrap();
        Ok(ToolOutput::ok("The operation completed successfully."))
    }

    fn inspect(&self, image: &Path) -> Result<ImageInfo> {
        let name = name_of(image);
        self.record(format!("inspect {name}"));
        if self.encrypted.lock().unwrap().contains(&name) {
            return Ok(ImageInfo {
                indexes: Vec::new(),
                encrypted: true,
            });
        }
        Ok(ImageInfo {
            indexes: (1..=2)
                .map(|index| ImageIndex {
                    index,
                    name: format!("Edition {index}"),
                    size_bytes: None,
                })
                .collect(),
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
        Ok(self.mounted.lock().unwrap().iter().cloned().collect())
    }
}

/// Disk facility with one configurable partition layout for every disk.
pub struct FakeDisks {
    layout: Vec<PartitionInfo>,
    host_letters: Vec<char>,
    next_disk: AtomicU32,
    attached: Mutex<HashMap<PathBuf, u32>>,
    letters: Mutex<HashMap<u32, char>>,
    detached: Mutex<Vec<PathBuf>>,
    pub fail_assign: AtomicBool,
}

impl FakeDisks {
    pub fn new(host_letters: &[char]) -> Arc<Self> {
        Self::with_layout(
            host_letters,
            vec![
                partition(1, PartitionKind::Reserved),
                partition(2, PartitionKind::Basic),
            ],
        )
    }

    pub fn with_layout(host_letters: &[char], layout: Vec<PartitionInfo>) -> Arc<Self> {
        Arc::new(Self {
            layout,
            host_letters: host_letters.to_vec(),
            next_disk: AtomicU32::new(1),
            attached: Mutex::new(HashMap::new()),
            letters: Mutex::new(HashMap::new()),
            detached: Mutex::new(Vec::new()),
            fail_assign: AtomicBool::new(false),
        })
    }

    pub fn attached_count(&self) -> usize {
        self.attached.lock().unwrap().len()
    }

    pub fn detached(&self) -> Vec<PathBuf> {
        self.detached.lock().unwrap().clone()
    }
}

pub fn partition(number: u32, kind: PartitionKind) -> PartitionInfo {
    PartitionInfo {
        number,
        kind,
        drive_letter: None,
        size_bytes: 1 << 30,
    }
}

impl DiskFacility for FakeDisks {
    fn attach(&self, image: &Path) -> Result<u32> {
        let disk = self.next_disk.fetch_add(1, Ordering::SeqCst);
        let _ = self.attached.lock().unwrap().insert(image.to_path_buf(), disk);
        Ok(disk)
    }

    fn detach(&self, image: &Path) -> Result<()> {
        if let Some(disk) = self.attached.lock().unwrap().remove(image) {
            let _ = self.letters.lock().unwrap().remove(&disk);
        }
        self.detached.lock().unwrap().push(image.to_path_buf());
        Ok(())
    }

    fn partitions(&self, disk_number: u32) -> Result<Vec<PartitionInfo>> {
        let letter = self.letters.lock().unwrap().get(&disk_number).copied();
        Ok(self
            .layout
            .iter()
            .cloned()
            .map(|mut p| {
                if p.kind == PartitionKind::Basic && p.drive_letter.is_none() {
                    p.drive_letter = letter;
                }
                p
            })
            .collect())
    }

    fn drive_letters_in_use(&self) -> Result<Vec<char>> {
        let mut in_use = self.host_letters.clone();
        in_use.extend(self.letters.lock().unwrap().values().copied());
        Ok(in_use)
    }

    fn assign_drive_letter(&self, disk_number: u32, _partition: u32, letter: char) -> Result<()> {
        if self.fail_assign.load(Ordering::SeqCst) {
            return Err(imgforge_common::error::ForgeError::ToolInvocationFailure {
                tool: "set-partition".into(),
                exit_code: 1,
                output: "The requested access path is already in use.".into(),
            });
        }
        let mut letters = self.letters.lock().unwrap();
        assert!(
            !letters.values().any(|l| *l == letter) && !self.host_letters.contains(&letter),
            "letter {letter} handed out twice"
        );
        let _ = letters.insert(disk_number, letter);
        Ok(())
    }

    fn virtual_disk_mounts(&self) -> Result<Vec<MountPoint>> {
        Ok(self
            .letters
            .lock()
            .unwrap()
            .values()
            .copied()
            .map(MountPoint::drive)
            .collect())
    }
}

pub fn settings(root: &Path) -> MountSettings {
    MountSettings {
        mount_root: root.join("mounts"),
        work_dir: root.join("work"),
        settle_delay: Duration::ZERO,
        settle_attempts: 3,
        drive_letters: "DEFGHIJKLMNOPQRSTUVWXYZ".chars().collect(),
    }
}

pub fn services(root: &Path, tool: &Arc<FakeTool>, disks: &Arc<FakeDisks>) -> MountServices {
    MountServices::new(
        Arc::clone(tool) as Arc<dyn ServicingTool>,
        Arc::clone(disks) as Arc<dyn DiskFacility>,
        settings(root),
    )
}
