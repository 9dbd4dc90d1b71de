//! Disk-image attach/detach and partition enumeration for virtual disks.

use std::path::{Path, PathBuf};

use imgforge_common::error::{ForgeError, Result};
use imgforge_common::types::MountPoint;

use crate::tool::ToolOutput;

/// Role of a partition, as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    /// EFI system partition.
    System,
    /// Microsoft reserved partition.
    Reserved,
    /// Regular data partition.
    Basic,
    /// Recovery partition.
    Recovery,
    /// Type the host could not classify.
    Unknown,
}

impl PartitionKind {
    /// Maps a host partition type label to a kind.
    #[must_use]
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "system" => Self::System,
            "reserved" => Self::Reserved,
            "basic" | "ifs" | "primary" | "logical" => Self::Basic,
            "recovery" => Self::Recovery,
            _ => Self::Unknown,
        }
    }

    /// Returns whether the partition may be picked as a mount target by default.
    #[must_use]
    pub const fn is_mountable(self) -> bool {
        !matches!(self, Self::Reserved | Self::Unknown)
    }
}

/// A partition on an attached disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    /// 1-based partition number.
    pub number: u32,
    /// Role of the partition.
    pub kind: PartitionKind,
    /// Assigned drive letter, if any.
    pub drive_letter: Option<char>,
    /// Size in bytes.
    pub size_bytes: u64,
}

/// Selects the partition to expose: an explicit number, or the first
/// mountable one.
#[must_use]
pub fn select_partition(partitions: &[PartitionInfo], wanted: Option<u32>) -> Option<&PartitionInfo> {
    match wanted {
        Some(number) => partitions.iter().find(|p| p.number == number),
        None => partitions.iter().find(|p| p.kind.is_mountable()),
    }
}

/// Host facility for attaching disk images.
pub trait DiskFacility: Send + Sync {
    /// Attaches the disk image and returns its disk number.
    ///
    /// # Errors
    ///
    /// Returns an error if the image cannot be attached.
    fn attach(&self, image: &Path) -> Result<u32>;

    /// Detaches a previously attached disk image.
    ///
    /// # Errors
    ///
    /// Returns an error if the image cannot be detached.
    fn detach(&self, image: &Path) -> Result<()>;

    /// Enumerates the partitions of an attached disk.
    ///
    /// # Errors
    ///
    /// Returns an error if enumeration fails.
    fn partitions(&self, disk_number: u32) -> Result<Vec<PartitionInfo>>;

    /// Returns the drive letters currently in use on the host.
    ///
    /// # Errors
    ///
    /// Returns an error if the host cannot be queried.
    fn drive_letters_in_use(&self) -> Result<Vec<char>>;

    /// Assigns a drive letter to a partition.
    ///
    /// # Errors
    ///
    /// Returns an error if the assignment is rejected.
    fn assign_drive_letter(&self, disk_number: u32, partition: u32, letter: char) -> Result<()>;

    /// Returns the drive roots of all attached virtual disks.
    ///
    /// # Errors
    ///
    /// Returns an error if the host cannot be queried.
    fn virtual_disk_mounts(&self) -> Result<Vec<MountPoint>>;
}

/// Disk facility backed by the storage cmdlets of a PowerShell host.
#[derive(Debug, Clone)]
pub struct PowerShellDisks {
    shell: PathBuf,
}

impl PowerShellDisks {
    /// Creates a facility that runs cmdlets through `shell`.
    #[must_use]
    pub fn new(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    /// Returns whether the shell binary can be found.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.shell.is_file() || which::which(&self.shell).is_ok()
    }

    fn run(&self, verb: &str, script: &str) -> Result<String> {
        tracing::debug!(verb, script, "invoking disk cmdlet");
        let output = std::process::Command::new(&self.shell)
            .args(["-NoProfile", "-NonInteractive", "-Command", script])
            .output()
            .map_err(|e| ForgeError::io(&self.shell, e))?;
        let output = ToolOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
        .check(verb)?;
        Ok(output.stdout)
    }
}

impl DiskFacility for PowerShellDisks {
    fn attach(&self, image: &Path) -> Result<u32> {
        let script = format!(
            "(Mount-DiskImage -ImagePath {} -NoDriveLetter -PassThru | Get-Disk).Number",
            quote(image)
        );
        let stdout = self.run("mount-diskimage", &script)?;
        stdout.trim().parse().map_err(|_| ForgeError::ToolInvocationFailure {
            tool: "mount-diskimage".into(),
            exit_code: 0,
            output: format!("unexpected disk number output: {}", stdout.trim()),
        })
    }

    fn detach(&self, image: &Path) -> Result<()> {
        let script = format!("Dismount-DiskImage -ImagePath {} | Out-Null", quote(image));
        let _ = self.run("dismount-diskimage", &script)?;
        Ok(())
    }

    fn partitions(&self, disk_number: u32) -> Result<Vec<PartitionInfo>> {
        let script = format!(
            "Get-Partition -DiskNumber {disk_number} | ForEach-Object {{ \
             \"$($_.PartitionNumber)|$($_.Type)|$($_.DriveLetter)|$($_.Size)\" }}"
        );
        let stdout = self.run("get-partition", &script)?;
        Ok(parse_partitions(&stdout))
    }

    fn drive_letters_in_use(&self) -> Result<Vec<char>> {
        let stdout = self.run(
            "get-psdrive",
            "(Get-PSDrive -PSProvider FileSystem).Name -join ','",
        )?;
        Ok(parse_letters(&stdout))
    }

    fn assign_drive_letter(&self, disk_number: u32, partition: u32, letter: char) -> Result<()> {
        let script = format!(
            "Set-Partition -DiskNumber {disk_number} -PartitionNumber {partition} -NewDriveLetter {letter}"
        );
        let _ = self.run("set-partition", &script)?;
        Ok(())
    }

    fn virtual_disk_mounts(&self) -> Result<Vec<MountPoint>> {
        let stdout = self.run(
            "get-disk",
            "(Get-Disk | Where-Object BusType -eq 'File Backed Virtual' | Get-Partition | \
             Where-Object DriveLetter).DriveLetter -join ','",
        )?;
        Ok(parse_letters(&stdout).into_iter().map(MountPoint::drive).collect())
    }
}

fn quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', "''"))
}

/// Parses `number|type|letter|size` lines.
pub(crate) fn parse_partitions(stdout: &str) -> Vec<PartitionInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.trim().split('|');
            let number = fields.next()?.trim().parse().ok()?;
            let kind = PartitionKind::from_label(fields.next().unwrap_or_default());
            let drive_letter = fields
                .next()
                .and_then(|f| f.trim().chars().next())
                .filter(char::is_ascii_alphabetic)
                .map(|c| c.to_ascii_uppercase());
            let size_bytes = fields
                .next()
                .and_then(|f| f.trim().parse().ok())
                .unwrap_or(0);
            Some(PartitionInfo {
                number,
                kind,
                drive_letter,
                size_bytes,
            })
        })
        .collect()
}

/// Parses a comma-separated list of single-letter drive names.
pub(crate) fn parse_letters(stdout: &str) -> Vec<char> {
    stdout
        .split(',')
        .map(str::trim)
        .filter(|name| name.len() == 1)
        .filter_map(|name| name.chars().next())
        .filter(char::is_ascii_alphabetic)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}
