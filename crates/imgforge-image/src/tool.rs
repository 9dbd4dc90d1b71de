//! External image-servicing tool abstraction.
//!
//! Every mount, unmount, export, and hive verb goes through
//! [`ServicingTool`]. Calls are opaque and blocking; a non-zero exit code
//! becomes [`ForgeError::ToolInvocationFailure`] once the caller runs
//! [`ToolOutput::check`].

use std::path::{Path, PathBuf};

use imgforge_common::config::ToolPaths;
use imgforge_common::error::{ForgeError, Result};

/// Captured result of one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    /// Process exit code (`-1` when terminated by a signal).
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl ToolOutput {
    /// Builds a successful output with the given stdout.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Builds a failed output with the given exit code and message.
    #[must_use]
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Returns stdout and stderr joined, trimmed.
    #[must_use]
    pub fn combined(&self) -> String {
        let out = self.stdout.trim();
        let err = self.stderr.trim();
        match (out.is_empty(), err.is_empty()) {
            (true, _) => err.to_string(),
            (false, true) => out.to_string(),
            (false, false) => format!("{out}\n{err}"),
        }
    }

    /// Converts a non-zero exit into a `ToolInvocationFailure`.
    ///
    /// # Errors
    ///
    /// Returns `ForgeError::ToolInvocationFailure` carrying the exit code and
    /// the captured output when `exit_code != 0`.
    pub fn check(self, tool: &str) -> Result<Self> {
        if self.exit_code == 0 {
            return Ok(self);
        }
        Err(ForgeError::ToolInvocationFailure {
            tool: tool.to_string(),
            exit_code: self.exit_code,
            output: self.combined(),
        })
    }
}

/// Compression applied when exporting an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Store without compression.
    None,
    /// Fast compression.
    Fast,
    /// Maximum compression for a directly mountable container.
    Max,
    /// Solid compression used by compressed containers.
    Recovery,
}

impl Compression {
    const fn as_arg(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Fast => "fast",
            Self::Max => "max",
            Self::Recovery => "recovery",
        }
    }
}

/// One sub-image of a multi-image container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageIndex {
    /// 1-based index inside the container.
    pub index: u32,
    /// Display name.
    pub name: String,
    /// Expanded size, when reported.
    pub size_bytes: Option<u64>,
}

/// Result of inspecting a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageInfo {
    /// Sub-images contained in the file.
    pub indexes: Vec<ImageIndex>,
    /// Whether the source is encrypted.
    pub encrypted: bool,
}

/// Host-provided image-servicing utility.
///
/// Implementations return `Ok` whenever the tool ran, whatever its exit
/// code; `Err` means the tool could not be invoked at all.
pub trait ServicingTool: Send + Sync {
    /// Mounts `index` of `image` read-write at `mount_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tool cannot be spawned.
    fn mount_image(&self, image: &Path, index: u32, mount_dir: &Path) -> Result<ToolOutput>;

    /// Unmounts `mount_dir`, committing or discarding changes.
    ///
    /// # Errors
    ///
    /// Returns an error if the tool cannot be spawned.
    fn unmount_image(&self, mount_dir: &Path, commit: bool) -> Result<ToolOutput>;

    /// Exports `index` of `source` into `destination`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tool cannot be spawned.
    fn export_image(
        &self,
        source: &Path,
        index: u32,
        destination: &Path,
        compression: Compression,
    ) -> Result<ToolOutput>;

    /// Lists the sub-images of a container and detects encryption.
    ///
    /// # Errors
    ///
    /// Returns an error if the tool fails for a reason other than encryption.
    fn inspect(&self, image: &Path) -> Result<ImageInfo>;

    /// Loads an offline registry hive under `HKLM\<key>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tool cannot be spawned.
    fn load_hive(&self, hive_file: &Path, key: &str) -> Result<ToolOutput>;

    /// Unloads the hive mounted under `HKLM\<key>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tool cannot be spawned.
    fn unload_hive(&self, key: &str) -> Result<ToolOutput>;

    /// Lists the directories the host currently has images mounted at.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing cannot be obtained.
    fn mounted_images(&self) -> Result<Vec<PathBuf>>;
}

/// Process-backed servicing tool using DISM-style verbs and `reg`.
#[derive(Debug, Clone)]
pub struct DismTool {
    servicing: PathBuf,
    registry: PathBuf,
}

impl DismTool {
    /// Creates a tool with explicit binary paths.
    #[must_use]
    pub fn new(servicing: impl Into<PathBuf>, registry: impl Into<PathBuf>) -> Self {
        Self {
            servicing: servicing.into(),
            registry: registry.into(),
        }
    }

    /// Creates a tool from the configured paths, resolving bare names on `PATH`.
    #[must_use]
    pub fn from_config(paths: &ToolPaths) -> Self {
        Self::new(resolve(&paths.servicing), resolve(&paths.registry))
    }

    /// Returns whether the servicing binary can be found.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.servicing.is_file() || which::which(&self.servicing).is_ok()
    }

    fn run(program: &Path, args: &[String]) -> Result<ToolOutput> {
        tracing::debug!(program = %program.display(), ?args, "invoking tool");
        let output = std::process::Command::new(program)
            .args(args)
            .output()
            .map_err(|e| ForgeError::io(program, e))?;
        Ok(ToolOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

impl Default for DismTool {
    fn default() -> Self {
        Self::from_config(&ToolPaths::default())
    }
}

impl ServicingTool for DismTool {
    fn mount_image(&self, image: &Path, index: u32, mount_dir: &Path) -> Result<ToolOutput> {
        Self::run(
            &self.servicing,
            &[
                "/Mount-Image".into(),
                format!("/ImageFile:{}", image.display()),
                format!("/Index:{index}"),
                format!("/MountDir:{}", mount_dir.display()),
            ],
        )
    }

    fn unmount_image(&self, mount_dir: &Path, commit: bool) -> Result<ToolOutput> {
        let mode = if commit { "/Commit" } else { "/Discard" };
        Self::run(
            &self.servicing,
            &[
                "/Unmount-Image".into(),
                format!("/MountDir:{}", mount_dir.display()),
                mode.into(),
            ],
        )
    }

    fn export_image(
        &self,
        source: &Path,
        index: u32,
        destination: &Path,
        compression: Compression,
    ) -> Result<ToolOutput> {
        Self::run(
            &self.servicing,
            &[
                "/Export-Image".into(),
                format!("/SourceImageFile:{}", source.display()),
                format!("/SourceIndex:{index}"),
                format!("/DestinationImageFile:{}", destination.display()),
                format!("/Compress:{}", compression.as_arg()),
            ],
        )
    }

    fn inspect(&self, image: &Path) -> Result<ImageInfo> {
        let output = Self::run(
            &self.servicing,
            &["/Get-WimInfo".into(), format!("/WimFile:{}", image.display())],
        )?;
        if reports_encryption(&output.combined()) {
            return Ok(ImageInfo {
                indexes: Vec::new(),
                encrypted: true,
            });
        }
        let output = output.check("get-wiminfo")?;
        Ok(ImageInfo {
            indexes: parse_image_indexes(&output.stdout),
            encrypted: false,
        })
    }

    fn load_hive(&self, hive_file: &Path, key: &str) -> Result<ToolOutput> {
        Self::run(
            &self.registry,
            &[
                "load".into(),
                format!("HKLM\\{key}"),
                hive_file.display().to_string(),
            ],
        )
    }

    fn unload_hive(&self, key: &str) -> Result<ToolOutput> {
        Self::run(&self.registry, &["unload".into(), format!("HKLM\\{key}")])
    }

    fn mounted_images(&self) -> Result<Vec<PathBuf>> {
        let output =
            Self::run(&self.servicing, &["/Get-MountedImageInfo".into()])?.check("get-mountedimageinfo")?;
        Ok(parse_mount_dirs(&output.stdout))
    }
}

fn resolve(program: &Path) -> PathBuf {
    which::which(program).unwrap_or_else(|_| program.to_path_buf())
}

fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let (key, value) = line.split_once(':')?;
    key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
}

fn reports_encryption(output: &str) -> bool {
    output.to_ascii_lowercase().contains("encrypted")
}

/// Parses `Index : N` / `Name : X` / `Size : N bytes` blocks.
pub(crate) fn parse_image_indexes(stdout: &str) -> Vec<ImageIndex> {
    let mut indexes: Vec<ImageIndex> = Vec::new();
    for line in stdout.lines() {
        if let Some(value) = field(line, "Index") {
            if let Ok(index) = value.parse() {
                indexes.push(ImageIndex {
                    index,
                    name: String::new(),
                    size_bytes: None,
                });
            }
        } else if let Some(current) = indexes.last_mut() {
            if let Some(name) = field(line, "Name") {
                current.name = name.to_string();
            } else if let Some(size) = field(line, "Size") {
                let digits: String = size.chars().filter(char::is_ascii_digit).collect();
                current.size_bytes = digits.parse().ok();
            }
        }
    }
    indexes
}

/// Parses `Mount Dir : <path>` lines.
pub(crate) fn parse_mount_dirs(stdout: &str) -> Vec<PathBuf> {
    stdout
        .lines()
        .filter_map(|line| {
            // Drive-qualified paths contain ':' themselves, so split on " : ".
            let (key, value) = line.split_once(" : ")?;
            key.trim()
                .eq_ignore_ascii_case("Mount Dir")
                .then(|| PathBuf::from(value.trim()))
        })
        .collect()
}
