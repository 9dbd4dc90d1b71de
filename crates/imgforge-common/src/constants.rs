//! System-wide constants and default paths.

use std::path::PathBuf;
use std::sync::OnceLock;

/// Default base directory when no user home is available.
pub const SYSTEM_DATA_DIR: &str = "/var/lib/imgforge";

/// Returns the data directory, preferring `$HOME/.imgforge` and falling
/// back to [`SYSTEM_DATA_DIR`].
fn resolve_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
        let user_dir = PathBuf::from(home).join(".imgforge");
        if std::fs::create_dir_all(&user_dir).is_ok() {
            return user_dir;
        }
    }
    PathBuf::from(SYSTEM_DATA_DIR)
}

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Returns the resolved data directory for this session.
pub fn data_dir() -> &'static PathBuf {
    DATA_DIR.get_or_init(resolve_data_dir)
}

/// Returns the default root under which directory mount points are created.
pub fn default_mount_root() -> PathBuf {
    data_dir().join("mounts")
}

/// Returns the default directory for temporary working copies.
pub fn default_work_dir() -> PathBuf {
    data_dir().join("work")
}

/// Returns the default directory for persisted batch documents.
pub fn default_batch_dir() -> PathBuf {
    data_dir().join("batches")
}

/// Returns the default configuration file path.
pub fn default_config_file() -> PathBuf {
    data_dir().join("config.json")
}

/// Default worker pool size for a batch.
pub const DEFAULT_MAX_PARALLEL: usize = 2;

/// Upper bound on the worker pool size of a single batch.
pub const MAX_PARALLEL_LIMIT: usize = 16;

/// Drive letters scanned, in order, when a virtual-disk partition needs one.
pub const DRIVE_LETTER_CANDIDATES: &str = "DEFGHIJKLMNOPQRSTUVWXYZ";

/// Delay between partition enumeration attempts after attaching a virtual disk.
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 1_500;

/// Number of partition enumeration attempts before giving up.
pub const DEFAULT_SETTLE_ATTEMPTS: u32 = 5;

/// Default servicing tool binary.
pub const DEFAULT_SERVICING_TOOL: &str = "dism";

/// Default registry tool binary.
pub const DEFAULT_REGISTRY_TOOL: &str = "reg";

/// Default shell used for the disk facility.
pub const DEFAULT_DISK_SHELL: &str = "powershell";

/// File name suffix of converted working copies.
pub const WORKING_COPY_EXTENSION: &str = "wim";

/// Default tracing filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Application name used in paths and log output.
pub const APP_NAME: &str = "imgforge";
