//! Image format detection.

use std::path::Path;

use imgforge_common::error::{ForgeError, Result};
use imgforge_common::types::ImageFormat;

/// Detects the container format from the file extension.
///
/// # Errors
///
/// Returns `ForgeError::UnsupportedFormat` for any extension other than
/// `.wim`, `.esd`, `.vhd`, or `.vhdx`.
pub fn detect(path: &Path) -> Result<ImageFormat> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("wim") => Ok(ImageFormat::DirectContainer),
        Some("esd") => Ok(ImageFormat::CompressedContainer),
        Some("vhd") => Ok(ImageFormat::VirtualDiskLegacy),
        Some("vhdx") => Ok(ImageFormat::VirtualDiskModern),
        _ => Err(ForgeError::UnsupportedFormat {
            path: path.to_path_buf(),
        }),
    }
}
