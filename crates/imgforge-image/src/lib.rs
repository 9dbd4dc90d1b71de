//! # imgforge-image
//!
//! Mount lifecycle for deployment disk images.
//!
//! Handles:
//! - **Handles**: One [`handle::ImageHandle`] per image, with format-specific
//!   drivers for direct containers, compressed containers, and virtual disks.
//! - **Registry**: Process-wide table of claimed mount points and drive letters.
//! - **Tools**: The external servicing tool and the host disk facility.
//! - **Hives**: Scoped load/unload of offline registry hives.
//! - **Working copies**: Temporary converted containers with scoped cleanup.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

pub mod disk;
pub mod format;
pub mod handle;
pub mod hive;
pub mod registry;
pub mod services;
pub mod tool;
pub mod workcopy;
