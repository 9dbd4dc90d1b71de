//! # imgforge-batch
//!
//! Runs mount-transform-dismount cycles across many images.
//!
//! Handles:
//! - **Orchestrator**: Batch queue, bounded worker pool, pause/resume/cancel/retry.
//! - **Progress**: Per-item progress rolled into one batch percentage.
//! - **Transforms**: The contract transformation steps implement.
//! - **Persistence**: Durable batch documents that survive restarts.
//! - **Service**: Single-image mount/unmount for interactive collaborators.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

pub mod batch;
pub mod orchestrator;
pub mod progress;
pub mod service;
pub mod state;
pub mod store;
pub mod transform;
pub mod worker;
