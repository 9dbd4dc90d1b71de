//! One item's mount-transform-dismount cycle.
//!
//! Runs on a blocking thread. Nothing in here touches the batch document;
//! the outcome is handed back to the orchestrator, which records it.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use imgforge_common::error::{ForgeError, Result};
use imgforge_common::types::{BatchId, ItemStatus};
use imgforge_image::handle::ImageHandle;
use imgforge_image::services::MountServices;

use crate::progress::ProgressAggregator;
use crate::transform::{Transform, TransformContext};

/// Item progress once the image is mounted.
const MOUNTED_PCT: f64 = 30.0;
/// Item progress once the transform returned.
const TRANSFORMED_PCT: f64 = 90.0;

/// Everything a worker needs to run one item.
#[derive(Debug, Clone)]
pub struct ItemJob {
    /// Owning batch.
    pub batch: BatchId,
    /// Position of the item in the batch.
    pub position: usize,
    /// Image file.
    pub path: PathBuf,
    /// Sub-image index.
    pub index: u32,
    /// Runs already recorded for this item.
    pub attempts: u32,
    /// Automatic retries allowed for retryable failures.
    pub max_retries: u32,
}

/// Outcome of running one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRun {
    /// Final status: `Success`, `Failed`, or `Skipped`.
    pub status: ItemStatus,
    /// Failure or skip reason.
    pub error: Option<String>,
    /// Wall time across all attempts.
    pub duration_ms: u64,
    /// Total runs, including earlier ones.
    pub attempts: u32,
    /// Converted working copy holding the saved changes of a compressed
    /// source.
    pub working_copy: Option<PathBuf>,
}

impl ItemRun {
    /// Whether the item needs no further work.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == ItemStatus::Success
    }
}

enum AttemptError {
    Skipped(String),
    Failed { message: String, retryable: bool },
}

impl From<ForgeError> for AttemptError {
    fn from(e: ForgeError) -> Self {
        match e {
            ForgeError::Cancelled { .. } => Self::Skipped(e.to_string()),
            other => Self::Failed {
                retryable: other.is_retryable(),
                message: other.to_string(),
            },
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Runs one item to completion, retrying retryable failures.
///
/// Panics raised by the transform are contained: the handle's drop releases
/// the mount and the item is reported `Failed`.
pub fn run_item(
    job: &ItemJob,
    services: &MountServices,
    transform: &dyn Transform,
    cancel: &CancellationToken,
    progress: &ProgressAggregator,
) -> ItemRun {
    let started = Instant::now();
    let mut attempts = job.attempts;
    let mut retries_left = job.max_retries;

    loop {
        attempts += 1;
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            attempt(job, services, transform, cancel, progress)
        }))
        .unwrap_or_else(|payload| {
            Err(AttemptError::Failed {
                message: format!("transform panicked: {}", panic_message(payload.as_ref())),
                retryable: false,
            })
        });

        let (status, error, working_copy) = match outcome {
            Ok(working_copy) => (ItemStatus::Success, None, working_copy),
            Err(AttemptError::Skipped(reason)) => (ItemStatus::Skipped, Some(reason), None),
            Err(AttemptError::Failed { message, retryable }) => {
                if retryable && retries_left > 0 && !cancel.is_cancelled() {
                    retries_left -= 1;
                    tracing::warn!(
                        batch = %job.batch,
                        image = %job.path.display(),
                        attempt = attempts,
                        error = %message,
                        "item failed, retrying"
                    );
                    continue;
                }
                (ItemStatus::Failed, Some(message), None)
            }
        };

        match status {
            ItemStatus::Failed => tracing::warn!(
                batch = %job.batch,
                image = %job.path.display(),
                error = error.as_deref().unwrap_or_default(),
                "item failed"
            ),
            _ => tracing::info!(batch = %job.batch, image = %job.path.display(), status = %status, "item finished"),
        }
        return ItemRun {
            status,
            error,
            duration_ms: elapsed_ms(started),
            attempts,
            working_copy,
        };
    }
}

fn attempt(
    job: &ItemJob,
    services: &MountServices,
    transform: &dyn Transform,
    cancel: &CancellationToken,
    progress: &ProgressAggregator,
) -> std::result::Result<Option<PathBuf>, AttemptError> {
    let report = |pct: f64, msg: &str| {
        let _ = progress.report(&job.batch, job.position, pct, msg);
    };

    checkpoint(cancel, "mount")?;
    let mut handle = ImageHandle::open(&job.path, services.clone())?;
    report(5.0, "mounting");
    let _ = handle.mount(job.index)?;
    report(MOUNTED_PCT, "mounted");

    let applied = checkpoint(cancel, "transform").and_then(|()| {
        let scaled = |pct: f64, msg: &str| {
            report(
                MOUNTED_PCT + pct.clamp(0.0, 100.0) / 100.0 * (TRANSFORMED_PCT - MOUNTED_PCT),
                msg,
            );
        };
        let mut ctx = TransformContext::new(&handle, &services.hives, cancel, &scaled);
        transform.apply(&mut ctx)
    });
    report(TRANSFORMED_PCT, "dismounting");

    // A mounted image is always released; cancellation only stops new work.
    if cancel.is_cancelled() {
        tracing::debug!(batch = %job.batch, image = %job.path.display(), "cancelled, releasing mount");
    }
    let dismounted = handle.dismount(applied.is_ok())?;
    applied?;
    if let Some(save_error) = dismounted.save_error {
        return Err(AttemptError::Failed {
            message: format!("changes were not saved: {save_error}"),
            retryable: false,
        });
    }
    report(95.0, "dismounted");
    let working_copy = handle.working_copy().map(Path::to_path_buf);
    if let Some(copy) = &working_copy {
        tracing::info!(batch = %job.batch, image = %job.path.display(), working_copy = %copy.display(), "saved changes kept in working copy");
    }
    Ok(working_copy)
}

fn checkpoint(cancel: &CancellationToken, step: &str) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(ForgeError::Cancelled {
            step: step.to_string(),
        });
    }
    Ok(())
}
