//! Batch operation model.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use imgforge_common::error::{ForgeError, Result};
use imgforge_common::types::{BatchId, BatchPolicy, BatchState, ItemStatus};

use crate::state::{BatchEvent, transition};

const fn first_index() -> u32 {
    1
}

/// One image a batch runs against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetImage {
    /// Image file.
    pub path: PathBuf,
    /// Sub-image index (1-based).
    #[serde(default = "first_index")]
    pub index: u32,
    /// Dispatch priority; lower runs first.
    #[serde(default)]
    pub priority: i32,
}

impl TargetImage {
    /// Targets index 1 of `path` at priority 0.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            index: 1,
            priority: 0,
        }
    }

    /// Selects another sub-image.
    #[must_use]
    pub const fn with_index(mut self, index: u32) -> Self {
        self.index = index;
        self
    }

    /// Sets the dispatch priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl From<&str> for TargetImage {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<PathBuf> for TargetImage {
    fn from(path: PathBuf) -> Self {
        Self::new(path)
    }
}

/// Caller request for a new batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSpec {
    /// Display name.
    pub name: String,
    /// Transform catalog key applied to every target.
    pub operation: String,
    /// Images in queue order.
    pub targets: Vec<TargetImage>,
    /// Scheduling policy; the configured default when absent.
    #[serde(default)]
    pub policy: Option<BatchPolicy>,
    /// Priority among batches; lower starts first.
    #[serde(default)]
    pub priority: i32,
}

impl BatchSpec {
    /// Starts a spec with no targets.
    #[must_use]
    pub fn new(name: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operation: operation.into(),
            targets: Vec::new(),
            policy: None,
            priority: 0,
        }
    }

    /// Appends one target.
    #[must_use]
    pub fn target(mut self, target: impl Into<TargetImage>) -> Self {
        self.targets.push(target.into());
        self
    }

    /// Appends several targets.
    #[must_use]
    pub fn targets<T: Into<TargetImage>>(mut self, targets: impl IntoIterator<Item = T>) -> Self {
        self.targets.extend(targets.into_iter().map(Into::into));
        self
    }

    /// Overrides the scheduling policy.
    #[must_use]
    pub const fn policy(mut self, policy: BatchPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Sets the batch priority.
    #[must_use]
    pub const fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Outcome of one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItemResult {
    /// Image file.
    pub image_path: PathBuf,
    /// Sub-image index.
    pub index: u32,
    /// Dispatch priority.
    pub priority: i32,
    /// Current status.
    pub status: ItemStatus,
    /// Failure description for `Failed` (and the reason for `Skipped`).
    pub error: Option<String>,
    /// Wall time of the last run.
    pub duration_ms: u64,
    /// Runs started, retries included.
    pub attempts: u32,
    /// Working copy holding the saved changes when the source is a
    /// compressed container. Re-encode it with
    /// [`Orchestrator::export_working_copy`](crate::orchestrator::Orchestrator::export_working_copy).
    #[serde(default)]
    pub working_copy: Option<PathBuf>,
}

impl BatchItemResult {
    fn pending(target: &TargetImage) -> Self {
        Self {
            image_path: target.path.clone(),
            index: target.index,
            priority: target.priority,
            status: ItemStatus::Pending,
            error: None,
            duration_ms: 0,
            attempts: 0,
            working_copy: None,
        }
    }

    /// Returns the item to `Pending`, clearing the last outcome.
    pub fn reset(&mut self) {
        self.status = ItemStatus::Pending;
        self.error = None;
        self.duration_ms = 0;
        self.working_copy = None;
    }
}

/// Per-status item totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCounts {
    /// All items.
    pub total: usize,
    /// Waiting for a worker.
    pub pending: usize,
    /// Claimed by a worker.
    pub running: usize,
    /// Succeeded.
    pub success: usize,
    /// Failed.
    pub failed: usize,
    /// Not executed.
    pub skipped: usize,
}

impl ItemCounts {
    /// Tallies the statuses of `items`.
    #[must_use]
    pub fn tally(items: &[BatchItemResult]) -> Self {
        items.iter().fold(
            Self {
                total: items.len(),
                ..Self::default()
            },
            |mut counts, item| {
                match item.status {
                    ItemStatus::Pending => counts.pending += 1,
                    ItemStatus::Running => counts.running += 1,
                    ItemStatus::Success => counts.success += 1,
                    ItemStatus::Failed => counts.failed += 1,
                    ItemStatus::Skipped => counts.skipped += 1,
                }
                counts
            },
        )
    }

    /// Items with a final outcome.
    #[must_use]
    pub const fn terminal(&self) -> usize {
        self.success + self.failed + self.skipped
    }
}

/// A named unit of work applying one operation across a list of images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOperation {
    /// Identifier.
    pub id: BatchId,
    /// Display name.
    pub name: String,
    /// Transform catalog key.
    pub operation_type: String,
    /// Images in queue order.
    pub target_images: Vec<PathBuf>,
    /// Scheduling policy.
    pub policy: BatchPolicy,
    /// Priority among batches.
    pub priority: i32,
    /// Lifecycle state.
    pub state: BatchState,
    /// One result per target, same order.
    pub items: Vec<BatchItemResult>,
    /// Status totals, kept in step with `items`.
    pub counts: ItemCounts,
    /// Orchestrator-level failure or the reason dispatch halted.
    pub failure: Option<String>,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// RFC 3339 time of the last start.
    pub started_at: Option<String>,
    /// RFC 3339 time the batch last left `Running`/`Paused` for good.
    pub finished_at: Option<String>,
}

impl BatchOperation {
    /// Builds a `Created` batch from a spec.
    ///
    /// # Errors
    ///
    /// Returns `ForgeError::Config` if the spec has no targets, no operation,
    /// a zero index, or an invalid policy.
    pub fn new(spec: BatchSpec, default_policy: BatchPolicy) -> Result<Self> {
        if spec.operation.trim().is_empty() {
            return Err(ForgeError::Config {
                message: "batch operation type is empty".into(),
            });
        }
        if spec.targets.is_empty() {
            return Err(ForgeError::Config {
                message: format!("batch '{}' has no target images", spec.name),
            });
        }
        if let Some(bad) = spec.targets.iter().find(|t| t.index == 0) {
            return Err(ForgeError::Config {
                message: format!("image index is 1-based: {}", bad.path.display()),
            });
        }
        let policy = spec.policy.unwrap_or(default_policy);
        policy.validate()?;

        let items: Vec<_> = spec.targets.iter().map(BatchItemResult::pending).collect();
        Ok(Self {
            id: BatchId::generate(),
            name: spec.name,
            operation_type: spec.operation,
            target_images: spec.targets.into_iter().map(|t| t.path).collect(),
            policy,
            priority: spec.priority,
            state: BatchState::Created,
            counts: ItemCounts::tally(&items),
            items,
            failure: None,
            created_at: chrono::Utc::now().to_rfc3339(),
            started_at: None,
            finished_at: None,
        })
    }

    /// Applies a guarded state transition.
    ///
    /// # Errors
    ///
    /// Returns `ForgeError::InvalidTransition` if the event is not valid in
    /// the current state; the batch is left unchanged.
    pub fn apply(&mut self, event: BatchEvent) -> Result<BatchState> {
        let next = transition(self.state, event)?;
        tracing::debug!(batch = %self.id, from = %self.state, to = %next, "batch transition");
        self.state = next;
        let now = chrono::Utc::now().to_rfc3339();
        match next {
            BatchState::Running if event == BatchEvent::Start => {
                self.started_at = Some(now);
                self.finished_at = None;
            }
            BatchState::Completed | BatchState::Failed | BatchState::Cancelled => {
                self.finished_at = Some(now);
            }
            _ => {}
        }
        Ok(next)
    }

    /// Recomputes `counts` from `items`.
    pub fn recount(&mut self) {
        self.counts = ItemCounts::tally(&self.items);
    }

    /// Index of the next item to dispatch: lowest priority value, then queue order.
    #[must_use]
    pub fn next_pending(&self) -> Option<usize> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.status == ItemStatus::Pending)
            .min_by_key(|(position, item)| (item.priority, *position))
            .map(|(position, _)| position)
    }

    /// Whether every item has a final outcome.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.items.iter().all(|item| item.status.is_terminal())
    }

    /// Snapshot for collaborators.
    #[must_use]
    pub fn status(&self, percentage: f64) -> BatchStatus {
        BatchStatus {
            id: self.id.clone(),
            name: self.name.clone(),
            operation_type: self.operation_type.clone(),
            state: self.state,
            priority: self.priority,
            percentage,
            items: self.items.clone(),
            counts: self.counts,
            failure: self.failure.clone(),
        }
    }
}

/// Point-in-time view of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStatus {
    /// Identifier.
    pub id: BatchId,
    /// Display name.
    pub name: String,
    /// Transform catalog key.
    pub operation_type: String,
    /// Lifecycle state.
    pub state: BatchState,
    /// Priority among batches.
    pub priority: i32,
    /// Aggregate progress, 0 to 100.
    pub percentage: f64,
    /// Per-item results.
    pub items: Vec<BatchItemResult>,
    /// Status totals.
    pub counts: ItemCounts,
    /// Orchestrator-level failure or halt reason.
    pub failure: Option<String>,
}

impl BatchStatus {
    /// Status of the item for `path`, if the batch targets it.
    #[must_use]
    pub fn item(&self, path: impl AsRef<std::path::Path>) -> Option<&BatchItemResult> {
        self.items.iter().find(|i| i.image_path == path.as_ref())
    }
}
