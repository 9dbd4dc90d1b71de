//! Batch progress aggregation.
//!
//! Workers report per-item percentages; the aggregator folds them into
//! `(terminal items + sum of in-flight fractions) / total * 100` and
//! forwards each change to the sink and to per-batch callbacks.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};

use imgforge_common::types::BatchId;

/// One aggregated progress change.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    /// Batch the update belongs to.
    pub batch: BatchId,
    /// Position of the reporting item, when the update comes from an item.
    pub item: Option<usize>,
    /// Aggregate batch percentage, 0 to 100.
    pub percentage: f64,
    /// Human-readable step description.
    pub message: String,
}

/// Destination for aggregated progress.
pub trait ProgressSink: Send + Sync {
    /// Receives one update. Called outside any orchestrator lock; a panic
    /// is logged and dropped.
    fn publish(&self, update: &ProgressUpdate);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressUpdate) + Send + Sync,
{
    fn publish(&self, update: &ProgressUpdate) {
        self(update);
    }
}

/// Sink that logs every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn publish(&self, update: &ProgressUpdate) {
        tracing::info!(
            batch = %update.batch,
            item = ?update.item,
            percentage = update.percentage,
            "{}",
            update.message
        );
    }
}

/// Per-batch progress callback: `(percentage, message)`.
pub type ProgressCallback = Arc<dyn Fn(f64, &str) + Send + Sync>;

/// Rolls `terminal` finished items and in-flight fractions into a percentage.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn aggregate(total: usize, terminal: usize, fraction_sum: f64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    ((terminal as f64 + fraction_sum) / total as f64 * 100.0).clamp(0.0, 100.0)
}

#[derive(Default)]
struct Tracked {
    total: usize,
    terminal: usize,
    fractions: HashMap<usize, f64>,
    callbacks: Vec<ProgressCallback>,
}

impl Tracked {
    fn percentage(&self) -> f64 {
        aggregate(self.total, self.terminal, self.fractions.values().sum())
    }
}

/// Aggregates item progress per batch.
pub struct ProgressAggregator {
    sink: Arc<dyn ProgressSink>,
    batches: Mutex<HashMap<BatchId, Tracked>>,
}

impl std::fmt::Debug for ProgressAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressAggregator").finish_non_exhaustive()
    }
}

impl ProgressAggregator {
    /// Creates an aggregator forwarding to `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            sink,
            batches: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<BatchId, Tracked>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts (or restarts) tracking with `terminal` of `total` items done.
    /// Registered callbacks are kept.
    pub fn track(&self, batch: &BatchId, total: usize, terminal: usize) {
        let mut batches = self.lock();
        let tracked = batches.entry(batch.clone()).or_default();
        tracked.total = total;
        tracked.terminal = terminal.min(total);
        tracked.fractions.clear();
    }

    /// Records an item's own percentage and publishes the batch aggregate.
    pub fn report(&self, batch: &BatchId, item: usize, percentage: f64, message: &str) -> f64 {
        let fraction = percentage.clamp(0.0, 100.0) / 100.0;
        self.update(batch, Some(item), message, |t| {
            let _ = t.fractions.insert(item, fraction);
        })
    }

    /// Marks an item terminal and publishes the batch aggregate.
    pub fn complete_item(&self, batch: &BatchId, item: usize, message: &str) -> f64 {
        self.update(batch, Some(item), message, |t| {
            let _ = t.fractions.remove(&item);
            t.terminal = (t.terminal + 1).min(t.total);
        })
    }

    /// Current aggregate for a batch (0 when untracked).
    #[must_use]
    pub fn percentage(&self, batch: &BatchId) -> f64 {
        self.lock().get(batch).map_or(0.0, Tracked::percentage)
    }

    /// Registers a callback invoked on every update of `batch`.
    pub fn register_callback(&self, batch: &BatchId, callback: ProgressCallback) {
        self.lock()
            .entry(batch.clone())
            .or_default()
            .callbacks
            .push(callback);
    }

    /// Stops tracking a batch and drops its callbacks.
    pub fn forget(&self, batch: &BatchId) {
        let _ = self.lock().remove(batch);
    }

    fn update(
        &self,
        batch: &BatchId,
        item: Option<usize>,
        message: &str,
        change: impl FnOnce(&mut Tracked),
    ) -> f64 {
        let (percentage, callbacks) = {
            let mut batches = self.lock();
            let Some(tracked) = batches.get_mut(batch) else {
                return 0.0;
            };
            change(tracked);
            (tracked.percentage(), tracked.callbacks.clone())
        };

        let update = ProgressUpdate {
            batch: batch.clone(),
            item,
            percentage,
            message: message.to_string(),
        };
        notify(batch, "sink", || self.sink.publish(&update));
        for callback in callbacks {
            notify(batch, "callback", || callback(percentage, message));
        }
        percentage
    }
}

// Consumers run on the dispatcher; one that panics must not take it down.
fn notify(batch: &BatchId, consumer: &'static str, call: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(call)).is_err() {
        tracing::warn!(batch = %batch, consumer, "progress consumer panicked, update dropped");
    }
}
