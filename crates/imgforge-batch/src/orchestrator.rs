//! Batch orchestration.
//!
//! Each batch owns a slot: the batch document behind a mutex, a cancellation
//! token, a wake-up signal, and a `watch` channel carrying status snapshots.
//! Starting a batch spawns a dispatcher task that claims pending items under
//! the slot lock and runs them on the blocking pool. Each worker records its
//! own outcome under the same lock before it exits, so persisting results
//! and notifying progress consumers stay off the async threads. The lock is
//! never held across an await or while a transform runs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Notify, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use imgforge_common::config::ForgeConfig;
use imgforge_common::error::{ForgeError, Result};
use imgforge_common::types::{BatchId, BatchPolicy, BatchState, ItemStatus};
use imgforge_image::registry::ReconcileReport;
use imgforge_image::services::MountServices;
use imgforge_image::tool::Compression;

use crate::batch::{BatchOperation, BatchSpec, BatchStatus};
use crate::progress::{ProgressAggregator, ProgressCallback, ProgressSink, TracingSink};
use crate::state::BatchEvent;
use crate::store::{BatchStore, JsonFileStore, MemoryStore};
use crate::transform::TransformCatalog;
use crate::worker::{self, ItemJob, ItemRun};

struct SlotState {
    batch: BatchOperation,
    in_flight: usize,
    dispatching: bool,
    halted: bool,
    cancel: CancellationToken,
}

struct BatchSlot {
    shared: Mutex<SlotState>,
    wake: Notify,
    status_tx: watch::Sender<BatchStatus>,
}

impl BatchSlot {
    fn new(batch: BatchOperation, percentage: f64) -> Self {
        let (status_tx, _) = watch::channel(batch.status(percentage));
        Self {
            shared: Mutex::new(SlotState {
                batch,
                in_flight: 0,
                dispatching: false,
                halted: false,
                cancel: CancellationToken::new(),
            }),
            wake: Notify::new(),
            status_tx,
        }
    }

    // The dispatcher must always be able to record outcomes.
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, batch: &BatchOperation, percentage: f64) {
        let _ = self.status_tx.send_replace(batch.status(percentage));
    }
}

struct Claimed {
    job: ItemJob,
    operation: String,
    cancel: CancellationToken,
}

struct Inner {
    services: MountServices,
    catalog: TransformCatalog,
    store: Arc<dyn BatchStore>,
    progress: ProgressAggregator,
    default_policy: BatchPolicy,
    runtime: tokio::runtime::Handle,
    batches: Mutex<HashMap<BatchId, Arc<BatchSlot>>>,
}

fn poisoned<T>(_: PoisonError<T>) -> ForgeError {
    ForgeError::Config {
        message: "batch table lock poisoned".into(),
    }
}

impl Inner {
    fn slot(&self, id: &BatchId) -> Result<Arc<BatchSlot>> {
        self.batches
            .lock()
            .map_err(poisoned)?
            .get(id)
            .cloned()
            .ok_or_else(|| ForgeError::NotFound {
                kind: "batch",
                id: id.to_string(),
            })
    }

    fn slots(&self) -> Result<Vec<Arc<BatchSlot>>> {
        Ok(self.batches.lock().map_err(poisoned)?.values().cloned().collect())
    }

    /// Persists the document and publishes a snapshot. A storage failure
    /// fails the whole batch.
    ///
    /// Runs under the slot lock so stored documents follow the in-memory
    /// order. Saves are a single small document; the only ones made from
    /// the dispatcher task are item claims and the final settle.
    fn commit(&self, slot: &BatchSlot, st: &mut SlotState) -> Result<()> {
        st.batch.recount();
        let saved = self.store.save(&st.batch);
        if let Err(e) = &saved {
            tracing::error!(batch = %st.batch.id, error = %e, "failed to persist batch");
            abort(slot, st, format!("persistence failed: {e}"));
        }
        slot.publish(&st.batch, self.progress.percentage(&st.batch.id));
        saved
    }

    fn claim_next(&self, slot: &BatchSlot) -> Option<Claimed> {
        let mut guard = slot.lock();
        let st = &mut *guard;
        if st.batch.state != BatchState::Running
            || st.halted
            || st.in_flight >= st.batch.policy.max_parallel
        {
            return None;
        }
        let position = st.batch.next_pending()?;
        let item = &mut st.batch.items[position];
        item.status = ItemStatus::Running;
        let job = ItemJob {
            batch: st.batch.id.clone(),
            position,
            path: item.image_path.clone(),
            index: item.index,
            attempts: item.attempts,
            max_retries: st.batch.policy.max_retries,
        };
        st.in_flight += 1;

        if self.commit(slot, st).is_err() {
            st.batch.items[position].status = ItemStatus::Pending;
            st.in_flight -= 1;
            st.batch.recount();
            return None;
        }
        tracing::debug!(batch = %job.batch, image = %job.path.display(), in_flight = st.in_flight, "item claimed");
        Some(Claimed {
            job,
            operation: st.batch.operation_type.clone(),
            cancel: st.cancel.clone(),
        })
    }

    fn execute(&self, claimed: &Claimed) -> ItemRun {
        match self.catalog.get(&claimed.operation) {
            Ok(transform) => worker::run_item(
                &claimed.job,
                &self.services,
                transform.as_ref(),
                &claimed.cancel,
                &self.progress,
            ),
            Err(e) => ItemRun {
                status: ItemStatus::Failed,
                error: Some(e.to_string()),
                duration_ms: 0,
                attempts: claimed.job.attempts + 1,
                working_copy: None,
            },
        }
    }

    fn record(&self, slot: &BatchSlot, position: usize, run: ItemRun) {
        let batch_id = slot.lock().batch.id.clone();
        let message = format!("item {position} {}", run.status);
        let _ = self.progress.complete_item(&batch_id, position, &message);

        let mut guard = slot.lock();
        let st = &mut *guard;
        st.in_flight = st.in_flight.saturating_sub(1);
        let continue_on_error = st.batch.policy.continue_on_error;
        let Some(item) = st.batch.items.get_mut(position) else {
            return;
        };
        item.status = run.status;
        item.error = run.error;
        item.duration_ms = run.duration_ms;
        item.attempts = run.attempts;
        item.working_copy = run.working_copy;

        if item.status == ItemStatus::Failed && !continue_on_error && !st.halted {
            tracing::warn!(batch = %st.batch.id, image = %item.image_path.display(), "halting dispatch after failure");
            st.batch.failure = Some(format!("halted after {} failed", item.image_path.display()));
            st.halted = true;
        }
        let _ = self.commit(slot, st);
    }

    fn worker_lost(&self, slot: &BatchSlot, position: usize, reason: &str) {
        let mut guard = slot.lock();
        let st = &mut *guard;
        // A worker that died after recording has already given back its slot.
        if let Some(item) = st
            .batch
            .items
            .get_mut(position)
            .filter(|item| item.status == ItemStatus::Running)
        {
            item.status = ItemStatus::Failed;
            item.error = Some(format!("worker lost: {reason}"));
            st.in_flight = st.in_flight.saturating_sub(1);
        }
        tracing::error!(batch = %st.batch.id, position, reason, "worker lost");
        abort(slot, st, format!("worker lost: {reason}"));
        let _ = self.commit(slot, st);
    }

    /// Settles the batch once nothing is in flight. Returns whether the
    /// dispatcher should exit.
    fn finish_if_idle(&self, slot: &BatchSlot) -> bool {
        let mut guard = slot.lock();
        let st = &mut *guard;
        if st.in_flight > 0 {
            return false;
        }
        let event = match st.batch.state {
            BatchState::Running if st.halted => Some(BatchEvent::Fail),
            BatchState::Running if st.batch.is_settled() => Some(BatchEvent::Complete),
            BatchState::Running => return false,
            BatchState::Paused if st.halted => Some(BatchEvent::Fail),
            _ => None,
        };
        if let Some(event) = event {
            match st.batch.apply(event) {
                Ok(state) => tracing::info!(
                    batch = %st.batch.id,
                    state = %state,
                    success = st.batch.counts.success,
                    failed = st.batch.counts.failed,
                    skipped = st.batch.counts.skipped,
                    "batch finished"
                ),
                Err(e) => tracing::error!(batch = %st.batch.id, error = %e, "cannot settle batch"),
            }
        }
        st.dispatching = false;
        let _ = self.commit(slot, st);
        true
    }
}

/// Stops dispatch and fails the batch.
fn abort(slot: &BatchSlot, st: &mut SlotState, reason: String) {
    st.halted = true;
    st.batch.failure = Some(reason);
    if st.batch.state.is_active() {
        let _ = st.batch.apply(BatchEvent::Fail);
    }
    st.cancel.cancel();
    slot.wake.notify_one();
}

fn ensure_dispatcher(inner: &Arc<Inner>, slot: &Arc<BatchSlot>, st: &mut SlotState) {
    if st.dispatching {
        slot.wake.notify_one();
        return;
    }
    st.dispatching = true;
    let runtime = inner.runtime.clone();
    let _ = runtime.spawn(dispatch(Arc::clone(inner), Arc::clone(slot)));
}

async fn dispatch(inner: Arc<Inner>, slot: Arc<BatchSlot>) {
    let mut workers = JoinSet::new();
    let mut positions = HashMap::new();
    loop {
        while let Some(claimed) = inner.claim_next(&slot) {
            let position = claimed.job.position;
            let worker_inner = Arc::clone(&inner);
            let worker_slot = Arc::clone(&slot);
            let task = workers.spawn_blocking(move || {
                let run = worker_inner.execute(&claimed);
                worker_inner.record(&worker_slot, position, run);
            });
            let _ = positions.insert(task.id(), position);
        }

        if workers.is_empty() && inner.finish_if_idle(&slot) {
            break;
        }

        tokio::select! {
            Some(joined) = workers.join_next_with_id() => match joined {
                Ok((task, ())) => {
                    let _ = positions.remove(&task);
                }
                Err(e) => match positions.remove(&e.id()) {
                    Some(position) => inner.worker_lost(&slot, position, &e.to_string()),
                    None => tracing::error!(error = %e, "untracked worker task failed"),
                },
            },
            () = slot.wake.notified() => {}
        }
    }
}

fn recover(batch: &mut BatchOperation) -> Result<bool> {
    if !batch.state.is_active() {
        return Ok(false);
    }
    for item in &mut batch.items {
        if item.status == ItemStatus::Running {
            item.reset();
        }
    }
    if batch.state == BatchState::Running {
        let _ = batch.apply(BatchEvent::Pause)?;
    }
    batch.recount();
    Ok(true)
}

/// Configures and builds an [`Orchestrator`].
pub struct OrchestratorBuilder {
    services: MountServices,
    catalog: TransformCatalog,
    store: Arc<dyn BatchStore>,
    sink: Arc<dyn ProgressSink>,
    default_policy: BatchPolicy,
}

impl OrchestratorBuilder {
    /// Persists batches to `store` (in memory by default).
    #[must_use]
    pub fn store(mut self, store: Arc<dyn BatchStore>) -> Self {
        self.store = store;
        self
    }

    /// Forwards aggregated progress to `sink` (logged by default).
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Policy for batches created without one.
    #[must_use]
    pub const fn default_policy(mut self, policy: BatchPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// Restores stored batches and reconciles the mount registry.
    ///
    /// Batches that were `Running` when the process stopped come back
    /// `Paused`, with their in-flight items returned to `Pending`.
    ///
    /// # Errors
    ///
    /// Returns an error outside a tokio runtime, for an invalid default
    /// policy, or if the store cannot be read or updated.
    pub fn build(self) -> Result<Orchestrator> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| ForgeError::Config {
            message: format!("orchestrator requires a tokio runtime: {e}"),
        })?;
        self.default_policy.validate()?;

        let progress = ProgressAggregator::new(self.sink);
        let mut batches = HashMap::new();
        for mut batch in self.store.load_all()? {
            if recover(&mut batch)? {
                tracing::warn!(batch = %batch.id, name = %batch.name, "interrupted batch restored as paused");
                self.store.save(&batch)?;
            }
            progress.track(&batch.id, batch.items.len(), batch.counts.terminal());
            let percentage = progress.percentage(&batch.id);
            let _ = batches.insert(batch.id.clone(), Arc::new(BatchSlot::new(batch, percentage)));
        }
        if !batches.is_empty() {
            tracing::info!(count = batches.len(), "batches restored");
        }

        match self.services.reconcile() {
            Ok(report) if !report.is_clean() => tracing::warn!(
                dropped = report.dropped.len(),
                unowned = report.unowned.len(),
                "mount registry reconciled with host"
            ),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "could not reconcile mounts with host"),
        }

        Ok(Orchestrator {
            inner: Arc::new(Inner {
                services: self.services,
                catalog: self.catalog,
                store: self.store,
                progress,
                default_policy: self.default_policy,
                runtime,
                batches: Mutex::new(batches),
            }),
        })
    }
}

/// Batch queue and worker pool.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("catalog", &self.inner.catalog)
            .field("default_policy", &self.inner.default_policy)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Starts configuring an orchestrator.
    #[must_use]
    pub fn builder(services: MountServices, catalog: TransformCatalog) -> OrchestratorBuilder {
        OrchestratorBuilder {
            services,
            catalog,
            store: Arc::new(MemoryStore::new()),
            sink: Arc::new(TracingSink),
            default_policy: BatchPolicy::default(),
        }
    }

    /// Builds an orchestrator from configuration, persisting under
    /// `batch_dir`.
    ///
    /// # Errors
    ///
    /// See [`OrchestratorBuilder::build`].
    pub fn from_config(config: &ForgeConfig, catalog: TransformCatalog) -> Result<Self> {
        let store = JsonFileStore::open(config.batch_dir.clone())?;
        Self::builder(MountServices::from_config(config), catalog)
            .store(Arc::new(store))
            .default_policy(config.default_policy)
            .build()
    }

    /// Mount services shared with workers.
    #[must_use]
    pub fn services(&self) -> &MountServices {
        &self.inner.services
    }

    /// Registered transforms.
    #[must_use]
    pub fn catalog(&self) -> &TransformCatalog {
        &self.inner.catalog
    }

    /// Validates a spec and enqueues the batch.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown operation type, `Config` for an
    /// invalid spec, or a storage error.
    pub fn create_batch(&self, spec: BatchSpec) -> Result<BatchId> {
        let _ = self.inner.catalog.get(&spec.operation)?;
        let mut batch = BatchOperation::new(spec, self.inner.default_policy)?;
        let _ = batch.apply(BatchEvent::Enqueue)?;
        self.inner.store.save(&batch)?;

        let id = batch.id.clone();
        tracing::info!(
            batch = %id,
            name = %batch.name,
            operation = %batch.operation_type,
            items = batch.items.len(),
            max_parallel = batch.policy.max_parallel,
            "batch created"
        );
        self.inner.progress.track(&id, batch.items.len(), 0);
        let slot = Arc::new(BatchSlot::new(batch, 0.0));
        let _ = self
            .inner
            .batches
            .lock()
            .map_err(poisoned)?
            .insert(id.clone(), slot);
        Ok(id)
    }

    /// Starts dispatching a queued batch.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless the batch is `Queued`.
    pub fn start(&self, id: &BatchId) -> Result<()> {
        let slot = self.inner.slot(id)?;
        let mut guard = slot.lock();
        let st = &mut *guard;
        let _ = st.batch.apply(BatchEvent::Start)?;
        st.halted = false;
        st.batch.failure = None;
        self.inner.commit(&slot, st)?;
        tracing::info!(batch = %id, "batch started");
        ensure_dispatcher(&self.inner, &slot, st);
        Ok(())
    }

    /// Starts the queued batch with the lowest priority value, if any.
    ///
    /// # Errors
    ///
    /// See [`start`](Self::start).
    pub fn start_next_queued(&self) -> Result<Option<BatchId>> {
        let next = self
            .list()?
            .into_iter()
            .find(|status| status.state == BatchState::Queued);
        match next {
            Some(status) => {
                self.start(&status.id)?;
                Ok(Some(status.id))
            }
            None => Ok(None),
        }
    }

    /// Stops dispatching new items. Items already running finish normally.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless the batch is `Running`.
    pub fn pause(&self, id: &BatchId) -> Result<()> {
        let slot = self.inner.slot(id)?;
        let mut guard = slot.lock();
        let st = &mut *guard;
        let _ = st.batch.apply(BatchEvent::Pause)?;
        self.inner.commit(&slot, st)?;
        slot.wake.notify_one();
        tracing::info!(batch = %id, in_flight = st.in_flight, "batch paused");
        Ok(())
    }

    /// Resumes a paused batch.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless the batch is `Paused`.
    pub fn resume(&self, id: &BatchId) -> Result<()> {
        let slot = self.inner.slot(id)?;
        let mut guard = slot.lock();
        let st = &mut *guard;
        let _ = st.batch.apply(BatchEvent::Resume)?;
        self.inner.commit(&slot, st)?;
        tracing::info!(batch = %id, "batch resumed");
        ensure_dispatcher(&self.inner, &slot, st);
        Ok(())
    }

    /// Cancels a batch: pending items become `Skipped`, running items stop
    /// at their next step boundary or finish and are recorded.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless the batch is `Running` or `Paused`.
    pub fn cancel(&self, id: &BatchId) -> Result<()> {
        let slot = self.inner.slot(id)?;
        let mut guard = slot.lock();
        let st = &mut *guard;
        let _ = st.batch.apply(BatchEvent::Cancel)?;
        st.cancel.cancel();
        for item in &mut st.batch.items {
            if item.status == ItemStatus::Pending {
                item.status = ItemStatus::Skipped;
                item.error = Some("batch cancelled".into());
            }
        }
        st.batch.recount();
        self.inner
            .progress
            .track(id, st.batch.items.len(), st.batch.counts.terminal());
        self.inner.commit(&slot, st)?;
        slot.wake.notify_one();
        tracing::info!(batch = %id, in_flight = st.in_flight, "batch cancelled");
        Ok(())
    }

    /// Resets `Failed` items to `Pending` and runs them again.
    ///
    /// A `Completed` or `Failed` batch is re-queued and started; a `Running`
    /// or `Paused` batch picks the items up through its dispatcher. Returns
    /// the number of items reset.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` for `Created`, `Queued`, or `Cancelled`
    /// batches.
    pub fn retry_failed_images(&self, id: &BatchId) -> Result<usize> {
        let slot = self.inner.slot(id)?;
        let mut guard = slot.lock();
        let st = &mut *guard;
        let state = st.batch.state;
        if !matches!(
            state,
            BatchState::Completed | BatchState::Failed | BatchState::Running | BatchState::Paused
        ) {
            return Err(ForgeError::InvalidTransition {
                entity: "batch",
                from: state.to_string(),
                action: "retry",
            });
        }

        let mut reset = 0;
        for item in &mut st.batch.items {
            if item.status == ItemStatus::Failed {
                item.reset();
                reset += 1;
            }
        }
        st.batch.recount();
        if reset == 0 && st.batch.counts.pending == 0 {
            return Ok(0);
        }

        st.halted = false;
        st.batch.failure = None;
        if matches!(state, BatchState::Completed | BatchState::Failed) {
            let _ = st.batch.apply(BatchEvent::Retry)?;
            let _ = st.batch.apply(BatchEvent::Start)?;
            if st.cancel.is_cancelled() {
                st.cancel = CancellationToken::new();
            }
        }
        self.inner
            .progress
            .track(id, st.batch.items.len(), st.batch.counts.terminal());
        self.inner.commit(&slot, st)?;
        tracing::info!(batch = %id, reset, "retrying failed items");
        if st.batch.state == BatchState::Running {
            ensure_dispatcher(&self.inner, &slot, st);
        }
        Ok(reset)
    }

    /// Removes a batch that is not running.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` while the batch is `Running` or `Paused`
    /// or still has items in flight.
    pub fn delete(&self, id: &BatchId) -> Result<()> {
        let slot = self.inner.slot(id)?;
        {
            let st = slot.lock();
            if st.batch.state.is_active() || st.in_flight > 0 {
                return Err(ForgeError::InvalidTransition {
                    entity: "batch",
                    from: st.batch.state.to_string(),
                    action: "delete",
                });
            }
        }
        self.inner.store.delete(id)?;
        let _ = self.inner.batches.lock().map_err(poisoned)?.remove(id);
        self.inner.progress.forget(id);
        tracing::info!(batch = %id, "batch deleted");
        Ok(())
    }

    /// Current snapshot of a batch.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown batch.
    pub fn status(&self, id: &BatchId) -> Result<BatchStatus> {
        let slot = self.inner.slot(id)?;
        let st = slot.lock();
        Ok(st.batch.status(self.inner.progress.percentage(id)))
    }

    /// Snapshots of every batch, ordered by priority then creation time.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch table lock is poisoned.
    pub fn list(&self) -> Result<Vec<BatchStatus>> {
        let mut rows: Vec<_> = self
            .inner
            .slots()?
            .iter()
            .map(|slot| {
                let st = slot.lock();
                let percentage = self.inner.progress.percentage(&st.batch.id);
                (
                    st.batch.priority,
                    st.batch.created_at.clone(),
                    st.batch.status(percentage),
                )
            })
            .collect();
        rows.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        Ok(rows.into_iter().map(|(_, _, status)| status).collect())
    }

    /// Registers a callback receiving `(percentage, message)` for a batch.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown batch.
    pub fn register_progress_callback(&self, id: &BatchId, callback: ProgressCallback) -> Result<()> {
        let _ = self.inner.slot(id)?;
        self.inner.progress.register_callback(id, callback);
        Ok(())
    }

    /// Receiver of status snapshots, updated on every state or item change.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown batch.
    pub fn subscribe(&self, id: &BatchId) -> Result<watch::Receiver<BatchStatus>> {
        Ok(self.inner.slot(id)?.status_tx.subscribe())
    }

    /// Waits until a snapshot of the batch satisfies `predicate`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown or deleted batch.
    pub async fn wait_for(
        &self,
        id: &BatchId,
        mut predicate: impl FnMut(&BatchStatus) -> bool,
    ) -> Result<BatchStatus> {
        let mut rx = self.subscribe(id)?;
        let status = rx
            .wait_for(|status| predicate(status))
            .await
            .map_err(|_| ForgeError::NotFound {
                kind: "batch",
                id: id.to_string(),
            })?
            .clone();
        Ok(status)
    }

    /// Waits until the batch leaves `Running`/`Paused` with nothing in flight.
    ///
    /// # Errors
    ///
    /// See [`wait_for`](Self::wait_for).
    pub async fn wait_settled(&self, id: &BatchId) -> Result<BatchStatus> {
        self.wait_for(id, |status| {
            matches!(
                status.state,
                BatchState::Completed | BatchState::Failed | BatchState::Cancelled
            ) && status.counts.running == 0
        })
        .await
    }

    /// Re-encodes the working copy kept for a compressed item into
    /// `destination`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown batch or image, or when the item
    /// has no kept working copy; otherwise the tool failure.
    pub fn export_working_copy(
        &self,
        id: &BatchId,
        image: impl AsRef<Path>,
        destination: &Path,
        compression: Compression,
    ) -> Result<()> {
        let image = image.as_ref();
        let copy = {
            let slot = self.inner.slot(id)?;
            let st = slot.lock();
            st.batch
                .items
                .iter()
                .find(|item| item.image_path == image)
                .and_then(|item| item.working_copy.clone())
        }
        .ok_or_else(|| ForgeError::NotFound {
            kind: "working copy",
            id: format!("{id}/{}", image.display()),
        })?;
        let _ = self
            .inner
            .services
            .tool
            .export_image(&copy, 1, destination, compression)?
            .check("export-image")?;
        tracing::info!(batch = %id, image = %image.display(), destination = %destination.display(), "working copy exported");
        Ok(())
    }

    /// Reconciles the mount registry with the host.
    ///
    /// # Errors
    ///
    /// Returns an error if the host cannot be probed.
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        self.inner.services.reconcile()
    }
}
