//! Orchestrator behavior against fake host tools.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{FakeTool, Gate, gated, harness, harness_with_store, noop, services, settled, slow, until};
use imgforge_batch::batch::{BatchOperation, BatchSpec, TargetImage};
use imgforge_batch::orchestrator::Orchestrator;
use imgforge_batch::progress::ProgressUpdate;
use imgforge_batch::state::BatchEvent;
use imgforge_batch::store::{BatchStore, JsonFileStore, MemoryStore};
use imgforge_batch::transform::{FnTransform, TransformCatalog, TransformContext};
use imgforge_common::error::{ForgeError, Result};
use imgforge_common::types::{BatchId, BatchPolicy, BatchState, ItemStatus};
use imgforge_image::tool::Compression;

fn policy(max_parallel: usize, continue_on_error: bool, max_retries: u32) -> BatchPolicy {
    BatchPolicy {
        max_parallel,
        continue_on_error,
        max_retries,
    }
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

fn statuses(status: &imgforge_batch::batch::BatchStatus) -> Vec<ItemStatus> {
    status.items.iter().map(|i| i.status).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_item_does_not_stop_batch_and_retry_reruns_only_it() {
    let h = harness(TransformCatalog::new().with(noop("debloat")));
    h.tool.fail_mount_of("b.wim");
    let orch = &h.orchestrator;

    let id = orch
        .create_batch(
            BatchSpec::new("nightly", "debloat")
                .targets(["a.wim", "b.wim", "c.wim"])
                .policy(policy(2, true, 0)),
        )
        .unwrap();
    assert_eq!(orch.status(&id).unwrap().state, BatchState::Queued);
    orch.start(&id).unwrap();

    let status = settled(orch, &id).await;
    assert_eq!(status.state, BatchState::Completed);
    assert_eq!(
        statuses(&status),
        vec![ItemStatus::Success, ItemStatus::Failed, ItemStatus::Success]
    );
    let failed = status.item("b.wim").unwrap();
    assert!(failed.error.as_deref().unwrap().contains("Access is denied"));
    assert_eq!(status.counts.failed, 1);
    assert!(close(status.percentage, 100.0));
    assert_eq!(h.tool.unmounts("commit"), 2);

    h.tool.allow("b.wim");
    assert_eq!(orch.retry_failed_images(&id).unwrap(), 1);
    let status = settled(orch, &id).await;
    assert_eq!(status.state, BatchState::Completed);
    assert!(status.items.iter().all(|i| i.status == ItemStatus::Success));
    assert_eq!(status.item("b.wim").unwrap().attempts, 2);
    assert_eq!(h.tool.mounts_of("a.wim"), 1);
    assert_eq!(h.tool.mounts_of("b.wim"), 2);
    assert_eq!(h.tool.mounts_of("c.wim"), 1);
    assert_eq!(h.tool.active_mounts(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn max_parallel_bounds_concurrent_mounts() {
    let h = harness(TransformCatalog::new().with(slow("drivers", Duration::from_millis(40))));
    let orch = &h.orchestrator;
    let id = orch
        .create_batch(
            BatchSpec::new("wide", "drivers")
                .targets(["1.wim", "2.wim", "3.wim", "4.wim", "5.wim", "6.wim"])
                .policy(policy(2, true, 0)),
        )
        .unwrap();
    orch.start(&id).unwrap();

    let status = settled(orch, &id).await;
    assert_eq!(status.state, BatchState::Completed);
    assert_eq!(status.counts.success, 6);
    assert_eq!(h.tool.peak_mounts(), 2);
    assert_eq!(h.tool.active_mounts(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_worker_runs_items_one_at_a_time() {
    let h = harness(TransformCatalog::new().with(slow("drivers", Duration::from_millis(10))));
    let orch = &h.orchestrator;
    let id = orch
        .create_batch(
            BatchSpec::new("narrow", "drivers")
                .targets(["1.wim", "2.wim", "3.wim"])
                .policy(policy(1, true, 0)),
        )
        .unwrap();
    orch.start(&id).unwrap();
    let _ = settled(orch, &id).await;
    assert_eq!(h.tool.peak_mounts(), 1);
    assert_eq!(h.tool.mount_order(), vec!["1.wim", "2.wim", "3.wim"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn items_dispatch_by_priority_then_queue_order() {
    let h = harness(TransformCatalog::new().with(noop("debloat")));
    let orch = &h.orchestrator;
    let id = orch
        .create_batch(
            BatchSpec::new("ordered", "debloat")
                .target(TargetImage::new("late.wim").with_priority(5))
                .target(TargetImage::new("first.wim").with_priority(1))
                .target(TargetImage::new("second.wim").with_priority(1))
                .policy(policy(1, true, 0)),
        )
        .unwrap();
    orch.start(&id).unwrap();
    let _ = settled(orch, &id).await;
    assert_eq!(h.tool.mount_order(), vec!["first.wim", "second.wim", "late.wim"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pause_holds_pending_items_until_resume() {
    let gate = Gate::new();
    let h = harness(TransformCatalog::new().with(gated("debloat", Arc::clone(&gate))));
    let orch = &h.orchestrator;
    let id = orch
        .create_batch(
            BatchSpec::new("pausable", "debloat")
                .targets(["a.wim", "b.wim"])
                .policy(policy(1, true, 0)),
        )
        .unwrap();
    orch.start(&id).unwrap();
    gate.wait_entered(1).await;

    orch.pause(&id).unwrap();
    assert_eq!(orch.status(&id).unwrap().state, BatchState::Paused);
    gate.open();

    let _ = until(orch, &id, |s| s.item("a.wim").unwrap().status == ItemStatus::Success).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let status = orch.status(&id).unwrap();
    assert_eq!(status.state, BatchState::Paused);
    assert_eq!(status.item("b.wim").unwrap().status, ItemStatus::Pending);
    assert_eq!(gate.entered(), vec!["a.wim"]);

    orch.resume(&id).unwrap();
    let status = settled(orch, &id).await;
    assert_eq!(status.state, BatchState::Completed);
    assert_eq!(status.counts.success, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_skips_pending_and_records_running_item() {
    let gate = Gate::new();
    let h = harness(TransformCatalog::new().with(gated("debloat", Arc::clone(&gate))));
    let orch = &h.orchestrator;
    let id = orch
        .create_batch(
            BatchSpec::new("cancellable", "debloat")
                .targets(["a.wim", "b.wim", "c.wim"])
                .policy(policy(1, true, 0)),
        )
        .unwrap();
    orch.start(&id).unwrap();
    gate.wait_entered(1).await;

    orch.cancel(&id).unwrap();
    let status = orch.status(&id).unwrap();
    assert_eq!(status.state, BatchState::Cancelled);
    assert_eq!(
        statuses(&status),
        vec![ItemStatus::Running, ItemStatus::Skipped, ItemStatus::Skipped]
    );

    gate.open();
    let status = settled(orch, &id).await;
    assert_eq!(status.state, BatchState::Cancelled);
    assert_eq!(status.item("a.wim").unwrap().status, ItemStatus::Success);
    assert_eq!(h.tool.mounts_of("b.wim"), 0);
    assert_eq!(h.tool.active_mounts(), 0);

    assert!(matches!(
        orch.retry_failed_images(&id),
        Err(ForgeError::InvalidTransition { action: "retry", .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_on_error_fails_batch_and_keeps_rest_pending() {
    let h = harness(TransformCatalog::new().with(noop("debloat")));
    h.tool.fail_mount_of("a.wim");
    let orch = &h.orchestrator;
    let id = orch
        .create_batch(
            BatchSpec::new("strict", "debloat")
                .targets(["a.wim", "b.wim", "c.wim"])
                .policy(policy(1, false, 0)),
        )
        .unwrap();
    orch.start(&id).unwrap();

    let status = settled(orch, &id).await;
    assert_eq!(status.state, BatchState::Failed);
    assert_eq!(
        statuses(&status),
        vec![ItemStatus::Failed, ItemStatus::Pending, ItemStatus::Pending]
    );
    assert!(status.failure.as_deref().unwrap().contains("a.wim"));

    h.tool.allow("a.wim");
    assert_eq!(orch.retry_failed_images(&id).unwrap(), 1);
    let status = settled(orch, &id).await;
    assert_eq!(status.state, BatchState::Completed);
    assert_eq!(status.counts.success, 3);
    assert!(status.failure.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retryable_failures_are_retried_within_budget() {
    let h = harness(TransformCatalog::new().with(noop("debloat")));
    h.tool.fail_mount_times("flaky.wim", 2);
    h.tool.fail_mount_of("broken.wim");
    let orch = &h.orchestrator;
    let id = orch
        .create_batch(
            BatchSpec::new("retries", "debloat")
                .targets(["flaky.wim", "broken.wim"])
                .policy(policy(2, true, 2)),
        )
        .unwrap();
    orch.start(&id).unwrap();

    let status = settled(orch, &id).await;
    let flaky = status.item("flaky.wim").unwrap();
    assert_eq!(flaky.status, ItemStatus::Success);
    assert_eq!(flaky.attempts, 3);
    let broken = status.item("broken.wim").unwrap();
    assert_eq!(broken.status, ItemStatus::Failed);
    assert_eq!(broken.attempts, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn encrypted_source_fails_without_retry() {
    let h = harness(TransformCatalog::new().with(noop("debloat")));
    h.tool.mark_encrypted("locked.esd");
    let orch = &h.orchestrator;
    let id = orch
        .create_batch(
            BatchSpec::new("esd", "debloat")
                .target("locked.esd")
                .policy(policy(1, true, 3)),
        )
        .unwrap();
    orch.start(&id).unwrap();

    let status = settled(orch, &id).await;
    let item = status.item("locked.esd").unwrap();
    assert_eq!(item.status, ItemStatus::Failed);
    assert_eq!(item.attempts, 1);
    assert!(item.error.as_deref().unwrap().contains("encrypted"));
    assert!(h.tool.mount_order().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transform_error_discards_changes() {
    let failing = FnTransform::new("tweaks", |_: &mut TransformContext<'_>| -> Result<()> {
        Err(ForgeError::Config {
            message: "tweak rejected".into(),
        })
    });
    let h = harness(TransformCatalog::new().with(failing));
    let orch = &h.orchestrator;
    let id = orch
        .create_batch(BatchSpec::new("bad", "tweaks").target("a.wim"))
        .unwrap();
    orch.start(&id).unwrap();

    let status = settled(orch, &id).await;
    assert_eq!(status.state, BatchState::Completed);
    let item = status.item("a.wim").unwrap();
    assert_eq!(item.status, ItemStatus::Failed);
    assert!(item.error.as_deref().unwrap().contains("tweak rejected"));
    assert_eq!(h.tool.unmounts("discard"), 1);
    assert_eq!(h.tool.unmounts("commit"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_save_fails_item() {
    let h = harness(TransformCatalog::new().with(noop("debloat")));
    h.tool.fail_commit.store(true, Ordering::SeqCst);
    let orch = &h.orchestrator;
    let id = orch
        .create_batch(BatchSpec::new("unsaved", "debloat").target("a.wim"))
        .unwrap();
    orch.start(&id).unwrap();

    let status = settled(orch, &id).await;
    let item = status.item("a.wim").unwrap();
    assert_eq!(item.status, ItemStatus::Failed);
    assert!(item.error.as_deref().unwrap().contains("not saved"));
    assert_eq!(h.tool.active_mounts(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_transform_is_contained() {
    let exploding = FnTransform::new("explode", |ctx: &mut TransformContext<'_>| -> Result<()> {
        if ctx.handle().path().ends_with("boom.wim") {
            panic!("boom");
        }
        Ok(())
    });
    let h = harness(TransformCatalog::new().with(exploding));
    let orch = &h.orchestrator;
    let id = orch
        .create_batch(
            BatchSpec::new("panics", "explode")
                .targets(["boom.wim", "fine.wim"])
                .policy(policy(1, true, 0)),
        )
        .unwrap();
    orch.start(&id).unwrap();

    let status = settled(orch, &id).await;
    assert_eq!(status.state, BatchState::Completed);
    let boom = status.item("boom.wim").unwrap();
    assert_eq!(boom.status, ItemStatus::Failed);
    assert!(boom.error.as_deref().unwrap().contains("boom"));
    assert_eq!(status.item("fine.wim").unwrap().status, ItemStatus::Success);
    assert_eq!(h.tool.unmounts("discard"), 1);
    assert_eq!(h.tool.active_mounts(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn batches_are_listed_and_started_by_priority() {
    let h = harness(TransformCatalog::new().with(noop("debloat")));
    let orch = &h.orchestrator;
    let later = orch
        .create_batch(BatchSpec::new("later", "debloat").target("a.wim").priority(5))
        .unwrap();
    let sooner = orch
        .create_batch(BatchSpec::new("sooner", "debloat").target("b.wim").priority(1))
        .unwrap();

    let listed: Vec<BatchId> = orch.list().unwrap().into_iter().map(|s| s.id).collect();
    assert_eq!(listed, vec![sooner.clone(), later.clone()]);

    assert_eq!(orch.start_next_queued().unwrap(), Some(sooner.clone()));
    let _ = settled(orch, &sooner).await;
    assert_eq!(orch.start_next_queued().unwrap(), Some(later.clone()));
    let _ = settled(orch, &later).await;
    assert_eq!(orch.start_next_queued().unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_requests_are_rejected() {
    let gate = Gate::new();
    let h = harness(TransformCatalog::new().with(gated("debloat", Arc::clone(&gate))));
    let orch = &h.orchestrator;

    assert!(matches!(
        orch.create_batch(BatchSpec::new("x", "unknown").target("a.wim")),
        Err(ForgeError::NotFound { kind: "transform", .. })
    ));
    assert!(matches!(
        orch.create_batch(BatchSpec::new("x", "debloat")),
        Err(ForgeError::Config { .. })
    ));
    assert!(matches!(
        orch.create_batch(BatchSpec::new("x", "debloat").target("a.wim").policy(policy(0, true, 0))),
        Err(ForgeError::Config { .. })
    ));

    let id = orch
        .create_batch(BatchSpec::new("guarded", "debloat").target("a.wim"))
        .unwrap();
    assert!(matches!(
        orch.pause(&id),
        Err(ForgeError::InvalidTransition { action: "pause", .. })
    ));
    assert!(matches!(
        orch.resume(&id),
        Err(ForgeError::InvalidTransition { action: "resume", .. })
    ));

    orch.start(&id).unwrap();
    gate.wait_entered(1).await;
    assert!(matches!(
        orch.start(&id),
        Err(ForgeError::InvalidTransition { action: "start", .. })
    ));
    assert!(matches!(
        orch.delete(&id),
        Err(ForgeError::InvalidTransition { action: "delete", .. })
    ));

    gate.open();
    let _ = settled(orch, &id).await;
    orch.delete(&id).unwrap();
    assert!(matches!(
        orch.status(&id),
        Err(ForgeError::NotFound { kind: "batch", .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn progress_reaches_callbacks_and_sink() {
    let root = tempfile::tempdir().unwrap();
    let tool = FakeTool::new();
    let published = Arc::new(Mutex::new(Vec::new()));
    let sink_published = Arc::clone(&published);
    let orch = Orchestrator::builder(
        services(root.path(), &tool),
        TransformCatalog::new().with(slow("drivers", Duration::from_millis(5))),
    )
    .sink(Arc::new(move |u: &ProgressUpdate| {
        sink_published.lock().unwrap().push(u.clone());
    }))
    .build()
    .unwrap();

    let id = orch
        .create_batch(BatchSpec::new("progress", "drivers").targets(["a.wim", "b.wim", "c.wim"]))
        .unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_cb = Arc::clone(&seen);
    orch.register_progress_callback(
        &id,
        Arc::new(move |pct: f64, _: &str| seen_cb.lock().unwrap().push(pct)),
    )
    .unwrap();
    orch.start(&id).unwrap();

    let status = settled(&orch, &id).await;
    assert!(close(status.percentage, 100.0));
    let seen = seen.lock().unwrap();
    assert!(!seen.is_empty());
    assert!(seen.iter().any(|p| close(*p, 100.0)));
    assert!(seen.iter().all(|p| (0.0..=100.0).contains(p)));

    let published = published.lock().unwrap();
    assert!(published.iter().all(|u| u.batch == id));
    assert!(published.iter().any(|u| u.message == "working"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_progress_callback_does_not_wedge_batch() {
    let h = harness(TransformCatalog::new().with(noop("debloat")));
    let orch = &h.orchestrator;
    let id = orch
        .create_batch(BatchSpec::new("noisy", "debloat").targets(["a.wim", "b.wim"]))
        .unwrap();
    orch.register_progress_callback(
        &id,
        Arc::new(|_: f64, msg: &str| {
            if msg.starts_with("item 0") {
                panic!("consumer bug");
            }
        }),
    )
    .unwrap();
    orch.start(&id).unwrap();

    let status = settled(orch, &id).await;
    assert_eq!(status.state, BatchState::Completed);
    assert_eq!(statuses(&status), vec![ItemStatus::Success, ItemStatus::Success]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn compressed_items_record_their_saved_working_copy() {
    let h = harness(TransformCatalog::new().with(noop("debloat")));
    let orch = &h.orchestrator;
    let id = orch
        .create_batch(BatchSpec::new("esd", "debloat").targets(["a.esd", "b.esd", "c.wim"]))
        .unwrap();
    orch.start(&id).unwrap();

    let status = settled(orch, &id).await;
    assert_eq!(status.state, BatchState::Completed);
    let a = status.item("a.esd").unwrap().working_copy.clone().expect("a.esd copy");
    let b = status.item("b.esd").unwrap().working_copy.clone().expect("b.esd copy");
    assert_ne!(a, b);
    for copy in [&a, &b] {
        assert!(copy.starts_with(h.root.path().join("work")));
        assert!(copy.exists());
    }
    assert!(status.item("c.wim").unwrap().working_copy.is_none());

    let dest = h.root.path().join("a-serviced.esd");
    orch.export_working_copy(&id, "a.esd", &dest, Compression::Recovery)
        .unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), b"exported");
    assert!(matches!(
        orch.export_working_copy(&id, "c.wim", &dest, Compression::Recovery),
        Err(ForgeError::NotFound { kind: "working copy", .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn finished_batches_survive_restart() {
    let store_dir = tempfile::tempdir().unwrap();
    let id = {
        let store = Arc::new(JsonFileStore::open(store_dir.path()).unwrap());
        let h = harness_with_store(TransformCatalog::new().with(noop("debloat")), store);
        let id = h
            .orchestrator
            .create_batch(BatchSpec::new("durable", "debloat").targets(["a.wim", "b.wim"]))
            .unwrap();
        h.orchestrator.start(&id).unwrap();
        let _ = settled(&h.orchestrator, &id).await;
        id
    };

    let store = Arc::new(JsonFileStore::open(store_dir.path()).unwrap());
    let h = harness_with_store(TransformCatalog::new().with(noop("debloat")), store);
    let status = h.orchestrator.status(&id).unwrap();
    assert_eq!(status.state, BatchState::Completed);
    assert_eq!(status.counts.success, 2);
    assert!(close(status.percentage, 100.0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interrupted_batch_is_restored_paused_and_resumable() {
    let store = Arc::new(MemoryStore::new());
    let mut batch = BatchOperation::new(
        BatchSpec::new("interrupted", "debloat").targets(["a.wim", "b.wim"]),
        BatchPolicy::default(),
    )
    .unwrap();
    let _ = batch.apply(BatchEvent::Enqueue).unwrap();
    let _ = batch.apply(BatchEvent::Start).unwrap();
    batch.items[0].status = ItemStatus::Running;
    batch.items[0].attempts = 1;
    batch.recount();
    store.save(&batch).unwrap();

    let h = harness_with_store(TransformCatalog::new().with(noop("debloat")), store);
    let orch = &h.orchestrator;
    let status = orch.status(&batch.id).unwrap();
    assert_eq!(status.state, BatchState::Paused);
    assert_eq!(
        statuses(&status),
        vec![ItemStatus::Pending, ItemStatus::Pending]
    );

    orch.resume(&batch.id).unwrap();
    let status = settled(orch, &batch.id).await;
    assert_eq!(status.state, BatchState::Completed);
    assert_eq!(status.item("a.wim").unwrap().attempts, 2);
}

/// Store that starts failing on request.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    broken: AtomicBool,
}

impl BatchStore for FlakyStore {
    fn save(&self, batch: &BatchOperation) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(ForgeError::Storage {
                message: "disk full".into(),
            });
        }
        self.inner.save(batch)
    }

    fn load_all(&self) -> Result<Vec<BatchOperation>> {
        self.inner.load_all()
    }

    fn delete(&self, id: &BatchId) -> Result<()> {
        self.inner.delete(id)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn storage_failure_fails_the_batch() {
    let store = Arc::new(FlakyStore::default());
    let h = harness_with_store(
        TransformCatalog::new().with(noop("debloat")),
        Arc::clone(&store) as Arc<dyn BatchStore>,
    );
    let orch = &h.orchestrator;
    let id = orch
        .create_batch(BatchSpec::new("fragile", "debloat").target("a.wim"))
        .unwrap();

    store.broken.store(true, Ordering::SeqCst);
    assert!(matches!(orch.start(&id), Err(ForgeError::Storage { .. })));
    let status = orch.status(&id).unwrap();
    assert_eq!(status.state, BatchState::Failed);
    assert!(status.failure.as_deref().unwrap().contains("disk full"));
    assert!(h.tool.mount_order().is_empty());
}

/// Store that panics the first time it is asked to save a finished item.
#[derive(Default)]
struct PanickyStore {
    inner: MemoryStore,
    tripped: AtomicBool,
}

impl BatchStore for PanickyStore {
    fn save(&self, batch: &BatchOperation) -> Result<()> {
        let finished = batch.items.iter().any(|i| i.status == ItemStatus::Success);
        if finished && !self.tripped.swap(true, Ordering::SeqCst) {
            panic!("store bug");
        }
        self.inner.save(batch)
    }

    fn load_all(&self) -> Result<Vec<BatchOperation>> {
        self.inner.load_all()
    }

    fn delete(&self, id: &BatchId) -> Result<()> {
        self.inner.delete(id)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lost_worker_fails_the_batch_instead_of_hanging() {
    let h = harness_with_store(
        TransformCatalog::new().with(noop("debloat")),
        Arc::new(PanickyStore::default()),
    );
    let orch = &h.orchestrator;
    let id = orch
        .create_batch(BatchSpec::new("fragile", "debloat").target("a.wim"))
        .unwrap();
    orch.start(&id).unwrap();

    let status = settled(orch, &id).await;
    assert_eq!(status.state, BatchState::Failed);
    assert_eq!(status.counts.running, 0);
    assert!(status.failure.as_deref().unwrap().contains("worker lost"));
    assert_eq!(h.tool.active_mounts(), 0);
}
