//! Transformation contract.
//!
//! A [`Transform`] runs against a mounted image. How steps are authored is
//! up to the embedding application; the orchestrator only looks them up by
//! operation type, schedules them, and isolates their failures.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use imgforge_common::error::{ForgeError, Result};
use imgforge_image::handle::ImageHandle;
use imgforge_image::hive::{HiveGuard, HiveManager, OfflineHive};

/// A step applied to a mounted image.
pub trait Transform: Send + Sync {
    /// Catalog key and log label.
    fn name(&self) -> &str;

    /// Mutates the mounted image.
    ///
    /// # Errors
    ///
    /// Any error fails the item; the image is then dismounted without saving.
    fn apply(&self, ctx: &mut TransformContext<'_>) -> Result<()>;
}

/// What a transform can reach while it runs.
pub struct TransformContext<'a> {
    handle: &'a ImageHandle,
    hives: &'a HiveManager,
    cancel: &'a CancellationToken,
    reporter: &'a (dyn Fn(f64, &str) + Sync),
}

impl<'a> TransformContext<'a> {
    /// Bundles the mounted handle with its collaborators.
    ///
    /// `reporter` receives the transform's own percentage (0 to 100).
    #[must_use]
    pub fn new(
        handle: &'a ImageHandle,
        hives: &'a HiveManager,
        cancel: &'a CancellationToken,
        reporter: &'a (dyn Fn(f64, &str) + Sync),
    ) -> Self {
        Self {
            handle,
            hives,
            cancel,
            reporter,
        }
    }

    /// The mounted image.
    #[must_use]
    pub const fn handle(&self) -> &ImageHandle {
        self.handle
    }

    /// Root of the mounted filesystem.
    ///
    /// # Errors
    ///
    /// Returns `NotMounted` if the handle lost its mount.
    pub fn mount_root(&self) -> Result<&Path> {
        self.handle
            .mount_point()
            .map(|mp| mp.as_path())
            .ok_or_else(|| ForgeError::NotMounted {
                path: self.handle.path().to_path_buf(),
            })
    }

    /// The shared hive manager.
    #[must_use]
    pub const fn hives(&self) -> &'a HiveManager {
        self.hives
    }

    /// Loads one of the image's standard hives under its conventional key.
    ///
    /// # Errors
    ///
    /// Returns `NotMounted` or the hive load failure.
    pub fn offline_hive(&self, hive: OfflineHive) -> Result<HiveGuard<'a>> {
        let file = hive.file_in(self.mount_root()?);
        self.hives.load(&file, hive.default_key())
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Step boundary: fails with `Cancelled` if cancellation was requested.
    ///
    /// # Errors
    ///
    /// Returns `ForgeError::Cancelled` naming `step`.
    pub fn checkpoint(&self, step: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ForgeError::Cancelled {
                step: step.to_string(),
            });
        }
        Ok(())
    }

    /// Reports the transform's own progress.
    pub fn report(&self, percentage: f64, message: &str) {
        (self.reporter)(percentage, message);
    }
}

/// Transforms keyed by operation type.
#[derive(Clone, Default)]
pub struct TransformCatalog {
    transforms: HashMap<String, Arc<dyn Transform>>,
}

impl std::fmt::Debug for TransformCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformCatalog")
            .field("operations", &self.names())
            .finish()
    }
}

impl TransformCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `transform` under its name, replacing any previous entry.
    pub fn register(&mut self, transform: Arc<dyn Transform>) {
        let name = transform.name().to_string();
        if self.transforms.insert(name.clone(), transform).is_some() {
            tracing::debug!(operation = %name, "transform replaced");
        }
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, transform: impl Transform + 'static) -> Self {
        self.register(Arc::new(transform));
        self
    }

    /// Looks up an operation type.
    ///
    /// # Errors
    ///
    /// Returns `ForgeError::NotFound` for unknown operation types.
    pub fn get(&self, operation: &str) -> Result<Arc<dyn Transform>> {
        self.transforms
            .get(operation)
            .cloned()
            .ok_or_else(|| ForgeError::NotFound {
                kind: "transform",
                id: operation.to_string(),
            })
    }

    /// Registered operation types, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.transforms.keys().cloned().collect();
        names.sort();
        names
    }
}

/// A transform backed by a closure.
pub struct FnTransform<F> {
    name: String,
    f: F,
}

impl<F> FnTransform<F>
where
    F: Fn(&mut TransformContext<'_>) -> Result<()> + Send + Sync,
{
    /// Wraps `f` under `name`.
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> Transform for FnTransform<F>
where
    F: Fn(&mut TransformContext<'_>) -> Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, ctx: &mut TransformContext<'_>) -> Result<()> {
        (self.f)(ctx)
    }
}

/// Named sequence of transforms with a cancellation check before each step.
#[derive(Clone)]
pub struct Pipeline {
    name: String,
    steps: Vec<Arc<dyn Transform>>,
}

impl Pipeline {
    /// Creates an empty pipeline.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Appends a step.
    #[must_use]
    pub fn step(mut self, step: impl Transform + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    /// Step names in order.
    #[must_use]
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }
}

impl Transform for Pipeline {
    fn name(&self) -> &str {
        &self.name
    }

    #[allow(clippy::cast_precision_loss)]
    fn apply(&self, ctx: &mut TransformContext<'_>) -> Result<()> {
        let total = self.steps.len().max(1) as f64;
        for (position, step) in self.steps.iter().enumerate() {
            ctx.checkpoint(step.name())?;
            ctx.report(position as f64 / total * 100.0, step.name());
            tracing::debug!(pipeline = %self.name, step = step.name(), "running step");
            step.apply(ctx)?;
        }
        ctx.report(100.0, &self.name);
        Ok(())
    }
}
