//! Durable batch documents.
//!
//! Each batch is one JSON document keyed by its id. The mount registry is
//! not persisted; it is rebuilt by reconciling against the host.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use imgforge_common::error::{ForgeError, Result};
use imgforge_common::types::BatchId;

use crate::batch::BatchOperation;

/// Storage for batch documents.
pub trait BatchStore: Send + Sync {
    /// Writes the current document for a batch, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns `ForgeError::Storage` if the document cannot be written.
    fn save(&self, batch: &BatchOperation) -> Result<()>;

    /// Reads every stored batch, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `ForgeError::Storage` if the store cannot be read.
    fn load_all(&self) -> Result<Vec<BatchOperation>>;

    /// Removes a batch document. Removing an absent document is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `ForgeError::Storage` if the document cannot be removed.
    fn delete(&self, id: &BatchId) -> Result<()>;
}

fn storage(path: &Path, e: impl std::fmt::Display) -> ForgeError {
    ForgeError::Storage {
        message: format!("{}: {e}", path.display()),
    }
}

/// One pretty-printed JSON file per batch under a directory.
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Opens or creates the store directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| ForgeError::io(&dir, e))?;
        Ok(Self { dir })
    }

    /// Directory holding the documents.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &BatchId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

impl BatchStore for JsonFileStore {
    fn save(&self, batch: &BatchOperation) -> Result<()> {
        let path = self.path_for(&batch.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(batch)?;
        std::fs::write(&tmp, json).map_err(|e| storage(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| storage(&path, e))
    }

    fn load_all(&self) -> Result<Vec<BatchOperation>> {
        let reader = std::fs::read_dir(&self.dir).map_err(|e| storage(&self.dir, e))?;
        let mut batches = Vec::new();
        for entry in reader {
            let path = entry.map_err(|e| storage(&self.dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = std::fs::read_to_string(&path).map_err(|e| storage(&path, e))?;
            match serde_json::from_str::<BatchOperation>(&content) {
                Ok(batch) => batches.push(batch),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable batch document"),
            }
        }
        batches.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(batches)
    }

    fn delete(&self, id: &BatchId) -> Result<()> {
        let path = self.path_for(id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage(&path, e)),
        }
    }
}

/// In-process store holding serialized documents.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<BatchId, String>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<BatchId, String>>> {
        self.docs.lock().map_err(|_| ForgeError::Storage {
            message: "memory store lock poisoned".into(),
        })
    }
}

impl BatchStore for MemoryStore {
    fn save(&self, batch: &BatchOperation) -> Result<()> {
        let json = serde_json::to_string(batch)?;
        let _ = self.lock()?.insert(batch.id.clone(), json);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<BatchOperation>> {
        let docs = self.lock()?;
        let mut batches = docs
            .values()
            .map(|json| serde_json::from_str::<BatchOperation>(json))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        batches.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(batches)
    }

    fn delete(&self, id: &BatchId) -> Result<()> {
        let _ = self.lock()?.remove(id);
        Ok(())
    }
}
