//! Storage backends.
//!
//! A [`StorageProvider`] loads and persists whole partitions. The manager
//! never sends `storage.session` to a provider.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use thiserror::Error;
use tracing::debug;

use super::area::{StorageArea, StoredMap};
use crate::extensions::ExtensionId;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Stored data exists but cannot be decoded. The partition is unusable
    /// until an operator repairs it.
    #[error("stored data is malformed: {0}")]
    Corrupted(String),

    /// The backend failed; retrying may succeed.
    #[error("storage backend failure: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Loads and persists one partition at a time. Calls arrive on tokio's
/// blocking pool, so implementations may do synchronous IO.
pub trait StorageProvider: Send + Sync {
    /// `Ok(None)` means nothing has been stored yet.
    fn load(&self, extension: &ExtensionId, area: StorageArea)
        -> Result<Option<StoredMap>, ProviderError>;

    fn persist(
        &self,
        extension: &ExtensionId,
        area: StorageArea,
        items: &StoredMap,
    ) -> Result<(), ProviderError>;
}

type PartitionKey = (ExtensionId, StorageArea);

/// In-memory provider. Supports provisioning managed data and injecting
/// failures.
#[derive(Debug, Default)]
pub struct MemoryStorageProvider {
    partitions: RwLock<HashMap<PartitionKey, StoredMap>>,
    corrupted: RwLock<HashSet<PartitionKey>>,
    failing: AtomicBool,
}

impl MemoryStorageProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a partition, e.g. administrator-provided `managed` data.
    pub fn provision(&self, extension: ExtensionId, area: StorageArea, items: StoredMap) {
        self.partitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((extension, area), items);
    }

    /// Make every later load of this partition report corruption.
    pub fn corrupt(&self, extension: ExtensionId, area: StorageArea) {
        self.corrupted
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((extension, area));
    }

    /// While set, every load and persist fails with a backend error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// What is currently persisted for a partition.
    pub fn stored(&self, extension: &ExtensionId, area: StorageArea) -> Option<StoredMap> {
        self.partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(extension.clone(), area))
            .cloned()
    }

    fn check_failing(&self) -> Result<(), ProviderError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(ProviderError::Backend("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

impl StorageProvider for MemoryStorageProvider {
    fn load(
        &self,
        extension: &ExtensionId,
        area: StorageArea,
    ) -> Result<Option<StoredMap>, ProviderError> {
        self.check_failing()?;
        let key = (extension.clone(), area);
        if self
            .corrupted
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&key)
        {
            return Err(ProviderError::Corrupted(format!(
                "{} storage of '{}'",
                area, extension
            )));
        }
        Ok(self
            .partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned())
    }

    fn persist(
        &self,
        extension: &ExtensionId,
        area: StorageArea,
        items: &StoredMap,
    ) -> Result<(), ProviderError> {
        self.check_failing()?;
        self.provision(extension.clone(), area, items.clone());
        Ok(())
    }
}

/// One JSON file per partition: `<root>/ext-<id>/<area>.json`.
#[derive(Debug, Clone)]
pub struct JsonFileStorageProvider {
    root: PathBuf,
}

impl JsonFileStorageProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a partition's file. Extension ids are percent-encoded so
    /// they can never escape the root.
    pub fn partition_path(&self, extension: &ExtensionId, area: StorageArea) -> PathBuf {
        self.root
            .join(format!("ext-{}", urlencoding::encode(extension.as_str())))
            .join(format!("{}.json", area))
    }
}

impl StorageProvider for JsonFileStorageProvider {
    fn load(
        &self,
        extension: &ExtensionId,
        area: StorageArea,
    ) -> Result<Option<StoredMap>, ProviderError> {
        let path = self.partition_path(extension, area);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| ProviderError::Corrupted(format!("{}: {}", path.display(), e)))
    }

    fn persist(
        &self,
        extension: &ExtensionId,
        area: StorageArea,
        items: &StoredMap,
    ) -> Result<(), ProviderError> {
        let path = self.partition_path(extension, area);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(items)
            .map_err(|e| ProviderError::Backend(format!("Serialization failed: {}", e)))?;

        // Write then rename so a crash never leaves a half-written file.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &path)?;

        debug!(path = %path.display(), items = items.len(), "persisted storage partition");
        Ok(())
    }
}
