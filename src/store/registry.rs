use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{LatchError, Result};
use crate::model::WorkRegistry;
use crate::store::lock;

pub const REGISTRY_FILE: &str = "registry.json";
const REGISTRY_LOCK_FILE: &str = "registry.lock";

/// The shared registry document under `.latch/`, plus the mutex that
/// serializes read-modify-write cycles across processes.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    root: PathBuf,
    timeout: Duration,
}

impl RegistryStore {
    /// Open (but do not yet create) the registry in `latch_dir`.
    pub fn open(latch_dir: &Path, timeout: Duration) -> Self {
        Self {
            root: latch_dir.to_path_buf(),
            timeout,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry_path(&self) -> PathBuf {
        self.root.join(REGISTRY_FILE)
    }

    fn lock_path(&self) -> PathBuf {
        self.root.join(REGISTRY_LOCK_FILE)
    }

    /// Create the directory and seed an empty registry if absent.
    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(|e| {
            LatchError::RegistryUnavailable(format!("{}: {e}", self.root.display()))
        })?;
        if !self.registry_path().exists() {
            let _guard = lock::acquire_lock(&self.lock_path(), self.timeout)?;
            if !self.registry_path().exists() {
                self.save(&WorkRegistry::default())?;
            }
        }
        Ok(())
    }

    /// Read the registry, treating an unparsable document as empty.
    ///
    /// A missing file is an empty registry too.
    pub fn load(&self) -> Result<WorkRegistry> {
        match self.load_strict() {
            Err(LatchError::RegistryCorrupt(path, reason)) => {
                warn!(%path, %reason, "registry corrupt; treating as empty");
                Ok(WorkRegistry::default())
            }
            other => other,
        }
    }

    /// Read the registry, surfacing corruption as `RegistryCorrupt`.
    pub fn load_strict(&self) -> Result<WorkRegistry> {
        let path = self.registry_path();
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(WorkRegistry::default());
            }
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(WorkRegistry::default());
        }
        serde_json::from_str(&content)
            .map_err(|e| LatchError::RegistryCorrupt(path.display().to_string(), e.to_string()))
    }

    /// Atomically replace the document: write a temp file in the same
    /// directory, fsync, rename over the target.
    ///
    /// Callers must hold the registry mutex; use [`RegistryStore::with_lock`].
    pub fn save(&self, registry: &WorkRegistry) -> Result<()> {
        let json = serde_json::to_string_pretty(registry)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.registry_path()).map_err(|e| e.error)?;
        Ok(())
    }

    /// Run `f` against the freshly loaded registry while holding the mutex.
    /// The document is saved only if `f` changed it.
    pub fn with_lock<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut WorkRegistry) -> Result<T>,
    {
        if !self.root.is_dir() {
            return Err(LatchError::RegistryUnavailable(format!(
                "{} does not exist",
                self.root.display()
            )));
        }
        let guard = lock::acquire_lock(&self.lock_path(), self.timeout)?;

        let before = self.load()?;
        let mut registry = before.clone();
        let out = f(&mut registry)?;
        if registry != before {
            self.save(&registry)?;
        } else {
            debug!("registry unchanged; skipping save");
        }

        lock::release_lock(guard)?;
        Ok(out)
    }
}
