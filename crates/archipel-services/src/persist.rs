//! Persistence collaborator — the narrow load/save interface behind which
//! the trust store and manifest catalogue are kept across restarts.
//!
//! `JsonPersistence` writes two files under the data directory:
//!   trust.json      every TrustEntry ever recorded
//!   manifests.json  every manifest this node has shared or heard about
//!
//! Both are written atomically (temp file + rename). Stores hand their
//! snapshots to `SaveOrder`, which keeps concurrent saves from landing out
//! of order and runs the file I/O on Tokio's blocking pool.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::catalogue::StoredManifest;
use crate::trust::TrustEntry;

pub trait Persistence: Send + Sync {
    fn load_trust_store(&self) -> Result<Vec<TrustEntry>, PersistError>;
    fn save_trust_store(&self, entries: &[TrustEntry]) -> Result<(), PersistError>;
    fn load_manifests(&self) -> Result<Vec<StoredManifest>, PersistError>;
    fn save_manifests(&self, manifests: &[StoredManifest]) -> Result<(), PersistError>;
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

// ── Save ordering ─────────────────────────────────────────────────────────────

/// Orders snapshot saves from concurrent callers. Each snapshot is numbered
/// when taken, and a write never replaces a newer snapshot already written.
#[derive(Default)]
pub(crate) struct SaveOrder {
    taken: Mutex<u64>,
    written: Arc<Mutex<u64>>,
}

pub(crate) struct Snapshot<T> {
    generation: u64,
    items: T,
    written: Arc<Mutex<u64>>,
}

impl SaveOrder {
    /// Number and capture a snapshot. Numbering and capture happen under one
    /// lock, so a higher number always holds every earlier change.
    pub(crate) fn take<T>(&self, snapshot: impl FnOnce() -> T) -> Snapshot<T> {
        let mut taken = self.taken.lock().unwrap_or_else(|p| p.into_inner());
        *taken += 1;
        Snapshot {
            generation: *taken,
            items: snapshot(),
            written: self.written.clone(),
        }
    }

    /// Take a snapshot and write it. Inside a Tokio runtime the write runs
    /// on the blocking pool; otherwise inline. Failures are logged.
    pub(crate) fn save<T, W>(&self, what: &'static str, snapshot: impl FnOnce() -> T, write: W)
    where
        T: Send + 'static,
        W: FnOnce(&T) -> Result<(), PersistError> + Send + 'static,
    {
        let snapshot = self.take(snapshot);
        let job = move || {
            if let Err(e) = snapshot.commit(write) {
                tracing::warn!(error = %e, store = what, "failed to persist");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => drop(handle.spawn_blocking(job)),
            Err(_) => job(),
        }
    }
}

impl<T> Snapshot<T> {
    /// Write unless a newer snapshot already landed. False when skipped.
    pub(crate) fn commit(
        self,
        write: impl FnOnce(&T) -> Result<(), PersistError>,
    ) -> Result<bool, PersistError> {
        let mut last = self.written.lock().unwrap_or_else(|p| p.into_inner());
        if *last > self.generation {
            return Ok(false);
        }
        write(&self.items)?;
        *last = self.generation;
        Ok(true)
    }
}

// ── JSON files ────────────────────────────────────────────────────────────────

pub const TRUST_FILE: &str = "trust.json";
pub const MANIFESTS_FILE: &str = "manifests.json";

/// File-backed persistence rooted at a data directory.
pub struct JsonPersistence {
    root: PathBuf,
    // Serialises writers so two saves never race on the same temp file.
    write_lock: Mutex<()>,
}

impl JsonPersistence {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| PersistError::Io {
            path: root.clone(),
            source: e,
        })?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>, PersistError> {
        let path = self.root.join(name);
        let text = match fs::read(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PersistError::Io { path, source: e }),
        };
        serde_json::from_slice(&text).map_err(|e| PersistError::Json { path, source: e })
    }

    fn save<T: Serialize>(&self, name: &str, items: &[T]) -> Result<(), PersistError> {
        let path = self.root.join(name);
        let json = serde_json::to_vec_pretty(items).map_err(|e| PersistError::Json {
            path: path.clone(),
            source: e,
        })?;

        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let tmp = path.with_extension("json.tmp");
        let io_err = |e| PersistError::Io {
            path: tmp.clone(),
            source: e,
        };
        {
            let mut file = fs::File::create(&tmp).map_err(io_err)?;
            file.write_all(&json).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
        }
        fs::rename(&tmp, &path).map_err(|e| PersistError::Io { path, source: e })
    }
}

impl Persistence for JsonPersistence {
    fn load_trust_store(&self) -> Result<Vec<TrustEntry>, PersistError> {
        self.load(TRUST_FILE)
    }

    fn save_trust_store(&self, entries: &[TrustEntry]) -> Result<(), PersistError> {
        self.save(TRUST_FILE, entries)
    }

    fn load_manifests(&self) -> Result<Vec<StoredManifest>, PersistError> {
        self.load(MANIFESTS_FILE)
    }

    fn save_manifests(&self, manifests: &[StoredManifest]) -> Result<(), PersistError> {
        self.save(MANIFESTS_FILE, manifests)
    }
}

// ── In memory ─────────────────────────────────────────────────────────────────

/// Keeps the last saved snapshot in memory. For tests and ephemeral nodes.
#[derive(Default)]
pub struct MemoryPersistence {
    trust: Mutex<Vec<TrustEntry>>,
    manifests: Mutex<Vec<StoredManifest>>,
}

impl MemoryPersistence {
    /// Start with a pre-existing trust table.
    pub fn with_trust(entries: Vec<TrustEntry>) -> Self {
        Self {
            trust: Mutex::new(entries),
            manifests: Mutex::new(Vec::new()),
        }
    }
}

impl Persistence for MemoryPersistence {
    fn load_trust_store(&self) -> Result<Vec<TrustEntry>, PersistError> {
        Ok(self.trust.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }

    fn save_trust_store(&self, entries: &[TrustEntry]) -> Result<(), PersistError> {
        *self.trust.lock().unwrap_or_else(|p| p.into_inner()) = entries.to_vec();
        Ok(())
    }

    fn load_manifests(&self) -> Result<Vec<StoredManifest>, PersistError> {
        Ok(self.manifests.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }

    fn save_manifests(&self, manifests: &[StoredManifest]) -> Result<(), PersistError> {
        *self.manifests.lock().unwrap_or_else(|p| p.into_inner()) = manifests.to_vec();
        Ok(())
    }
}
