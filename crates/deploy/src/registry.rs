//! Deployment registry.
//!
//! The registry is the only state that outlives a run. It answers "has this
//! exact artifact, with these exact inputs, already been deployed", keeps the
//! submission intent of transactions that are still waiting for confirmation,
//! and remembers the initialization outcome of every composite.

use std::{
    fs::OpenOptions,
    path::{Path, PathBuf},
    sync::Mutex,
};

use alloy_core::primitives::{Address, B256};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fingerprint::Fingerprint;

/// Errors raised by registry backends.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry I/O error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("registry file {path} is corrupted")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(
        "`{artifact}` with fingerprint {fingerprint} is already recorded at {existing}, refusing to record {new}"
    )]
    Conflict {
        artifact: String,
        fingerprint: Fingerprint,
        existing: Address,
        new: Address,
    },

    #[error("registry lock poisoned")]
    Poisoned,
}

/// A confirmed deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub artifact: String,
    pub address: Address,
    pub fingerprint: Fingerprint,
    pub tx_hash: B256,
    pub block_number: u64,
    /// Unix timestamp (seconds) when the entry was recorded.
    pub recorded_at: i64,
}

/// Submission intent, recorded before waiting for confirmation so that an
/// interrupted run re-attaches to the transaction instead of resubmitting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSubmission {
    pub artifact: String,
    pub fingerprint: Fingerprint,
    pub tx_hash: B256,
    pub submitted_at: i64,
}

/// Outcome of a composite's initializer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InitState {
    Initialized,
    /// Terminal: the composite exists but was never initialized.
    Failed { reason: String },
}

/// Initialization ledger entry, one per composite address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitRecord {
    pub composite: String,
    pub address: Address,
    pub method: String,
    pub state: InitState,
    pub recorded_at: i64,
}

/// Everything a registry persists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryState {
    #[serde(default)]
    pub entries: Vec<RegistryEntry>,
    #[serde(default)]
    pub pending: Vec<PendingSubmission>,
    #[serde(default)]
    pub initializations: Vec<InitRecord>,
}

impl RegistryState {
    pub fn lookup(&self, artifact: &str, fingerprint: &Fingerprint) -> Option<&RegistryEntry> {
        self.entries
            .iter()
            .find(|entry| entry.artifact == artifact && &entry.fingerprint == fingerprint)
    }

    pub fn pending(&self, artifact: &str, fingerprint: &Fingerprint) -> Option<&PendingSubmission> {
        self.pending
            .iter()
            .find(|pending| pending.artifact == artifact && &pending.fingerprint == fingerprint)
    }

    pub fn init_record(&self, address: &Address) -> Option<&InitRecord> {
        self.initializations
            .iter()
            .find(|record| &record.address == address)
    }

    fn record_pending(&mut self, pending: PendingSubmission) {
        self.clear_pending(&pending.artifact, &pending.fingerprint);
        self.pending.push(pending);
    }

    fn clear_pending(&mut self, artifact: &str, fingerprint: &Fingerprint) {
        self.pending
            .retain(|pending| !(pending.artifact == artifact && &pending.fingerprint == fingerprint));
    }

    /// Record a confirmed entry and drop the matching submission intent.
    ///
    /// At most one address exists per `(artifact, fingerprint)`.
    fn confirm(&mut self, entry: RegistryEntry) -> Result<(), RegistryError> {
        if let Some(existing) = self.lookup(&entry.artifact, &entry.fingerprint) {
            if existing.address != entry.address {
                return Err(RegistryError::Conflict {
                    artifact: entry.artifact,
                    fingerprint: entry.fingerprint,
                    existing: existing.address,
                    new: entry.address,
                });
            }
            self.clear_pending(&entry.artifact, &entry.fingerprint);
            return Ok(());
        }

        self.clear_pending(&entry.artifact, &entry.fingerprint);
        self.entries.push(entry);
        Ok(())
    }

    fn record_init(&mut self, record: InitRecord) {
        self.initializations
            .retain(|existing| existing.address != record.address);
        self.initializations.push(record);
    }

    /// Remove everything recorded about an artifact. Returns the number of
    /// records removed.
    fn forget(&mut self, artifact: &str) -> usize {
        let before = self.entries.len() + self.pending.len() + self.initializations.len();
        self.entries.retain(|entry| entry.artifact != artifact);
        self.pending.retain(|pending| pending.artifact != artifact);
        self.initializations
            .retain(|record| record.composite != artifact);
        before - (self.entries.len() + self.pending.len() + self.initializations.len())
    }
}

/// Storage backend for [`RegistryState`].
///
/// Every `update` is atomic: either the whole mutation is persisted or none
/// of it is.
pub trait Registry: Send + Sync {
    /// Read a consistent snapshot.
    fn read(&self) -> Result<RegistryState, RegistryError>;

    /// Apply a mutation atomically.
    fn update<T>(
        &self,
        mutate: impl FnOnce(&mut RegistryState) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError>;

    fn lookup(
        &self,
        artifact: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Option<RegistryEntry>, RegistryError> {
        Ok(self.read()?.lookup(artifact, fingerprint).cloned())
    }

    fn pending(
        &self,
        artifact: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Option<PendingSubmission>, RegistryError> {
        Ok(self.read()?.pending(artifact, fingerprint).cloned())
    }

    fn init_record(&self, address: &Address) -> Result<Option<InitRecord>, RegistryError> {
        Ok(self.read()?.init_record(address).cloned())
    }

    fn record_pending(&self, pending: PendingSubmission) -> Result<(), RegistryError> {
        self.update(|state| {
            state.record_pending(pending);
            Ok(())
        })
    }

    fn clear_pending(&self, artifact: &str, fingerprint: &Fingerprint) -> Result<(), RegistryError> {
        self.update(|state| {
            state.clear_pending(artifact, fingerprint);
            Ok(())
        })
    }

    fn confirm(&self, entry: RegistryEntry) -> Result<(), RegistryError> {
        self.update(|state| state.confirm(entry))
    }

    /// Record a composite together with its initialization outcome, so that
    /// no composite is ever recorded without one.
    fn confirm_composite(&self, entry: RegistryEntry, init: InitRecord) -> Result<(), RegistryError> {
        self.update(|state| {
            state.confirm(entry)?;
            state.record_init(init);
            Ok(())
        })
    }

    fn forget(&self, artifact: &str) -> Result<usize, RegistryError> {
        self.update(|state| Ok(state.forget(artifact)))
    }
}

/// Registry kept in memory. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    state: Mutex<RegistryState>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing snapshot.
    pub fn with_state(state: RegistryState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }
}

impl Registry for MemoryRegistry {
    fn read(&self) -> Result<RegistryState, RegistryError> {
        self.state
            .lock()
            .map(|state| state.clone())
            .map_err(|_| RegistryError::Poisoned)
    }

    fn update<T>(
        &self,
        mutate: impl FnOnce(&mut RegistryState) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let mut guard = self.state.lock().map_err(|_| RegistryError::Poisoned)?;
        // Mutate a copy so that a failed mutation leaves no trace.
        let mut next = guard.clone();
        let value = mutate(&mut next)?;
        *guard = next;
        Ok(value)
    }
}

/// Registry persisted as a JSON file, one per network.
///
/// Writes go to a temporary file that is renamed over the registry, under an
/// exclusive lock on a sibling `.lock` file shared by all processes.
///
/// Every call blocks the calling thread on file I/O and on the lock. Deploy
/// futures call it inline, so a run waiting on another process's lock stalls
/// its runtime worker until the lock is released.
#[derive(Debug)]
pub struct FileRegistry {
    path: PathBuf,
    lock_path: PathBuf,
    local: Mutex<()>,
}

impl FileRegistry {
    /// Open (or prepare) the registry of `network` inside `dir`.
    pub fn open(dir: impl AsRef<Path>, network: &str) -> Result<Self, RegistryError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|source| RegistryError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let path = dir.join(format!("{network}.json"));
        let lock_path = dir.join(format!("{network}.json.lock"));
        tracing::debug!(path = %path.display(), "Registry opened");

        Ok(Self {
            path,
            lock_path,
            local: Mutex::new(()),
        })
    }

    /// Path of the registry file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, path: &Path) -> impl FnOnce(std::io::Error) -> RegistryError + use<> {
        let path = path.to_path_buf();
        move |source| RegistryError::Io { path, source }
    }

    fn with_lock<T>(
        &self,
        shared: bool,
        f: impl FnOnce() -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let _local = self.local.lock().map_err(|_| RegistryError::Poisoned)?;

        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(self.io_error(&self.lock_path))?;

        if shared {
            FileExt::lock_shared(&lock_file)
        } else {
            FileExt::lock_exclusive(&lock_file)
        }
        .map_err(self.io_error(&self.lock_path))?;

        let result = f();

        if let Err(e) = FileExt::unlock(&lock_file) {
            tracing::warn!(err = %e, path = %self.lock_path.display(), "Failed to release registry lock");
        }

        result
    }

    fn load(&self) -> Result<RegistryState, RegistryError> {
        if !self.path.exists() {
            return Ok(RegistryState::default());
        }

        let content = std::fs::read_to_string(&self.path).map_err(self.io_error(&self.path))?;
        serde_json::from_str(&content).map_err(|source| RegistryError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    fn store(&self, state: &RegistryState) -> Result<(), RegistryError> {
        let json = serde_json::to_string_pretty(state).map_err(|source| RegistryError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json).map_err(self.io_error(&tmp_path))?;
        std::fs::rename(&tmp_path, &self.path).map_err(self.io_error(&self.path))?;
        Ok(())
    }
}

impl Registry for FileRegistry {
    fn read(&self) -> Result<RegistryState, RegistryError> {
        self.with_lock(true, || self.load())
    }

    fn update<T>(
        &self,
        mutate: impl FnOnce(&mut RegistryState) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        self.with_lock(false, || {
            let mut state = self.load()?;
            let value = mutate(&mut state)?;
            self.store(&state)?;
            Ok(value)
        })
    }
}

/// Current unix time in seconds.
pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
