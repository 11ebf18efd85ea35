use crate::error::StoreError;
use crate::learner::LearnedTimeout;
use crate::timing::OpKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const STATE_VERSION: u32 = 1;

/// Document persisted between runs. Missing keys deserialize to empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    pub version: u32,
    pub learned_timeouts: BTreeMap<OpKind, LearnedTimeout>,
    pub failed_registers: BTreeSet<u16>,
}

/// Key-value persistence for learned state.
pub trait StateStore: Send + Sync {
    /// `Ok(None)` when nothing has been stored yet.
    fn read(&self) -> Result<Option<PersistedState>, StoreError>;
    fn write(&self, state: &PersistedState) -> Result<(), StoreError>;
}

/// Stored state, or the empty default when absent or unreadable.
pub fn read_state(store: &dyn StateStore) -> PersistedState {
    match store.read() {
        Ok(Some(state)) => state,
        Ok(None) => PersistedState::default(),
        Err(e) => {
            tracing::warn!("Ignoring unreadable persisted state: {}", e);
            PersistedState::default()
        }
    }
}

/// JSON document on disk, replaced atomically on write.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for JsonFileStore {
    fn read(&self) -> Result<Option<PersistedState>, StoreError> {
        let json = match std::fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&json)?))
    }

    fn write(&self, state: &PersistedState) -> Result<(), StoreError> {
        let mut state = state.clone();
        state.version = STATE_VERSION;
        let json = serde_json::to_string_pretty(&state)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        tracing::debug!("Persisted state to {}", self.path.display());
        Ok(())
    }
}

/// In-process store, serialized through JSON like the file store.
#[derive(Default)]
pub struct MemoryStore {
    document: Mutex<Option<String>>,
}

impl StateStore for MemoryStore {
    fn read(&self) -> Result<Option<PersistedState>, StoreError> {
        let document = self.document.lock().unwrap_or_else(|e| e.into_inner());
        document
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(StoreError::from)
    }

    fn write(&self, state: &PersistedState) -> Result<(), StoreError> {
        let mut state = state.clone();
        state.version = STATE_VERSION;
        let json = serde_json::to_string(&state)?;
        *self.document.lock().unwrap_or_else(|e| e.into_inner()) = Some(json);
        Ok(())
    }
}
