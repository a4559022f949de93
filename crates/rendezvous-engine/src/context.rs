use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use parking_lot::Mutex;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ContextStoreError {
    #[error("failed to access context id at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no platform data directory available")]
    NoDataDir,
}

/// Durable home for the context id that lets a restarted session prove it
/// continues an earlier one.
pub trait ContextIdStore: Send + Sync {
    fn has_stored_context_id(&self) -> bool;
    fn context_id(&self) -> Result<Option<String>, ContextStoreError>;
    fn set_context_id(&self, id: &str) -> Result<(), ContextStoreError>;
}

/// Reuses the stored context id when there is one, otherwise mints and stores
/// a fresh one. Store failures degrade to an ephemeral id.
pub fn resolve_context_id(store: Option<&dyn ContextIdStore>) -> String {
    let Some(store) = store else {
        return Uuid::new_v4().to_string();
    };
    if store.has_stored_context_id() {
        match store.context_id() {
            Ok(Some(existing)) => return existing,
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(
                    target = "rendezvous::context",
                    error = %err,
                    "stored context id unreadable; using ephemeral id"
                );
                return Uuid::new_v4().to_string();
            }
        }
    }
    let fresh = Uuid::new_v4().to_string();
    if let Err(err) = store.set_context_id(&fresh) {
        tracing::warn!(
            target = "rendezvous::context",
            error = %err,
            "failed to persist context id"
        );
    }
    fresh
}

#[derive(Debug, Default)]
pub struct MemoryContextIdStore {
    slot: Mutex<Option<String>>,
}

impl MemoryContextIdStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            slot: Mutex::new(Some(id.into())),
        }
    }
}

impl ContextIdStore for MemoryContextIdStore {
    fn has_stored_context_id(&self) -> bool {
        self.slot.lock().is_some()
    }

    fn context_id(&self) -> Result<Option<String>, ContextStoreError> {
        Ok(self.slot.lock().clone())
    }

    fn set_context_id(&self, id: &str) -> Result<(), ContextStoreError> {
        *self.slot.lock() = Some(id.to_string());
        Ok(())
    }
}

/// Keeps the context id in a small text file.
#[derive(Debug, Clone)]
pub struct FileContextIdStore {
    path: PathBuf,
}

impl FileContextIdStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data dir>/rendezvous/<label>.context-id` under the platform's
    /// per-user data directory.
    pub fn in_data_dir(label: &str) -> Result<Self, ContextStoreError> {
        let dirs = ProjectDirs::from("dev", "rendezvous", "rendezvous")
            .ok_or(ContextStoreError::NoDataDir)?;
        Ok(Self::new(dirs.data_dir().join(format!("{label}.context-id"))))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> ContextStoreError {
        ContextStoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl ContextIdStore for FileContextIdStore {
    fn has_stored_context_id(&self) -> bool {
        matches!(self.context_id(), Ok(Some(_)))
    }

    fn context_id(&self) -> Result<Option<String>, ContextStoreError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => {
                let trimmed = contents.trim();
                Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(self.io_error(err)),
        }
    }

    fn set_context_id(&self, id: &str) -> Result<(), ContextStoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| self.io_error(err))?;
        }
        fs::write(&self.path, id).map_err(|err| self.io_error(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenStore;

    impl ContextIdStore for BrokenStore {
        fn has_stored_context_id(&self) -> bool {
            true
        }

        fn context_id(&self) -> Result<Option<String>, ContextStoreError> {
            Err(ContextStoreError::NoDataDir)
        }

        fn set_context_id(&self, _id: &str) -> Result<(), ContextStoreError> {
            Err(ContextStoreError::NoDataDir)
        }
    }

    #[test]
    fn resolve_reuses_stored_id() {
        let store = MemoryContextIdStore::with_id("ctx-1");
        assert_eq!(resolve_context_id(Some(&store)), "ctx-1");
    }

    #[test]
    fn resolve_persists_fresh_id() {
        let store = MemoryContextIdStore::new();
        let minted = resolve_context_id(Some(&store));
        assert!(store.has_stored_context_id());
        assert_eq!(resolve_context_id(Some(&store)), minted);
    }

    #[test]
    fn broken_store_falls_back_to_ephemeral_ids() {
        let first = resolve_context_id(Some(&BrokenStore));
        let second = resolve_context_id(Some(&BrokenStore));
        assert_ne!(first, second);
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("room.context-id");
        let store = FileContextIdStore::new(&path);
        assert!(!store.has_stored_context_id());
        let minted = resolve_context_id(Some(&store));

        let reopened = FileContextIdStore::new(&path);
        assert_eq!(reopened.context_id().unwrap().as_deref(), Some(minted.as_str()));
    }
}
