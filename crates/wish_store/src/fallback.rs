//! Local key/value storage used when the remote store is out of reach

use std::{
    collections::HashMap,
    fs,
    io::ErrorKind,
    path::PathBuf,
    sync::RwLock,
};

use entities::Wish;
use tracing::debug;

use crate::{WishStoreError, WishStoreResult};

/// Storage key holding the fallback entry list
pub const FALLBACK_KEY: &str = "guestbook_fallback";

/// Trait for local persisted storage
pub trait FallbackStorage: Send + Sync {
    /// Gets the value stored under a key
    fn get(&self, key: &str) -> WishStoreResult<Option<String>>;

    /// Stores a value, replacing any previous one
    fn set(&self, key: &str, value: &str) -> WishStoreResult<()>;

    /// Removes a key
    fn remove(&self, key: &str) -> WishStoreResult<()>;
}

/// Loads the persisted fallback list.
///
/// Returns `Ok(None)` when nothing was stored yet; a stored value that does
/// not parse is an error so the caller can keep its current list.
pub fn load_wishes(storage: &dyn FallbackStorage) -> WishStoreResult<Option<Vec<Wish>>> {
    match storage.get(FALLBACK_KEY)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Persists the full fallback list, overwriting the previous one
pub fn save_wishes(storage: &dyn FallbackStorage, wishes: &[Wish]) -> WishStoreResult<()> {
    let raw = serde_json::to_string(wishes)?;
    storage.set(FALLBACK_KEY, &raw)?;
    debug!(count = wishes.len(), "Persisted fallback wishes");
    Ok(())
}

/// In-memory storage for testing
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    /// Creates an empty storage
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> WishStoreError {
    WishStoreError::Other("storage lock poisoned".to_string())
}

impl FallbackStorage for MemoryStorage {
    fn get(&self, key: &str) -> WishStoreResult<Option<String>> {
        let items = self.items.read().map_err(poisoned)?;
        Ok(items.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> WishStoreResult<()> {
        let mut items = self.items.write().map_err(poisoned)?;
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> WishStoreResult<()> {
        let mut items = self.items.write().map_err(poisoned)?;
        items.remove(key);
        Ok(())
    }
}

/// File-backed storage: one JSON file per key inside a data directory
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Creates a storage rooted at `dir`; the directory is created on first
    /// write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> WishStoreResult<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(WishStoreError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl FallbackStorage for FileStorage {
    fn get(&self, key: &str) -> WishStoreResult<Option<String>> {
        match fs::read_to_string(self.path_for(key)?) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> WishStoreResult<()> {
        let path = self.path_for(key)?;
        fs::create_dir_all(&self.dir)?;

        // Write then rename so a crash never leaves a truncated list behind
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> WishStoreResult<()> {
        match fs::remove_file(self.path_for(key)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()), // Already removed
            Err(e) => Err(e.into()),
        }
    }
}
