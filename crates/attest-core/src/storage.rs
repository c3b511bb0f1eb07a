//! Key-value persistence port.
//!
//! The engine never talks to a database directly; guideline collections and
//! metric history go through [`KeyValueStore`]. Two backends ship with the
//! crate: [`InMemoryStore`] and the directory-backed [`FileStore`].

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::error::{EngineError, ErrorCode};

/// Errors from a storage backend.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored value is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid storage key: {0}")]
    InvalidKey(String),
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        EngineError::new(ErrorCode::Persistence, e.to_string())
    }
}

/// String key-value store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set(&self, key: &str, value: String) -> Result<(), StorageError>;

    /// Remove `key`, returning whether it existed.
    fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// All keys in ascending order.
    fn keys(&self) -> Result<Vec<String>, StorageError>;
}

/// Process-local store backed by a sorted map.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for InMemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.entries.write().remove(key).is_some())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}

/// Store that keeps one file per key inside a directory.
///
/// File names are the hex encoding of the key, so any key is safe on any
/// filesystem. Keys longer than [`FileStore::MAX_KEY_BYTES`] are rejected,
/// since their file name would not fit the usual 255-byte limit. Writes go
/// to a temporary file first and are renamed into place.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    write_lock: RwLock<()>,
}

const FILE_EXTENSION: &str = "kv";
const TMP_EXTENSION: &str = "tmp";

impl FileStore {
    /// Longest key, in UTF-8 bytes, whose hex file name fits in 255 bytes.
    /// Sized for the temporary name, which has the longer extension.
    pub const MAX_KEY_BYTES: usize = (255 - TMP_EXTENSION.len() - 1) / 2;

    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_lock: RwLock::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey("key must not be empty".to_string()));
        }
        if key.len() > Self::MAX_KEY_BYTES {
            return Err(StorageError::InvalidKey(format!(
                "key is {} bytes, the limit is {}",
                key.len(),
                Self::MAX_KEY_BYTES
            )));
        }
        Ok(self
            .root
            .join(format!("{}.{}", hex::encode(key.as_bytes()), FILE_EXTENSION)))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_for(key)?;
        let _guard = self.write_lock.read();
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension(TMP_EXTENSION);
        let _guard = self.write_lock.write();
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(value.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        let _guard = self.write_lock.write();
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let _guard = self.write_lock.read();
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            // Skip files this store did not write.
            if let Ok(bytes) = hex::decode(stem) {
                if let Ok(key) = String::from_utf8(bytes) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn KeyValueStore) {
        assert_eq!(store.get("guidelines:a").unwrap(), None);

        store.set("guidelines:a", "one".to_string()).unwrap();
        store.set("metric:latency", "two".to_string()).unwrap();
        assert_eq!(store.get("guidelines:a").unwrap().as_deref(), Some("one"));

        store.set("guidelines:a", "three".to_string()).unwrap();
        assert_eq!(store.get("guidelines:a").unwrap().as_deref(), Some("three"));

        assert_eq!(
            store.keys().unwrap(),
            vec!["guidelines:a".to_string(), "metric:latency".to_string()]
        );

        assert!(store.delete("guidelines:a").unwrap());
        assert!(!store.delete("guidelines:a").unwrap());
        assert_eq!(store.keys().unwrap(), vec!["metric:latency".to_string()]);
    }

    #[test]
    fn test_in_memory_store() {
        exercise(&InMemoryStore::new());
    }

    #[test]
    fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.set("k", "v".to_string()).unwrap();
        }
        let reopened = FileStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn test_file_store_rejects_empty_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.set("", "v".to_string()),
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_file_store_key_length_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let longest = "k".repeat(FileStore::MAX_KEY_BYTES);
        store.set(&longest, "v".to_string()).unwrap();
        assert_eq!(store.get(&longest).unwrap().as_deref(), Some("v"));
        assert_eq!(store.keys().unwrap(), vec![longest.clone()]);

        let too_long = format!("guidelines:{}", "x".repeat(150));
        let err = store.set(&too_long, "v".to_string()).unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(ref m) if m.contains("limit")));
        assert!(matches!(store.get(&too_long), Err(StorageError::InvalidKey(_))));
        assert_eq!(store.keys().unwrap().len(), 1);
    }

    #[test]
    fn test_storage_error_maps_to_persistence() {
        let err: EngineError = StorageError::InvalidKey("x".to_string()).into();
        assert_eq!(err.code, ErrorCode::Persistence);
    }
}
