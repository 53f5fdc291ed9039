//! Local persistent key/value store.
//!
//! Every value is an opaque JSON blob addressed by key name. There is no schema
//! migration: a key whose shape changes incompatibly must be renamed.
//! Reads and writes are synchronous and are never a suspension point.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

use fs2::FileExt;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

pub const TOKEN_KEY: &str = "maa_token";
pub const TOKEN_KIND_KEY: &str = "maa_token_type";
pub const USER_KEY: &str = "maa_user";
pub const QUEUE_KEY: &str = "maa_apply_queue_v1";
/// Consumed by configuration only.
pub const API_BASE_KEY: &str = "maa_api_base_url";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Stored value is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to persist {key}: {source}")]
    Persist {
        key: String,
        #[source]
        source: io::Error,
    },
}

pub trait LocalStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;
    fn set(&self, key: &str, value: &Value) -> Result<(), StoreError>;
    /// Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Takes the named exclusive lock, waiting for any other holder.
    /// The lock is shared by every process using the same store.
    fn lock(&self, name: &str) -> Result<StoreLock, StoreError>;

    /// Takes the named lock if it is free. `Ok(None)` means it is held
    /// elsewhere.
    fn try_lock(&self, name: &str) -> Result<Option<StoreLock>, StoreError>;
}

/// Held lock. Released on drop.
pub struct StoreLock {
    _held: Box<dyn Send + Sync>,
}

impl StoreLock {
    pub fn new(held: impl Send + Sync + 'static) -> Self {
        Self { _held: Box::new(held) }
    }
}

impl std::fmt::Debug for StoreLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StoreLock")
    }
}

/// Advisory lock on a file. Closing the handle releases it.
struct LockFile(File);

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

/// Reads `key` and deserializes it into `T`.
pub fn load<T: DeserializeOwned>(store: &dyn LocalStore, key: &str) -> Result<Option<T>, StoreError> {
    match store.get(key)? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Serializes `value` and writes it under `key`.
pub fn save<T: Serialize>(store: &dyn LocalStore, key: &str, value: &T) -> Result<(), StoreError> {
    let value = serde_json::to_value(value)?;
    store.set(key, &value)
}

/// One `<key>.json` file per key inside a data directory.
///
/// Writes go to a temp file in the same directory which is fsynced and then
/// renamed over the target, so a crash never leaves a half-written value.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn open_lock_file(&self, name: &str) -> Result<File, StoreError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.dir.join(format!("{name}.lock")))?;
        Ok(file)
    }
}

impl LocalStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let raw = match fs::read_to_string(self.path_for(key)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    fn set(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer(&mut tmp, value)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.path_for(key))
            .map_err(|e| StoreError::Persist {
                key: key.to_string(),
                source: e.error,
            })?;
        debug!("Persisted store key {key}");
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn lock(&self, name: &str) -> Result<StoreLock, StoreError> {
        let file = self.open_lock_file(name)?;
        file.lock_exclusive()?;
        debug!("Acquired store lock {name}");
        Ok(StoreLock::new(LockFile(file)))
    }

    fn try_lock(&self, name: &str) -> Result<Option<StoreLock>, StoreError> {
        let file = self.open_lock_file(name)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(StoreLock::new(LockFile(file)))),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
pub(crate) mod memory {
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    /// In-memory store for tests.
    ///
    /// `fail_writes` fails every mutation, `fail_removes` fails removals only
    /// and `fail_key` fails mutations of a single key.
    #[derive(Default)]
    pub struct MemoryStore {
        values: Mutex<HashMap<String, Value>>,
        held: Arc<Mutex<HashSet<String>>>,
        pub fail_writes: AtomicBool,
        pub fail_removes: AtomicBool,
        pub fail_key: Mutex<Option<String>>,
    }

    struct Held {
        names: Arc<Mutex<HashSet<String>>>,
        name: String,
    }

    impl Drop for Held {
        fn drop(&mut self) {
            if let Ok(mut names) = self.names.lock() {
                names.remove(&self.name);
            }
        }
    }

    fn denied() -> StoreError {
        StoreError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "read-only store"))
    }

    impl MemoryStore {
        pub fn raw(&self, key: &str) -> Option<Value> {
            self.values.lock().unwrap().get(key).cloned()
        }

        fn check_writable(&self, key: &str) -> Result<(), StoreError> {
            let key_fails = self.fail_key.lock().unwrap().as_deref() == Some(key);
            if self.fail_writes.load(Ordering::SeqCst) || key_fails {
                return Err(denied());
            }
            Ok(())
        }
    }

    impl LocalStore for MemoryStore {
        fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
            Ok(self.values.lock().unwrap().get(key).cloned())
        }

        fn set(&self, key: &str, value: &Value) -> Result<(), StoreError> {
            self.check_writable(key)?;
            self.values
                .lock()
                .unwrap()
                .insert(key.to_string(), value.clone());
            Ok(())
        }

        fn remove(&self, key: &str) -> Result<(), StoreError> {
            self.check_writable(key)?;
            if self.fail_removes.load(Ordering::SeqCst) {
                return Err(denied());
            }
            self.values.lock().unwrap().remove(key);
            Ok(())
        }

        fn lock(&self, name: &str) -> Result<StoreLock, StoreError> {
            loop {
                if let Some(lock) = self.try_lock(name)? {
                    return Ok(lock);
                }
                std::thread::yield_now();
            }
        }

        fn try_lock(&self, name: &str) -> Result<Option<StoreLock>, StoreError> {
            if !self.held.lock().unwrap().insert(name.to_string()) {
                return Ok(None);
            }
            Ok(Some(StoreLock::new(Held {
                names: self.held.clone(),
                name: name.to_string(),
            })))
        }
    }
}
