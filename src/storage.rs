//! String key-value persistence for conversations and personas.
//!
//! Values are JSON documents. Reads fail soft: a missing, unreadable or corrupt entry is logged
//! and treated as absent so a damaged file never prevents the chat from starting.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::sync::Mutex;

use serde::Serialize;
use serde::de::DeserializeOwned;
use utf8path::Path;

use crate::error::{Error, Result};
use crate::types::ConversationId;

/// Key of the ordered conversation metadata list.
pub const CHAT_LIST_KEY: &str = "chat_list";

/// Key of the persona list.
pub const PERSONAS_KEY: &str = "personas";

/// Key of the id of the conversation last shown.
pub const CURRENT_CHAT_KEY: &str = "current_chat_id";

/// Key under which the messages of `id` are stored.
pub fn messages_key(id: &ConversationId) -> String {
    format!("chat_messages_{id}")
}

/// A minimal string key-value store.
pub trait Storage: Send + Sync {
    /// Returns the value stored under `key`, if any.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Stores `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Removes `key`. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;
}

/// Reads and decodes the JSON value under `key`, treating any failure as absent.
pub fn load_json<T: DeserializeOwned>(storage: &dyn Storage, key: &str) -> Option<T> {
    let raw = match storage.get(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(err) => {
            tracing::warn!(key, error = %err, "failed to read stored value");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(key, error = %err, "ignoring corrupt stored value");
            None
        }
    }
}

/// Encodes `value` as JSON and stores it under `key`.
pub fn save_json<T: Serialize + ?Sized>(storage: &dyn Storage, key: &str, value: &T) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    storage.set(key, &raw)
}

fn check_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(Error::validation(
            format!("invalid storage key: {key:?}"),
            Some("key".to_string()),
        ))
    }
}

/// Stores each key as `<dir>/<key>.json`.
///
/// Writes go to a temporary file that is then renamed over the target, so a crash mid-write
/// leaves the previous value intact.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: Path<'static>,
}

impl FileStorage {
    /// Creates a store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: &str) -> Self {
        Self {
            dir: Path::from(dir).into_owned(),
        }
    }

    /// The directory holding the files.
    pub fn dir(&self) -> &Path<'static> {
        &self.dir
    }

    fn file_for(&self, key: &str) -> Result<Path<'static>> {
        check_key(key)?;
        Ok(self.dir.join(format!("{key}.json")).into_owned())
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.file_for(key)?;
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::io(format!("failed to read {}", path.as_str()), err)),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.file_for(key)?;
        fs::create_dir_all(&self.dir).map_err(|err| {
            Error::io(format!("failed to create {}", self.dir.as_str()), err)
        })?;
        let tmp = self.dir.join(format!(".{key}.json.tmp")).into_owned();
        fs::write(&tmp, value)
            .map_err(|err| Error::io(format!("failed to write {}", tmp.as_str()), err))?;
        fs::rename(&tmp, &path)
            .map_err(|err| Error::io(format!("failed to replace {}", path.as_str()), err))
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.file_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::io(format!("failed to remove {}", path.as_str()), err)),
        }
    }
}

/// In-process storage, for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        check_key(key)?;
        Ok(self.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        check_key(key)?;
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        check_key(key)?;
        self.lock().remove(key);
        Ok(())
    }
}
