//! Session-local string storage used to remember the assigned user id.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// A get/set string store scoped to one client session.
pub trait SessionStore {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: String);
}

impl<S: SessionStore + ?Sized> SessionStore for Box<S> {
    fn get(&self, key: &str) -> Option<String> {
        (**self).get(key)
    }

    fn set(&mut self, key: &str, value: String) {
        (**self).set(key, value)
    }
}

/// In-memory store; forgets everything when dropped.
#[derive(Debug, Clone, Default)]
pub struct MemorySessionStore {
    values: HashMap<String, String>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: String) {
        self.values.insert(key.to_string(), value);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionStoreError {
    #[error("failed to read session file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("session file {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// JSON-file backed store, so a restarted client keeps its identity.
///
/// Writes go straight to disk. A failed write is logged and the value is
/// still kept in memory for the rest of the session.
#[derive(Debug)]
pub struct FileSessionStore {
    path: PathBuf,
    values: HashMap<String, String>,
}

impl FileSessionStore {
    /// Open `path`, starting empty when the file does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SessionStoreError> {
        let path = path.as_ref().to_path_buf();
        let values = match fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => HashMap::new(),
            Ok(raw) => serde_json::from_str(&raw).map_err(|source| SessionStoreError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(source) => return Err(SessionStoreError::Read { path, source }),
        };
        Ok(Self { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(&self.values)?;
        fs::write(&self.path, json)
    }
}

impl SessionStore for FileSessionStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: String) {
        self.values.insert(key.to_string(), value);
        if let Err(e) = self.flush() {
            log::warn!("Failed to write session file {}: {e}", self.path.display());
        }
    }
}
