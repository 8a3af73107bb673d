//! Key-value backends for the plan store.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ck_core::{CoreError, CoreResult, KeyValueStore, KvEdit, KvLease, KvValue};
use ck_utils::{write_atomic, FileLock};
use tracing::{debug, warn};

type Document = BTreeMap<String, KvValue>;

fn apply_edits(document: &mut Document, edits: &[KvEdit]) {
    for edit in edits {
        match edit {
            KvEdit::Put(key, value) => {
                document.insert(key.clone(), value.clone());
            }
            KvEdit::Remove(key) => {
                document.remove(key);
            }
        }
    }
}

/// In-memory backend, used by tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<Document>,
}

impl MemoryKv {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `entries`.
    pub fn with_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, KvValue)>,
        K: Into<String>,
    {
        let document = entries
            .into_iter()
            .map(|(key, value)| (key.into(), value))
            .collect();
        Self {
            entries: Mutex::new(document),
        }
    }

    /// Copy of every stored key and value.
    pub fn snapshot(&self) -> CoreResult<BTreeMap<String, KvValue>> {
        Ok(self.lock()?.clone())
    }

    fn lock(&self) -> CoreResult<std::sync::MutexGuard<'_, Document>> {
        self.entries
            .lock()
            .map_err(|_| CoreError::Storage("memory store lock poisoned".into()))
    }
}

impl KeyValueStore for MemoryKv {
    fn get(&self, key: &str) -> CoreResult<Option<KvValue>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn apply(&self, edits: &[KvEdit]) -> CoreResult<()> {
        let mut document = self.lock()?;
        apply_edits(&mut document, edits);
        Ok(())
    }
}

/// File-backed backend holding one JSON object of keys.
///
/// Writes go to a uniquely named sibling temp file that is renamed over the
/// target, so a crash mid-write leaves the previous document intact. Leases
/// lock `<path>.lock`, which excludes other processes sharing the file.
#[derive(Debug)]
pub struct JsonFileKv {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileKv {
    /// Open (lazily) the document at `path`.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// Path of the backing document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> CoreResult<Document> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Document::new()),
            Err(err) => return Err(CoreError::Storage(err.to_string())),
        };
        if contents.trim().is_empty() {
            return Ok(Document::new());
        }
        match serde_json::from_str(&contents) {
            Ok(document) => Ok(document),
            Err(err) => {
                warn!(
                    "ignoring unreadable store document {}: {err}",
                    self.path.display()
                );
                Ok(Document::new())
            }
        }
    }

    fn write_document(&self, document: &Document) -> CoreResult<()> {
        let contents = serde_json::to_string_pretty(document)
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        write_atomic(&self.path, contents.as_bytes())
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        debug!("wrote store document {}", self.path.display());
        Ok(())
    }
}

impl KeyValueStore for JsonFileKv {
    fn get(&self, key: &str) -> CoreResult<Option<KvValue>> {
        Ok(self.read_document()?.remove(key))
    }

    fn apply(&self, edits: &[KvEdit]) -> CoreResult<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| CoreError::Storage("file store lock poisoned".into()))?;
        let mut document = self.read_document()?;
        apply_edits(&mut document, edits);
        self.write_document(&document)
    }

    fn lease(&self) -> CoreResult<KvLease> {
        let lock = FileLock::exclusive(&self.path)
            .map_err(|err| CoreError::Storage(format!("cannot lock store: {err}")))?;
        Ok(KvLease::holding(lock))
    }
}
