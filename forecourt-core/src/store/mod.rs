//! Embedded document store: one JSONL file per collection.
//!
//! Collections hold JSON objects behind a readers-writer lock and are
//! rewritten wholesale after every mutating operation, tmp file + rename,
//! so a crash leaves either the old or the new file on disk. Loading is
//! lazy and strict: a malformed persisted line fails the operation
//! instead of being skipped.

pub mod filter;

pub use filter::Filter;

use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error at {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("collection name {0:?} must be non-empty [A-Za-z0-9_-]")]
    InvalidCollectionName(String),

    #[error("malformed document in collection {collection:?} at line {line}")]
    MalformedDocument {
        collection: String,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("document in collection {collection:?} is not an object")]
    NotAnObject { collection: String },

    #[error("cannot encode document for collection {collection:?}")]
    Encode {
        collection: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot decode document from collection {collection:?}")]
    Decode {
        collection: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("lock poisoned for {0:?}")]
    LockPoisoned(String),
}

type Collection = Arc<RwLock<Vec<Value>>>;

/// Handle to a data directory full of JSONL collections.
#[derive(Debug)]
pub struct DocumentStore {
    root: PathBuf,
    collections: Mutex<HashMap<String, Collection>>,
}

impl DocumentStore {
    /// Opens (and creates, if needed) the data directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(DocumentStore {
            root,
            collections: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Appends documents to a collection. Every document must be an object.
    pub fn insert_many(&self, name: &str, docs: Vec<Value>) -> Result<usize, StoreError> {
        if docs.iter().any(|d| !d.is_object()) {
            return Err(StoreError::NotAnObject {
                collection: name.to_string(),
            });
        }
        let count = docs.len();
        self.with_collection_mut::<_, StoreError>(name, |existing| {
            existing.extend(docs);
            Ok(())
        })?;
        Ok(count)
    }

    pub fn insert_one(&self, name: &str, doc: Value) -> Result<(), StoreError> {
        self.insert_many(name, vec![doc]).map(|_| ())
    }

    /// All documents matching the filter, in insertion order.
    pub fn find(&self, name: &str, filter: &Filter) -> Result<Vec<Value>, StoreError> {
        let handle = self.handle(name)?;
        let docs = handle
            .read()
            .map_err(|_| StoreError::LockPoisoned(name.to_string()))?;
        Ok(docs.iter().filter(|d| filter.matches(d)).cloned().collect())
    }

    pub fn find_one(&self, name: &str, filter: &Filter) -> Result<Option<Value>, StoreError> {
        let handle = self.handle(name)?;
        let docs = handle
            .read()
            .map_err(|_| StoreError::LockPoisoned(name.to_string()))?;
        Ok(docs.iter().find(|d| filter.matches(d)).cloned())
    }

    /// Clones the whole collection. Pipeline sources and joins read this.
    pub fn read_all(&self, name: &str) -> Result<Vec<Value>, StoreError> {
        let handle = self.handle(name)?;
        let docs = handle
            .read()
            .map_err(|_| StoreError::LockPoisoned(name.to_string()))?;
        Ok(docs.clone())
    }

    pub fn count(&self, name: &str) -> Result<usize, StoreError> {
        let handle = self.handle(name)?;
        let docs = handle
            .read()
            .map_err(|_| StoreError::LockPoisoned(name.to_string()))?;
        Ok(docs.len())
    }

    /// Empties a collection, keeping it listed.
    pub fn delete_all(&self, name: &str) -> Result<usize, StoreError> {
        self.with_collection_mut::<_, StoreError>(name, |docs| {
            let removed = docs.len();
            docs.clear();
            Ok(removed)
        })
    }

    /// Runs a closure against the collection under its write lock and
    /// flushes on success. The closure sees a working copy: when it fails,
    /// neither memory nor disk have changed.
    ///
    /// This is the atomicity primitive: a find-or-create plus a pipeline
    /// update inside one closure cannot interleave with another writer.
    pub fn with_collection_mut<T, E>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Vec<Value>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let handle = self.handle(name).map_err(E::from)?;
        let mut docs = handle
            .write()
            .map_err(|_| E::from(StoreError::LockPoisoned(name.to_string())))?;

        let mut working = docs.clone();
        let out = f(&mut working)?;
        *docs = working;
        self.flush(name, &docs).map_err(E::from)?;
        Ok(out)
    }

    /// Replaces the collection contents (the `Out` stage).
    pub fn replace_collection(&self, name: &str, new_docs: Vec<Value>) -> Result<(), StoreError> {
        if new_docs.iter().any(|d| !d.is_object()) {
            return Err(StoreError::NotAnObject {
                collection: name.to_string(),
            });
        }
        self.with_collection_mut::<_, StoreError>(name, |docs| {
            *docs = new_docs;
            Ok(())
        })
    }

    /// Names of collections persisted under the data directory, sorted,
    /// filtered by prefix.
    pub fn list_collections(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let entries = fs::read_dir(&self.root).map_err(|source| StoreError::Io {
            path: self.root.clone(),
            source,
        })?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                path: self.root.clone(),
                source,
            })?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(name) = file_name.strip_suffix(".jsonl") {
                if name.starts_with(prefix) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Drops a collection from memory and disk. Returns whether it existed.
    pub fn drop_collection(&self, name: &str) -> Result<bool, StoreError> {
        Self::validate_name(name)?;
        let existed_in_memory = self
            .collections
            .lock()
            .map_err(|_| StoreError::LockPoisoned("collection registry".to_string()))?
            .remove(name)
            .is_some();

        let path = self.collection_path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(existed_in_memory),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    // ── Internals ──

    fn validate_name(name: &str) -> Result<(), StoreError> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if valid {
            Ok(())
        } else {
            Err(StoreError::InvalidCollectionName(name.to_string()))
        }
    }

    fn collection_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.jsonl"))
    }

    fn handle(&self, name: &str) -> Result<Collection, StoreError> {
        Self::validate_name(name)?;
        let mut registry = self
            .collections
            .lock()
            .map_err(|_| StoreError::LockPoisoned("collection registry".to_string()))?;
        if let Some(handle) = registry.get(name) {
            return Ok(Arc::clone(handle));
        }
        let docs = self.load(name)?;
        let handle = Arc::new(RwLock::new(docs));
        registry.insert(name.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    fn load(&self, name: &str) -> Result<Vec<Value>, StoreError> {
        let path = self.collection_path(name);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        let mut docs = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let doc: Value =
                serde_json::from_str(line).map_err(|source| StoreError::MalformedDocument {
                    collection: name.to_string(),
                    line: idx + 1,
                    source,
                })?;
            if !doc.is_object() {
                return Err(StoreError::NotAnObject {
                    collection: name.to_string(),
                });
            }
            docs.push(doc);
        }
        tracing::debug!(collection = name, docs = docs.len(), "loaded collection");
        Ok(docs)
    }

    fn flush(&self, name: &str, docs: &[Value]) -> Result<(), StoreError> {
        let mut buffer = String::new();
        for doc in docs {
            let line = serde_json::to_string(doc).map_err(|source| StoreError::Encode {
                collection: name.to_string(),
                source,
            })?;
            buffer.push_str(&line);
            buffer.push('\n');
        }

        let path = self.collection_path(name);
        let tmp = self.root.join(format!("{name}.jsonl.tmp"));
        fs::write(&tmp, buffer).map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| StoreError::Io { path, source })?;
        tracing::trace!(collection = name, docs = docs.len(), "flushed collection");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
