//! File-backed store shared between processes
//!
//! Layout: one JSON file per collection inside the store directory. Writers
//! serialise through an exclusive `.lock` file (created with `create_new`)
//! and replace collection files by writing a temporary file and renaming it,
//! so readers never observe a partial write and two processes never
//! interleave read-modify-write cycles.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use backoff::{backoff::Backoff, ExponentialBackoff};
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::types::new_id;

use super::{Collection, CollectionData, Document, DocumentStore, Filter, Inserted};

const LOCK_FILE: &str = ".lock";

/// Store persisted as JSON files in a directory
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    lock_timeout: Duration,
}

/// Held while a process owns the store lock; releases it on drop
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release store lock");
        }
    }
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl AsRef<Path>, lock_timeout: Duration) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| Error::IoWrite {
            path: root.clone(),
            source: e,
        })?;
        debug!(path = %root.display(), "Opened file store");
        Ok(Self { root, lock_timeout })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_path(&self, collection: Collection) -> PathBuf {
        self.root.join(format!("{}.json", collection.as_str()))
    }

    fn acquire_lock(&self) -> Result<LockGuard> {
        let path = self.root.join(LOCK_FILE);
        let started = Instant::now();
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(2),
            max_interval: Duration::from_millis(100),
            max_elapsed_time: Some(self.lock_timeout),
            ..Default::default()
        };

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    // Owner pid aids manual cleanup of stale locks
                    let _ = writeln!(file, "{}", std::process::id());
                    trace!(path = %path.display(), "Store lock acquired");
                    return Ok(LockGuard { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => match backoff.next_backoff() {
                    Some(delay) => std::thread::sleep(delay),
                    None => {
                        return Err(Error::StoreLocked {
                            path: self.root.clone(),
                            waited_ms: started.elapsed().as_millis() as u64,
                        })
                    }
                },
                Err(e) => {
                    return Err(Error::IoWrite { path, source: e });
                }
            }
        }
    }

    fn load(&self, collection: Collection) -> Result<CollectionData> {
        let path = self.collection_path(collection);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(CollectionData::default()),
            Err(e) => return Err(Error::IoRead { path, source: e }),
        };
        serde_json::from_str(&content).map_err(|e| Error::StoreCorrupt {
            path,
            message: e.to_string(),
        })
    }

    fn save(&self, collection: Collection, data: &CollectionData) -> Result<()> {
        let path = self.collection_path(collection);
        let tmp = self.root.join(format!(".{}.{}.tmp", collection.as_str(), new_id()));
        let encoded = serde_json::to_vec_pretty(data)?;

        let write = || -> std::io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        };
        write().map_err(|e| {
            let _ = fs::remove_file(&tmp);
            Error::IoWrite {
                path: path.clone(),
                source: e,
            }
        })
    }

    /// Run a read-modify-write cycle on one collection under the lock
    fn mutate<T>(&self, collection: Collection, op: impl FnOnce(&mut CollectionData) -> (T, bool)) -> Result<T> {
        let _guard = self.acquire_lock()?;
        let mut data = self.load(collection)?;
        let (out, changed) = op(&mut data);
        if changed {
            self.save(collection, &data)?;
        }
        Ok(out)
    }
}

impl DocumentStore for FileStore {
    fn insert(&self, collection: Collection, body: Value) -> Result<String> {
        self.mutate(collection, |data| (data.insert_new(body).id, true))
    }

    fn insert_unique(&self, collection: Collection, body: Value, unique: &Filter) -> Result<Inserted> {
        self.mutate(collection, |data| {
            let outcome = data.insert_unique(body, unique);
            let changed = outcome.is_new();
            (outcome, changed)
        })
    }

    fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>> {
        Ok(self.load(collection)?.get(id))
    }

    fn find_one(&self, collection: Collection, filter: &Filter) -> Result<Option<Document>> {
        Ok(self.load(collection)?.find_one(filter))
    }

    fn find(&self, collection: Collection, filter: &Filter) -> Result<Vec<Document>> {
        Ok(self.load(collection)?.find(filter))
    }

    fn compare_and_swap(&self, collection: Collection, id: &str, expected: &Filter, body: Value) -> Result<bool> {
        self.mutate(collection, |data| {
            let swapped = data.compare_and_swap(id, expected, body);
            (swapped, swapped)
        })
    }

    fn put(&self, collection: Collection, id: &str, body: Value) -> Result<()> {
        self.mutate(collection, |data| {
            data.put(id, body);
            ((), true)
        })
    }

    fn remove(&self, collection: Collection, id: &str) -> Result<bool> {
        self.mutate(collection, |data| {
            let removed = data.remove(id);
            (removed, removed)
        })
    }
}
