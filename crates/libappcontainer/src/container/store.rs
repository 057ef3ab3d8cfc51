//! File-backed store of container records, one JSON file per container
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};

use tracing::instrument;

use super::record::ContainerRecord;
use crate::utils;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to open state store at {path:?}")]
    OpenRoot {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read container record {path:?}")]
    ReadRecord {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse container record {path:?}")]
    ParseRecord {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to write container record {path:?}")]
    WriteRecord {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to remove container record {path:?}")]
    RemoveRecord {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid container uuid {0:?}")]
    InvalidKey(String),
}

type Result<T> = std::result::Result<T, StoreError>;

/// Durable record store. Records live in `<root>/<container uuid>.json`.
///
/// Every write goes to a hidden temporary file which is flushed and renamed
/// over the record, so a crash leaves either the old or the new record and
/// never touches other records. Callers that need a read-modify-write cycle
/// on one container take the per-container lock with [`StateStore::lock`].
#[derive(Debug)]
pub struct StateStore {
    root: PathBuf,
    held: Mutex<HashSet<String>>,
    released: Condvar,
    tmp_counter: AtomicU64,
}

/// Exclusive access to one container uuid, released on drop
#[derive(Debug)]
pub struct RecordLock<'a> {
    store: &'a StateStore,
    key: String,
}

impl Drop for RecordLock<'_> {
    fn drop(&mut self) {
        let mut held = self
            .store
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        held.remove(&self.key);
        self.store.released.notify_all();
        tracing::trace!(container_uuid = %self.key, "released record lock");
    }
}

impl StateStore {
    const RECORD_EXTENSION: &'static str = "json";

    /// Opens the store rooted at `root`, creating the directory if needed.
    pub fn open<P: Into<PathBuf>>(root: P) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|err| StoreError::OpenRoot {
            path: root.to_owned(),
            source: err,
        })?;
        let root = fs::canonicalize(&root).map_err(|err| StoreError::OpenRoot {
            path: root.to_owned(),
            source: err,
        })?;

        Ok(Self {
            root,
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
            tmp_counter: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the path of the record file for `container_uuid`.
    ///
    /// ```
    /// # use libappcontainer::container::StateStore;
    /// let tmp = tempfile::tempdir().unwrap();
    /// let store = StateStore::open(tmp.path()).unwrap();
    /// let path = store.record_path("c-1").unwrap();
    /// assert_eq!(path, store.root().join("c-1.json"));
    /// assert!(store.record_path("../etc/passwd").is_err());
    /// ```
    pub fn record_path(&self, container_uuid: &str) -> Result<PathBuf> {
        if container_uuid.is_empty()
            || container_uuid.starts_with('.')
            || container_uuid.contains('/')
            || container_uuid.contains('\0')
        {
            return Err(StoreError::InvalidKey(container_uuid.to_owned()));
        }
        Ok(self
            .root
            .join(format!("{container_uuid}.{}", Self::RECORD_EXTENSION)))
    }

    /// Blocks until no one else holds `container_uuid`, then holds it.
    pub fn lock(&self, container_uuid: &str) -> Result<RecordLock<'_>> {
        self.record_path(container_uuid)?;
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        while held.contains(container_uuid) {
            tracing::debug!(container_uuid, "waiting for record lock");
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.insert(container_uuid.to_owned());

        Ok(RecordLock {
            store: self,
            key: container_uuid.to_owned(),
        })
    }

    /// Loads a record, `None` when the container is unknown.
    pub fn load(&self, container_uuid: &str) -> Result<Option<ContainerRecord>> {
        let path = self.record_path(container_uuid)?;
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                tracing::error!(?path, %err, "failed to open container record");
                return Err(StoreError::ReadRecord { path, source: err });
            }
        };

        let record: ContainerRecord =
            serde_json::from_reader(BufReader::new(file)).map_err(|err| {
                tracing::error!(?path, %err, "failed to parse container record");
                StoreError::ParseRecord {
                    path: path.to_owned(),
                    source: err,
                }
            })?;
        if record.container_uuid != container_uuid {
            tracing::error!(
                ?path,
                found = %record.container_uuid,
                "record key does not match its file name"
            );
            return Err(StoreError::InvalidKey(record.container_uuid));
        }

        Ok(Some(record))
    }

    /// Atomically replaces the record and flushes it to disk.
    #[instrument(level = "trace", skip(self, record), fields(container_uuid = %record.container_uuid))]
    pub fn save(&self, record: &ContainerRecord) -> Result<()> {
        let path = self.record_path(&record.container_uuid)?;
        let tmp_path = self.root.join(format!(
            ".{}.{}.{}.tmp",
            record.container_uuid,
            std::process::id(),
            self.tmp_counter.fetch_add(1, Ordering::Relaxed)
        ));

        let write = || -> std::io::Result<()> {
            let file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, record)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
            fs::rename(&tmp_path, &path)?;
            utils::sync_dir(&self.root)
        };

        write().map_err(|err| {
            tracing::error!(?path, %err, "failed to write container record");
            let _ = fs::remove_file(&tmp_path);
            StoreError::WriteRecord {
                path: path.to_owned(),
                source: err,
            }
        })
    }

    /// Deletes the record. Returns false if there was nothing to delete.
    #[instrument(level = "trace", skip(self))]
    pub fn remove(&self, container_uuid: &str) -> Result<bool> {
        let path = self.record_path(container_uuid)?;
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => {
                tracing::error!(?path, %err, "failed to remove container record");
                return Err(StoreError::RemoveRecord { path, source: err });
            }
        }
        utils::sync_dir(&self.root).map_err(|err| StoreError::RemoveRecord {
            path: path.to_owned(),
            source: err,
        })?;

        Ok(true)
    }

    /// Loads every readable record, sorted by container uuid. Records that
    /// cannot be read or parsed are logged and left out; use [`StateStore::load`]
    /// to get the error for a single container.
    pub fn list(&self) -> Result<Vec<ContainerRecord>> {
        let entries = fs::read_dir(&self.root).map_err(|err| StoreError::OpenRoot {
            path: self.root.to_owned(),
            source: err,
        })?;

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| StoreError::OpenRoot {
                path: self.root.to_owned(),
                source: err,
            })?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(Self::RECORD_EXTENSION) {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            // skips temporary files and anything else that is not a record
            if self.record_path(key).is_err() {
                continue;
            }
            match self.load(key) {
                Ok(Some(record)) => records.push(record),
                // a concurrent destroy may remove the record between listing and loading
                Ok(None) => {}
                // one damaged record must not hide the others
                Err(err) => tracing::warn!(container_uuid = key, %err, "skipping unreadable record"),
            }
        }
        records.sort_by(|a, b| a.container_uuid.cmp(&b.container_uuid));

        Ok(records)
    }
}
