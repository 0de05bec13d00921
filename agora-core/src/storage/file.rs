//! A [`KvStore`] backed by a directory of files.
//!
//! Each key maps onto `root/segment/.../last.cbor`. Writes go to a temporary
//! file in the destination directory which is then moved into place, so
//! readers never observe a partially written value. Immutable stores link the
//! temporary file without clobbering, which makes first-writer-wins hold
//! across processes sharing the directory.
//!
//! Transient I/O failures (for example a directory removed by a concurrent
//! `clear`) are retried with exponential backoff for a short, bounded period.
use std::{
    fs,
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use bytes::Bytes;
use tempfile::NamedTempFile;
use tracing::{instrument, trace};

use super::{KvStore, SetOutcome, StoreKey, WriteMode};
use crate::error::{Error, Result};

const EXTENSION: &str = "cbor";
const RETRY_INITIAL_INTERVAL: Duration = Duration::from_millis(10);
const RETRY_MAX_ELAPSED: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    mode: WriteMode,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>, mode: WriteMode) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| Error::storage(&root, e))?;
        Ok(Self { root, mode })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, key: &StoreKey) -> PathBuf {
        let mut path = self.root.clone();
        if let Some((last, dirs)) = key.segments().split_last() {
            path.extend(dirs);
            path.push(format!("{last}.{EXTENSION}"));
        }
        path
    }

    fn dir_of(&self, prefix: &StoreKey) -> PathBuf {
        let mut path = self.root.clone();
        path.extend(prefix.segments());
        path
    }

    fn write(&self, path: &Path, value: &[u8]) -> io::Result<SetOutcome> {
        if self.mode == WriteMode::Immutable && path.exists() {
            return Ok(SetOutcome::Kept);
        }
        let parent = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent)?;
        let mut temp = NamedTempFile::new_in(parent)?;
        temp.write_all(value)?;
        temp.as_file().sync_data()?;
        match self.mode {
            WriteMode::Immutable => match temp.persist_noclobber(path) {
                Ok(_) => Ok(SetOutcome::Written),
                Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(SetOutcome::Kept),
                Err(e) => Err(e.error),
            },
            WriteMode::Mutable => {
                temp.persist(path).map_err(|e| e.error)?;
                Ok(SetOutcome::Written)
            }
        }
    }

    fn collect_keys(&self, dir: &Path, prefix: &[String], out: &mut Vec<StoreKey>) -> io::Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            // In-flight temporary files.
            if name.starts_with('.') {
                continue;
            }
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                let mut nested = prefix.to_vec();
                nested.push(name.to_string());
                self.collect_keys(&entry.path(), &nested, out)?;
            } else if let Some(stem) = name.strip_suffix(&format!(".{EXTENSION}")) {
                let mut segments = prefix.to_vec();
                segments.push(stem.to_string());
                if let Ok(key) = StoreKey::new(segments) {
                    out.push(key);
                }
            }
        }
        Ok(())
    }
}

fn retry_policy() -> ExponentialBackoff {
    let mut backoff = ExponentialBackoffBuilder::new();
    backoff.with_initial_interval(RETRY_INITIAL_INTERVAL);
    backoff.with_max_elapsed_time(Some(RETRY_MAX_ELAPSED));
    backoff.build()
}

fn is_transient(e: &io::Error) -> bool {
    !matches!(
        e.kind(),
        ErrorKind::PermissionDenied | ErrorKind::InvalidInput | ErrorKind::InvalidData
    )
}

/// Runs `op`, retrying transient I/O failures.
fn with_retry<T>(path: &Path, mut op: impl FnMut() -> io::Result<T>) -> Result<T> {
    backoff::retry(retry_policy(), || {
        op().map_err(|e| {
            if is_transient(&e) {
                trace!(path = %path.display(), error = %e, "transient I/O failure, retrying");
                backoff::Error::transient(e)
            } else {
                backoff::Error::permanent(e)
            }
        })
    })
    .map_err(|e| match e {
        backoff::Error::Permanent(e) => Error::storage(path, e),
        backoff::Error::Transient { err, .. } => Error::storage(path, err),
    })
}

impl KvStore for FileStore {
    fn mode(&self) -> WriteMode {
        self.mode
    }

    #[instrument(skip(self), level = "trace")]
    fn get(&self, key: &StoreKey) -> Result<Option<Bytes>> {
        let path = self.path_of(key);
        with_retry(&path, || match fs::read(&path) {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        })
    }

    #[instrument(skip(self, value), level = "trace")]
    fn set(&self, key: &StoreKey, value: &[u8]) -> Result<SetOutcome> {
        let path = self.path_of(key);
        with_retry(&path, || self.write(&path, value))
    }

    fn contains(&self, key: &StoreKey) -> Result<bool> {
        Ok(self.path_of(key).is_file())
    }

    fn delete(&self, key: &StoreKey) -> Result<bool> {
        let path = self.path_of(key);
        with_retry(&path, || match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        })
    }

    fn keys(&self, prefix: &StoreKey) -> Result<Vec<StoreKey>> {
        let dir = self.dir_of(prefix);
        let mut keys = Vec::new();
        with_retry(&dir, || {
            keys.clear();
            self.collect_keys(&dir, prefix.segments(), &mut keys)
        })?;
        keys.sort();
        Ok(keys)
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(Error::storage(&self.root, e)),
        }
        fs::create_dir_all(&self.root).map_err(|e| Error::storage(&self.root, e))
    }
}
