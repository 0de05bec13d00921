//! Persistent associative stores.
//!
//! A [`KvStore`] maps hierarchical [`StoreKey`]s to opaque byte blobs. Stores
//! come in two [`WriteMode`]s:
//!
//! - [`WriteMode::Immutable`]: the first write to a key wins, and every later
//!   write to the same key is a no-op reported as [`SetOutcome::Kept`]. Values
//!   can still be deleted.
//! - [`WriteMode::Mutable`]: writes replace the stored value.
//!
//! Two backends are provided:
//! - [`file::FileStore`]: a directory of files. Several processes may open the
//!   same directory concurrently; per-key writes are atomic.
//! - [`in_memory::InMemoryStore`]: process-local, backed by a
//!   [`DashMap`](dashmap::DashMap).
use std::{fmt, sync::Arc};

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    config::{Backend, Config},
    error::{Error, Result},
    serializer,
};

pub mod file;
pub mod in_memory;

/// A hierarchical store key.
///
/// Every segment is a non-empty run of ASCII letters, digits, `_`, `-` and
/// `.`, and does not start with `.`. This keeps keys representable as file
/// paths on every platform.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Default)]
pub struct StoreKey(Vec<String>);

impl StoreKey {
    /// The empty key. Used as a prefix, it selects every key in a store.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn new<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments = segments
            .into_iter()
            .map(Into::into)
            .map(|s| validate_segment(&s).map(|_| s))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self(segments))
    }

    /// Returns a new key with `segment` appended.
    pub fn join(&self, segment: impl Into<String>) -> Result<Self> {
        let segment = segment.into();
        validate_segment(&segment)?;
        let mut segments = self.0.clone();
        segments.push(segment);
        Ok(Self(segments))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn starts_with(&self, prefix: &StoreKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

fn validate_segment(segment: &str) -> Result<()> {
    let valid = !segment.is_empty()
        && !segment.starts_with('.')
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidKey {
            segment: segment.to_string(),
        })
    }
}

/// Whether a store accepts overwrites.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WriteMode {
    Immutable,
    Mutable,
}

/// The result of a [`KvStore::set`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SetOutcome {
    /// The value was stored.
    Written,
    /// The key already held a value, which was kept.
    Kept,
}

/// An associative store of byte blobs.
pub trait KvStore: Send + Sync + fmt::Debug {
    fn mode(&self) -> WriteMode;

    fn get(&self, key: &StoreKey) -> Result<Option<Bytes>>;

    fn set(&self, key: &StoreKey, value: &[u8]) -> Result<SetOutcome>;

    fn contains(&self, key: &StoreKey) -> Result<bool>;

    /// Removes a key, returning whether it was present.
    fn delete(&self, key: &StoreKey) -> Result<bool>;

    /// Every key under `prefix`, in sorted order.
    fn keys(&self, prefix: &StoreKey) -> Result<Vec<StoreKey>>;

    /// Removes every key.
    fn clear(&self) -> Result<()>;
}

impl<'a> dyn KvStore + 'a {
    /// Reads and decodes the value under `key`.
    pub fn load<T: DeserializeOwned>(&self, key: &StoreKey) -> Result<Option<T>> {
        self.get(key)?
            .map(|bytes| serializer::from_bytes(&bytes))
            .transpose()
    }

    /// Encodes and writes a value under `key`.
    pub fn save<T: Serialize + ?Sized>(&self, key: &StoreKey, value: &T) -> Result<SetOutcome> {
        self.set(key, &serializer::to_bytes(value)?)
    }

    pub fn count(&self, prefix: &StoreKey) -> Result<usize> {
        Ok(self.keys(prefix)?.len())
    }
}

/// Opens the store named `name` under the configured backend.
pub fn open(config: &Config, name: &str, mode: WriteMode) -> Result<Arc<dyn KvStore>> {
    Ok(match config.backend {
        Backend::File => Arc::new(file::FileStore::open(config.base_dir.join(name), mode)?),
        Backend::InMemory => Arc::new(in_memory::InMemoryStore::new(mode)),
    })
}
