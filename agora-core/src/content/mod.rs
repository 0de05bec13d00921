//! Content addressing.
//!
//! Every value agora stores is addressed by a [`HashAddr`]: a short `prefix`
//! naming the kind of thing addressed, and a `hash` derived from the value's
//! canonical CBOR encoding (see [`serializer`](crate::serializer)). The hash
//! is the SHA-256 hex digest of the encoding, preceded by a structural
//! descriptor such as `len_3_` for a three element sequence.
//!
//! A [`ValueAddr`] addresses an immutable value in a portal's value store.
//! Addresses are only handed out after the value was written
//! ([`Portal::put`]), so holding one implies the value exists somewhere.
//! Reading an address that is missing locally pulls the bytes from any other
//! live portal and republishes them locally.
//!
//! ```
//! use agora::portal::Portal;
//!
//! # fn main() -> agora::error::Result<()> {
//! let portal = Portal::in_memory()?;
//! let addr = portal.put(&vec![1u32, 2, 3])?;
//! assert_eq!(addr.prefix(), "array");
//! assert_eq!(portal.get_value::<Vec<u32>>(&addr)?, vec![1, 2, 3]);
//! # Ok(())
//! # }
//! ```
use std::{fmt, sync::Arc};

use bytes::Bytes;
use ciborium::value::Value;
use rand::Rng;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, error, instrument};

use crate::{
    error::{Error, Result},
    portal::{self, Portal},
    serializer,
    storage::{KvStore, SetOutcome, StoreKey},
};

/// An immutable `(prefix, hash)` pair.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Debug)]
pub struct HashAddr {
    prefix: String,
    hash: String,
}

impl HashAddr {
    pub(crate) fn new(prefix: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            hash: hash.into(),
        }
    }

    /// Computes the address of `value` under `prefix`, returning the canonical
    /// encoding alongside it.
    pub fn of_value(prefix: &str, value: &Value) -> Result<(Self, Vec<u8>)> {
        let bytes = serializer::value_to_bytes(value)?;
        let hash = format!(
            "{}{}",
            serializer::descriptor(value),
            serializer::digest(&bytes)
        );
        Ok((Self::new(prefix, hash), bytes))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// The store key the address maps onto.
    pub fn key(&self) -> Result<StoreKey> {
        StoreKey::new([escape_prefix(&self.prefix), self.hash.clone()])
    }

    pub(crate) fn from_key(key: &StoreKey) -> Option<Self> {
        match key.segments() {
            [prefix, hash, ..] => Some(Self::new(unescape_prefix(prefix)?, hash.as_str())),
            _ => None,
        }
    }
}

/// Maps a prefix onto a key segment. ASCII alphanumerics and `_` are kept,
/// every other character becomes `-<hex code point>-`.
fn escape_prefix(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            escaped.push(c);
        } else {
            escaped.push_str(&format!("-{:x}-", u32::from(c)));
        }
    }
    escaped
}

fn unescape_prefix(segment: &str) -> Option<String> {
    let mut prefix = String::with_capacity(segment.len());
    let mut rest = segment;
    while let Some(start) = rest.find('-') {
        prefix.push_str(&rest[..start]);
        let tail = &rest[start + 1..];
        let end = tail.find('-')?;
        let code = u32::from_str_radix(&tail[..end], 16).ok()?;
        prefix.push(char::from_u32(code)?);
        rest = &tail[end + 1..];
    }
    prefix.push_str(rest);
    Some(prefix)
}

impl fmt::Display for HashAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.prefix, self.hash)
    }
}

/// The address of an immutable value.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Debug)]
#[serde(transparent)]
pub struct ValueAddr(HashAddr);

impl ValueAddr {
    pub(crate) fn from_hash_addr(addr: HashAddr) -> Self {
        Self(addr)
    }

    pub fn prefix(&self) -> &str {
        self.0.prefix()
    }

    pub fn hash(&self) -> &str {
        self.0.hash()
    }

    pub fn as_hash_addr(&self) -> &HashAddr {
        &self.0
    }

    /// Reads the value through `portal`.
    pub fn load<T: DeserializeOwned>(&self, portal: &Portal) -> Result<T> {
        portal.get_value(self)
    }
}

impl fmt::Display for ValueAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "value:{}", self.0)
    }
}

/// A first-writer-wins map with probabilistic consistency auditing.
///
/// A write to a key that already holds a value is a no-op, except that with
/// probability `p_check` the new bytes are compared with the stored ones. A
/// mismatch is a [`Error::ConsistencyViolation`].
#[derive(Debug, Clone)]
pub(crate) struct VerifiedStore {
    store: Arc<dyn KvStore>,
    p_check: f64,
}

impl VerifiedStore {
    pub(crate) fn new(store: Arc<dyn KvStore>, p_check: f64) -> Self {
        Self { store, p_check }
    }

    pub(crate) fn inner(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub(crate) fn should_check(&self) -> bool {
        self.p_check > 0.0 && rand::thread_rng().gen_bool(self.p_check)
    }

    pub(crate) fn put(&self, key: &StoreKey, bytes: &[u8]) -> Result<SetOutcome> {
        let outcome = self.store.set(key, bytes)?;
        if outcome == SetOutcome::Kept && self.should_check() {
            self.verify(key, bytes)?;
        }
        Ok(outcome)
    }

    /// Compares `bytes` with the value stored under `key`.
    pub(crate) fn verify(&self, key: &StoreKey, bytes: &[u8]) -> Result<()> {
        match self.store.get(key)? {
            Some(stored) if stored.as_ref() != bytes => {
                error!(%key, "stored value differs from a fresh write");
                Err(Error::ConsistencyViolation {
                    key: key.to_string(),
                    detail: format!(
                        "stored {} bytes differ from {} freshly written bytes",
                        stored.len(),
                        bytes.len()
                    ),
                })
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn get(&self, key: &StoreKey) -> Result<Option<Bytes>> {
        self.store.get(key)
    }

    pub(crate) fn contains(&self, key: &StoreKey) -> Result<bool> {
        self.store.contains(key)
    }
}

impl Portal {
    /// Stores a value and returns its address.
    ///
    /// The address prefix is the CBOR kind of the value (`integer`, `text`,
    /// `map`, ...).
    pub fn put<T: Serialize + ?Sized>(&self, value: &T) -> Result<ValueAddr> {
        let value = serializer::to_value(value)?;
        self.put_value(serializer::kind(&value), &value)
    }

    /// Stores a lifted value under an explicit prefix.
    #[instrument(skip(self, value), level = "trace")]
    pub fn put_value(&self, prefix: &str, value: &Value) -> Result<ValueAddr> {
        let (addr, bytes) = HashAddr::of_value(prefix, value)?;
        let addr = ValueAddr(addr);
        if self.inner.known_values.contains(&addr) && !self.inner.values.should_check() {
            return Ok(addr);
        }
        self.inner.values.put(&addr.0.key()?, &bytes)?;
        self.inner.known_values.insert(addr.clone());
        Ok(addr)
    }

    /// Reads and decodes the value behind `addr`.
    pub fn get_value<T: DeserializeOwned>(&self, addr: &ValueAddr) -> Result<T> {
        serializer::from_bytes(&self.get_value_bytes(addr)?)
    }

    /// Whether the value behind `addr` is stored in this portal.
    pub fn contains_value(&self, addr: &ValueAddr) -> Result<bool> {
        if self.inner.known_values.contains(addr) {
            return Ok(true);
        }
        self.inner.values.contains(&addr.0.key()?)
    }

    /// Raw bytes behind `addr`, copied from another live portal when this one
    /// does not hold them.
    #[instrument(skip(self), fields(addr = %addr), level = "trace")]
    pub fn get_value_bytes(&self, addr: &ValueAddr) -> Result<Bytes> {
        let key = addr.0.key()?;
        if let Some(bytes) = self.inner.values.get(&key)? {
            self.inner.known_values.insert(addr.clone());
            return Ok(bytes);
        }

        for other in portal::stack::live_portals() {
            if other.ptr_eq(self) {
                continue;
            }
            if let Some(bytes) = other.inner.values.get(&key)? {
                debug!(from = %other.base_dir().display(), "copying value from another portal");
                self.inner.values.put(&key, &bytes)?;
                self.inner.known_values.insert(addr.clone());
                return Ok(bytes);
            }
        }

        Err(Error::MissingValue {
            address: addr.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{config::Config, storage::WriteMode};

    #[test]
    fn put_then_get() {
        let portal = Portal::in_memory().unwrap();
        let addr = portal.put("hello").unwrap();
        assert_eq!(addr.prefix(), "text");
        assert!(addr.hash().starts_with("len_5_"));
        assert_eq!(portal.get_value::<String>(&addr).unwrap(), "hello");
        assert_eq!(portal.put("hello").unwrap(), addr);
        portal.clear().unwrap();
    }

    #[test]
    fn any_prefix_maps_onto_a_valid_key() {
        for prefix in ["square", "my func", "größe", "a-b.c", "_x"] {
            let addr = HashAddr::new(prefix, "len_0_abc");
            let key = addr.key().unwrap();
            assert_eq!(HashAddr::from_key(&key), Some(addr));
        }
        let key = HashAddr::new("my func", "h").key().unwrap();
        assert_eq!(key.segments()[0], "my-20-func");
        assert_eq!(HashAddr::from_key(&StoreKey::new(["bad-zz-", "h"]).unwrap()), None);
    }

    #[test]
    fn equal_maps_share_an_address() {
        let portal = Portal::in_memory().unwrap();
        let a: BTreeMap<&str, u32> = [("x", 1), ("y", 2)].into_iter().collect();
        let b = std::collections::HashMap::from([("y", 2u32), ("x", 1)]);
        assert_eq!(portal.put(&a).unwrap(), portal.put(&b).unwrap());
        portal.clear().unwrap();
    }

    #[test]
    fn value_is_copied_between_portals() {
        let a = Portal::in_memory().unwrap();
        let b = Portal::in_memory().unwrap();
        let addr = a.put(&42u64).unwrap();

        assert!(!b.contains_value(&addr).unwrap());
        assert_eq!(addr.load::<u64>(&b).unwrap(), 42);
        assert!(b.contains_value(&addr).unwrap());

        a.clear().unwrap();
        assert_eq!(addr.load::<u64>(&b).unwrap(), 42);
        b.clear().unwrap();
    }

    #[test]
    fn missing_value_is_reported() {
        let portal = Portal::in_memory().unwrap();
        let addr = ValueAddr(HashAddr::new("integer", "deadbeef"));
        assert!(matches!(
            portal.get_value::<u64>(&addr),
            Err(Error::MissingValue { .. })
        ));
        portal.clear().unwrap();
    }

    #[test]
    fn audited_duplicate_write_detects_tampering() {
        let store: Arc<dyn KvStore> = Arc::new(crate::storage::in_memory::InMemoryStore::new(
            WriteMode::Immutable,
        ));
        let verified = VerifiedStore::new(store, 1.0);
        let key = StoreKey::new(["k"]).unwrap();
        verified.put(&key, b"original").unwrap();
        assert_eq!(verified.put(&key, b"original").unwrap(), SetOutcome::Kept);
        assert!(matches!(
            verified.put(&key, b"tampered"),
            Err(Error::ConsistencyViolation { .. })
        ));
    }

    #[test]
    fn unaudited_duplicate_write_is_silent() {
        let store: Arc<dyn KvStore> = Arc::new(crate::storage::in_memory::InMemoryStore::new(
            WriteMode::Immutable,
        ));
        let verified = VerifiedStore::new(store, 0.0);
        let key = StoreKey::new(["k"]).unwrap();
        verified.put(&key, b"original").unwrap();
        assert_eq!(verified.put(&key, b"other").unwrap(), SetOutcome::Kept);
        assert_eq!(verified.get(&key).unwrap().as_deref(), Some(&b"original"[..]));
    }

    #[test]
    fn file_portals_on_one_directory_see_each_others_values() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = Portal::open(Config::at(dir.path())).unwrap();
        let b = Portal::open(Config::at(dir.path())).unwrap();
        let addr = a.put(&vec!["x".to_string()]).unwrap();
        assert!(b.contains_value(&addr).unwrap());
        a.clear().unwrap();
        b.clear().unwrap();
    }
}
