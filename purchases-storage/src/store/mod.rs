//! Keyed store abstraction.
//!
//! A flat, namespaced key-value substrate holding either raw bytes or a set of
//! strings per key. The device cache layers all of its partitions on top of
//! this trait, so any store that survives process restarts can back it.

pub mod lmdb;
pub mod memory;

pub use lmdb::LmdbKeyedStore;
pub use memory::InMemoryKeyedStore;

use purchases_core::{StoreError, StoreResult};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Persistent key-value store consumed by the device cache.
///
/// Implementations must be safe for concurrent use. Atomicity across several
/// calls is NOT required here; the device cache serializes its own
/// read-modify-write sequences.
pub trait KeyedStore: Send + Sync {
    /// Read a byte value. Keys holding a string set read as `None`.
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Write a byte value, replacing whatever the key held.
    fn set(&self, key: &str, value: &[u8]) -> StoreResult<()>;

    /// Remove a key of either kind. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> StoreResult<()>;

    /// Every key currently stored, of either kind.
    fn all_keys(&self) -> StoreResult<BTreeSet<String>>;

    /// Read a string set. Missing keys read as the empty set.
    fn get_string_set(&self, key: &str) -> StoreResult<BTreeSet<String>>;

    /// Write a string set, replacing whatever the key held.
    fn set_string_set(&self, key: &str, values: &BTreeSet<String>) -> StoreResult<()>;

    /// Read a UTF-8 string value.
    fn get_string(&self, key: &str) -> StoreResult<Option<String>> {
        match self.get(key)? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| StoreError::Serialization {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Write a UTF-8 string value.
    fn set_string(&self, key: &str, value: &str) -> StoreResult<()> {
        self.set(key, value.as_bytes())
    }
}

impl<S: KeyedStore + ?Sized> KeyedStore for Arc<S> {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        (**self).remove(key)
    }

    fn all_keys(&self) -> StoreResult<BTreeSet<String>> {
        (**self).all_keys()
    }

    fn get_string_set(&self, key: &str) -> StoreResult<BTreeSet<String>> {
        (**self).get_string_set(key)
    }

    fn set_string_set(&self, key: &str, values: &BTreeSet<String>) -> StoreResult<()> {
        (**self).set_string_set(key, values)
    }
}
