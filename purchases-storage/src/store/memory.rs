//! In-memory keyed store for tests and ephemeral installs.

use super::KeyedStore;
use purchases_core::{StoreError, StoreResult};
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

#[derive(Debug, Clone)]
enum StoredValue {
    Bytes(Vec<u8>),
    StringSet(BTreeSet<String>),
}

/// Keyed store backed by a `HashMap`. Contents are lost when dropped.
#[derive(Debug, Default)]
pub struct InMemoryKeyedStore {
    entries: RwLock<HashMap<String, StoredValue>>,
}

impl InMemoryKeyedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyedStore for InMemoryKeyedStore {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(match entries.get(key) {
            Some(StoredValue::Bytes(bytes)) => Some(bytes.clone()),
            _ => None,
        })
    }

    fn set(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
        entries.insert(key.to_string(), StoredValue::Bytes(value.to_vec()));
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
        entries.remove(key);
        Ok(())
    }

    fn all_keys(&self) -> StoreResult<BTreeSet<String>> {
        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(entries.keys().cloned().collect())
    }

    fn get_string_set(&self, key: &str) -> StoreResult<BTreeSet<String>> {
        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(match entries.get(key) {
            Some(StoredValue::StringSet(set)) => set.clone(),
            _ => BTreeSet::new(),
        })
    }

    fn set_string_set(&self, key: &str, values: &BTreeSet<String>) -> StoreResult<()> {
        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
        entries.insert(key.to_string(), StoredValue::StringSet(values.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_of(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_bytes_roundtrip() {
        let store = InMemoryKeyedStore::new();
        store.set("a", b"hello").expect("set should succeed");
        assert_eq!(store.get("a").expect("get should succeed"), Some(b"hello".to_vec()));
        assert_eq!(store.get("missing").expect("get should succeed"), None);
    }

    #[test]
    fn test_string_helpers() {
        let store = InMemoryKeyedStore::new();
        store.set_string("k", "value").expect("set should succeed");
        assert_eq!(
            store.get_string("k").expect("get should succeed").as_deref(),
            Some("value")
        );
    }

    #[test]
    fn test_invalid_utf8_is_serialization_error() {
        let store = InMemoryKeyedStore::new();
        store.set("k", &[0xff, 0xfe]).expect("set should succeed");
        let err = store.get_string("k").expect_err("invalid utf8 must fail");
        assert!(matches!(err, StoreError::Serialization { .. }));
    }

    #[test]
    fn test_string_set_defaults_to_empty() {
        let store = InMemoryKeyedStore::new();
        assert!(store.get_string_set("tokens").expect("get should succeed").is_empty());
    }

    #[test]
    fn test_kinds_do_not_alias() {
        let store = InMemoryKeyedStore::new();
        store.set_string_set("k", &set_of(&["x"])).expect("set should succeed");
        assert_eq!(store.get("k").expect("get should succeed"), None);

        store.set("k", b"bytes").expect("set should succeed");
        assert!(store.get_string_set("k").expect("get should succeed").is_empty());
    }

    #[test]
    fn test_remove_and_all_keys() {
        let store = InMemoryKeyedStore::new();
        store.set("a", b"1").expect("set should succeed");
        store.set_string_set("b", &set_of(&["x", "y"])).expect("set should succeed");
        assert_eq!(store.all_keys().expect("keys"), set_of(&["a", "b"]));

        store.remove("b").expect("remove should succeed");
        store.remove("never-existed").expect("removing a missing key is fine");
        assert_eq!(store.all_keys().expect("keys"), set_of(&["a"]));
        assert_eq!(store.len(), 1);
    }
}
