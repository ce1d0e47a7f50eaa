//! LMDB-backed keyed store.
//!
//! Uses the heed crate (Rust bindings for LMDB) to give the device cache a
//! durable, memory-mapped substrate that survives process restarts.
//!
//! # Layout
//!
//! Two named databases share one environment:
//! - `values`: key → raw bytes
//! - `string_sets`: key → JSON array of strings
//!
//! Writing a key of one kind deletes any value of the other kind under the
//! same key in the same write transaction.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. Reads use read transactions, every
//! mutation runs in its own write transaction.

use std::collections::BTreeSet;
use std::path::Path;

use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use purchases_core::{StoreError, StoreResult};

use super::KeyedStore;

const VALUES_DB: &str = "values";
const STRING_SETS_DB: &str = "string_sets";

/// Error type for LMDB store operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open a database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbStoreError> for StoreError {
    fn from(e: LmdbStoreError) -> Self {
        match e {
            LmdbStoreError::Io(io) => StoreError::from(io),
            other => StoreError::Backend {
                reason: other.to_string(),
            },
        }
    }
}

/// Durable keyed store on top of LMDB.
///
/// # Example
///
/// ```ignore
/// let store = LmdbKeyedStore::open("/data/purchases", 16)?;
/// store.set_string("com.revenuecat.purchases.appl_key.new", "user-1")?;
/// ```
pub struct LmdbKeyedStore {
    env: Env,
    values: Database<Str, Bytes>,
    string_sets: Database<Str, Bytes>,
}

impl LmdbKeyedStore {
    /// Open (or create) a store in `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - The databases cannot be created
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbStoreError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per directory by this
        // process; callers must not open the same path twice concurrently.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(2)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        let values: Database<Str, Bytes> = env
            .create_database(&mut wtxn, Some(VALUES_DB))
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;
        let string_sets: Database<Str, Bytes> = env
            .create_database(&mut wtxn, Some(STRING_SETS_DB))
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        Ok(Self {
            env,
            values,
            string_sets,
        })
    }

    fn collect_keys(&self, db: Database<Str, Bytes>) -> Result<Vec<String>, LmdbStoreError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        let iter = db
            .iter(&rtxn)
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        let mut keys = Vec::new();
        for result in iter {
            let (key, _) = result.map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;
            keys.push(key.to_string());
        }
        Ok(keys)
    }

    /// Write `value` to `target` and drop any entry for the key in `other`.
    fn replace(
        &self,
        target: Database<Str, Bytes>,
        other: Database<Str, Bytes>,
        key: &str,
        value: &[u8],
    ) -> Result<(), LmdbStoreError> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        other
            .delete(&mut wtxn, key)
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;
        target
            .put(&mut wtxn, key, value)
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))
    }
}

impl KeyedStore for LmdbKeyedStore {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        let value = self
            .values
            .get(&rtxn, key)
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    fn set(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        Ok(self.replace(self.values, self.string_sets, key, value)?)
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        self.values
            .delete(&mut wtxn, key)
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;
        self.string_sets
            .delete(&mut wtxn, key)
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;
        Ok(())
    }

    fn all_keys(&self) -> StoreResult<BTreeSet<String>> {
        let mut keys: BTreeSet<String> = self.collect_keys(self.values)?.into_iter().collect();
        keys.extend(self.collect_keys(self.string_sets)?);
        Ok(keys)
    }

    fn get_string_set(&self, key: &str) -> StoreResult<BTreeSet<String>> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        match self
            .string_sets
            .get(&rtxn, key)
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?
        {
            Some(bytes) => serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization {
                key: key.to_string(),
                reason: e.to_string(),
            }),
            None => Ok(BTreeSet::new()),
        }
    }

    fn set_string_set(&self, key: &str, values: &BTreeSet<String>) -> StoreResult<()> {
        let bytes = serde_json::to_vec(values).map_err(|e| StoreError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        Ok(self.replace(self.string_sets, self.values, key, &bytes)?)
    }
}
