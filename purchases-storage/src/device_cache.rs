//! Identity-scoped device cache.
//!
//! Composes a [`KeyedStore`] and in-process [`CacheCell`]s into the named
//! partitions the sync controller works with: identity mapping, entitlement
//! snapshots, catalog, attribution payloads and reported receipt
//! fingerprints (through [`ReceiptLedger`]).
//!
//! # Locking
//!
//! One `RwLock` per cache instance is the mutual-exclusion domain for every
//! store mutation, the ledger included. Mutations take the write side, reads
//! take the read side, so concurrent read-modify-write sequences never lose
//! updates and readers never observe half of a multi-key change.
//!
//! # Failure policy
//!
//! Cached values that cannot be read (store failure, corrupt JSON, outdated
//! schema version) are reported as absent and logged. Mutations surface
//! [`StoreError`]s to the caller.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use purchases_core::{
    elapsed_between, Catalog, Clock, ConfigError, EntitlementSnapshot, Identity,
    PurchasesResult, StoreError, StoreResult, SyncConfig, Timestamp, SNAPSHOT_SCHEMA_VERSION,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::{CacheCell, CacheKeys};
use crate::ledger::ReceiptLedger;
use crate::store::{KeyedStore, LmdbKeyedStore};

/// State guarded by the cache-wide lock.
#[derive(Debug, Default)]
pub(crate) struct CacheState {
    pub(crate) snapshot_last_refreshed: Option<Timestamp>,
}

pub(crate) type SharedState = Arc<RwLock<CacheState>>;

pub(crate) fn read_state(state: &SharedState) -> StoreResult<RwLockReadGuard<'_, CacheState>> {
    state.read().map_err(|_| StoreError::LockPoisoned)
}

pub(crate) fn write_state(state: &SharedState) -> StoreResult<RwLockWriteGuard<'_, CacheState>> {
    state.write().map_err(|_| StoreError::LockPoisoned)
}

/// Device cache for one installation.
///
/// Construct once per installation and share it by `Arc`; the staleness
/// timestamp for entitlement snapshots lives here, not in a global.
pub struct DeviceCache<S: KeyedStore> {
    pub(crate) store: Arc<S>,
    pub(crate) keys: CacheKeys,
    pub(crate) state: SharedState,
    clock: Arc<dyn Clock>,
    snapshot_ttl: Duration,
    schema_version: u32,
    catalog: CacheCell<Catalog>,
}

impl<S: KeyedStore> std::fmt::Debug for DeviceCache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCache")
            .field("keys", &self.keys)
            .field("snapshot_ttl", &self.snapshot_ttl)
            .field("schema_version", &self.schema_version)
            .finish_non_exhaustive()
    }
}

impl DeviceCache<LmdbKeyedStore> {
    /// Open the durable cache at `config.store_path`.
    ///
    /// # Errors
    ///
    /// Fails when the configuration is invalid, has no store path, or the
    /// LMDB environment cannot be opened.
    pub fn open(config: &SyncConfig, clock: Arc<dyn Clock>) -> PurchasesResult<Self> {
        let path = config
            .store_path
            .as_ref()
            .ok_or(ConfigError::MissingRequired {
                field: "store_path",
            })?;
        let store = LmdbKeyedStore::open(path, config.store_max_size_mb).map_err(StoreError::from)?;
        Ok(Self::new(Arc::new(store), config, clock)?)
    }
}

impl<S: KeyedStore> DeviceCache<S> {
    /// Build a cache over `store` for the installation described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration does not validate; a
    /// cache without an API key cannot derive any of its keys.
    pub fn new(store: Arc<S>, config: &SyncConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            store,
            keys: CacheKeys::new(&config.namespace, &config.api_key),
            state: Arc::new(RwLock::new(CacheState::default())),
            catalog: CacheCell::new(config.catalog_ttl(), Arc::clone(&clock)),
            clock,
            snapshot_ttl: config.snapshot_ttl(),
            schema_version: SNAPSHOT_SCHEMA_VERSION,
        })
    }

    /// Override the snapshot schema version this cache writes and accepts.
    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    pub fn keys(&self) -> &CacheKeys {
        &self.keys
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Receipt ledger sharing this cache's store and lock.
    pub fn ledger(&self) -> ReceiptLedger<S> {
        ReceiptLedger::new(
            Arc::clone(&self.store),
            self.keys.tokens_key(),
            Arc::clone(&self.state),
        )
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    pub fn legacy_identity_key(&self) -> String {
        self.keys.legacy_identity_key()
    }

    pub fn identity_key(&self) -> String {
        self.keys.identity_key()
    }

    /// Identity stored under the versioned key.
    pub fn get_identity(&self) -> StoreResult<Option<Identity>> {
        let _guard = read_state(&self.state)?;
        self.read_identity(&self.keys.identity_key())
    }

    /// Identity stored under the pre-versioning key.
    pub fn get_legacy_identity(&self) -> StoreResult<Option<Identity>> {
        let _guard = read_state(&self.state)?;
        self.read_identity(&self.keys.legacy_identity_key())
    }

    /// Versioned identity, falling back to the legacy one.
    pub fn resolve_identity(&self) -> StoreResult<Option<Identity>> {
        let _guard = read_state(&self.state)?;
        match self.read_identity(&self.keys.identity_key())? {
            Some(identity) => Ok(Some(identity)),
            None => self.read_identity(&self.keys.legacy_identity_key()),
        }
    }

    /// Persist `identity` under the versioned key only.
    pub fn set_identity(&self, identity: &Identity) -> StoreResult<()> {
        let _guard = write_state(&self.state)?;
        self.store
            .set_string(&self.keys.identity_key(), identity.as_str())
    }

    /// Copy a legacy identity into the versioned key when only the legacy
    /// key is populated. Returns the migrated identity, if any.
    pub fn migrate_legacy_identity(&self) -> StoreResult<Option<Identity>> {
        let _guard = write_state(&self.state)?;
        if self.read_identity(&self.keys.identity_key())?.is_some() {
            return Ok(None);
        }
        let Some(legacy) = self.read_identity(&self.keys.legacy_identity_key())? else {
            return Ok(None);
        };
        self.store
            .set_string(&self.keys.identity_key(), legacy.as_str())?;
        tracing::info!(app_user_id = %legacy, "Migrated legacy identity key");
        Ok(Some(legacy))
    }

    fn read_identity(&self, key: &str) -> StoreResult<Option<Identity>> {
        Ok(self.store.get_string(key)?.and_then(Identity::parse))
    }

    // ------------------------------------------------------------------
    // Entitlement snapshots
    // ------------------------------------------------------------------

    pub fn key_for(&self, identity: &Identity) -> String {
        self.keys.snapshot_key(identity)
    }

    /// Cached snapshot for `identity`.
    ///
    /// Corrupt records and records written at another schema version read
    /// as absent.
    pub fn get_snapshot(&self, identity: &Identity) -> Option<EntitlementSnapshot> {
        let key = self.key_for(identity);
        let bytes = match read_state(&self.state).and_then(|_guard| self.store.get(&key)) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Snapshot read failed; treating as miss");
                return None;
            }
        };

        let snapshot: EntitlementSnapshot = match serde_json::from_slice(&bytes) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "Discarding unreadable snapshot");
                return None;
            }
        };

        if snapshot.schema_version != self.schema_version {
            tracing::debug!(
                key = %key,
                found = snapshot.schema_version,
                expected = self.schema_version,
                "Discarding snapshot with outdated schema version"
            );
            return None;
        }
        Some(snapshot)
    }

    /// Persist `snapshot` for `identity`, stamped with the current schema
    /// version, and mark snapshots refreshed now.
    pub fn put_snapshot(&self, identity: &Identity, snapshot: &EntitlementSnapshot) -> StoreResult<()> {
        let key = self.key_for(identity);
        let mut stamped = snapshot.clone();
        stamped.schema_version = self.schema_version;
        let bytes = serde_json::to_vec(&stamped).map_err(|e| StoreError::Serialization {
            key: key.clone(),
            reason: e.to_string(),
        })?;

        let now = self.clock.now();
        let mut guard = write_state(&self.state)?;
        self.store.set(&key, &bytes)?;
        guard.snapshot_last_refreshed = Some(now);
        Ok(())
    }

    /// True if snapshots were never refreshed or the last refresh is at
    /// least one TTL old.
    pub fn is_snapshot_stale(&self) -> bool {
        let now = self.clock.now();
        match self.snapshot_last_refreshed() {
            Some(at) => elapsed_between(at, now) >= self.snapshot_ttl,
            None => true,
        }
    }

    pub fn snapshot_last_refreshed(&self) -> Option<Timestamp> {
        match read_state(&self.state) {
            Ok(guard) => guard.snapshot_last_refreshed,
            Err(e) => {
                tracing::warn!(error = %e, "Snapshot timestamp unreadable");
                None
            }
        }
    }

    /// Force the next staleness check to report stale.
    pub fn clear_snapshot_timestamp(&self) -> StoreResult<()> {
        write_state(&self.state)?.snapshot_last_refreshed = None;
        Ok(())
    }

    pub fn set_snapshot_timestamp(&self, at: Timestamp) -> StoreResult<()> {
        write_state(&self.state)?.snapshot_last_refreshed = Some(at);
        Ok(())
    }

    /// Identity-scoped reset for logout or user switch.
    ///
    /// Removes the snapshots of both the versioned and legacy identities,
    /// both identity keys, the snapshot timestamp and the catalog. Reported
    /// fingerprints are installation-scoped and survive.
    pub fn clear_for_identity(&self) -> StoreResult<()> {
        let mut guard = write_state(&self.state)?;
        let identity_key = self.keys.identity_key();
        let legacy_key = self.keys.legacy_identity_key();

        for key in [&identity_key, &legacy_key] {
            if let Some(raw) = self.store.get_string(key)? {
                self.store.remove(&self.keys.snapshot_key_for(&raw))?;
            }
        }
        self.store.remove(&identity_key)?;
        self.store.remove(&legacy_key)?;

        guard.snapshot_last_refreshed = None;
        self.catalog.clear();
        tracing::debug!("Cleared identity-scoped caches");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Catalog
    // ------------------------------------------------------------------

    pub fn cached_catalog(&self) -> Option<Catalog> {
        self.catalog.read()
    }

    pub fn cache_catalog(&self, catalog: Catalog) {
        self.catalog.cache(catalog);
    }

    /// Merge freshly fetched products into the cached catalog.
    pub fn merge_catalog(&self, fetched: Catalog) {
        self.catalog.update(|current| {
            let mut merged = current.unwrap_or_default();
            merged.merge(fetched);
            merged
        });
    }

    pub fn is_catalog_stale(&self) -> bool {
        self.catalog.is_stale()
    }

    pub fn clear_catalog(&self) {
        self.catalog.clear();
    }

    pub fn clear_catalog_timestamp(&self) {
        self.catalog.clear_timestamp();
    }

    pub fn set_catalog_timestamp(&self, at: Timestamp) {
        self.catalog.set_timestamp(at);
    }

    // ------------------------------------------------------------------
    // Attribution
    // ------------------------------------------------------------------

    /// Last attribution payload sent for `(network, user)`.
    pub fn get_attribution(&self, network: &str, user: &Identity) -> Option<String> {
        let key = self.keys.attribution_key(network, user);
        match read_state(&self.state).and_then(|_guard| self.store.get_string(&key)) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Attribution read failed");
                None
            }
        }
    }

    pub fn put_attribution(&self, network: &str, user: &Identity, payload: &str) -> StoreResult<()> {
        let _guard = write_state(&self.state)?;
        self.store
            .set_string(&self.keys.attribution_key(network, user), payload)
    }

    /// Drop every attribution payload cached for `user`.
    pub fn clear_attribution(&self, user: &Identity) -> StoreResult<()> {
        let _guard = write_state(&self.state)?;
        let prefix = self.keys.attribution_prefix(user);
        for key in self.matching_keys(&prefix)? {
            self.store.remove(&key)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Generic key utilities
    // ------------------------------------------------------------------

    /// Deserialize the JSON value at `key`; unreadable values read as absent.
    pub fn read_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = match read_state(&self.state).and_then(|_guard| self.store.get(key)) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Read failed; treating as miss");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "Discarding unreadable JSON");
                None
            }
        }
    }

    pub fn write_json<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| StoreError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        let _guard = write_state(&self.state)?;
        self.store.set(key, &bytes)
    }

    pub fn write_string(&self, key: &str, value: &str) -> StoreResult<()> {
        let _guard = write_state(&self.state)?;
        self.store.set_string(key, value)
    }

    pub fn remove(&self, key: &str) -> StoreResult<()> {
        let _guard = write_state(&self.state)?;
        self.store.remove(key)
    }

    /// Stored keys starting with `prefix`, in sorted order.
    pub fn keys_with_prefix(&self, prefix: &str) -> StoreResult<BTreeSet<String>> {
        let _guard = read_state(&self.state)?;
        self.matching_keys(prefix)
    }

    /// Namespace an ad hoc key under this installation.
    pub fn derive_key(&self, suffix: &str) -> String {
        self.keys.derive_key(suffix)
    }

    /// Caller must hold the cache lock.
    pub(crate) fn matching_keys(&self, prefix: &str) -> StoreResult<BTreeSet<String>> {
        Ok(self
            .store
            .all_keys()?
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use crate::store::InMemoryKeyedStore;
    use chrono::Utc;
    use proptest::prelude::*;
    use purchases_core::ManualClock;

    proptest! {
        /// Property: a snapshot written at version N never reads back at M != N.
        #[test]
        fn prop_version_mismatch_is_absent(written in 0u32..16, expected in 0u32..16) {
            let store = Arc::new(InMemoryKeyedStore::new());
            let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
            let config = SyncConfig::new("api");
            let alice = Identity::parse("alice").expect("valid");
            let snapshot = EntitlementSnapshot::new(alice.clone(), Utc::now());

            let writer = DeviceCache::new(Arc::clone(&store), &config, Arc::clone(&clock))
                .expect("valid config")
                .with_schema_version(written);
            writer.put_snapshot(&alice, &snapshot).expect("put");

            let reader = DeviceCache::new(store, &config, clock)
                .expect("valid config")
                .with_schema_version(expected);
            prop_assert_eq!(reader.get_snapshot(&alice).is_some(), written == expected);
        }
    }
}
