//! Subscriber attribute cache.
//!
//! Attributes for every user live in one JSON document at
//! `<ns>.<api_key>.subscriberAttributes`, keyed by app user id. Older
//! installs kept one document per user under
//! `<ns>.<api_key>.subscriberAttributes.<user>`; those are folded into the
//! combined document by [`DeviceCache::migrate_legacy_subscriber_attributes`].

use std::collections::BTreeMap;

use purchases_core::{Identity, StoreError, StoreResult, Timestamp};
use serde::{Deserialize, Serialize};

use crate::device_cache::{read_state, write_state, DeviceCache};
use crate::store::KeyedStore;

/// One attribute value as last set on this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberAttribute {
    /// `None` records a deletion that still has to be sent.
    pub value: Option<String>,
    pub set_at: Timestamp,
    pub is_synced: bool,
}

pub type AttributeMap = BTreeMap<String, SubscriberAttribute>;

type AttributesByUser = BTreeMap<String, AttributeMap>;

impl<S: KeyedStore> DeviceCache<S> {
    /// Record an attribute change for `user`. The change is unsynced until
    /// [`Self::mark_attributes_synced`] is called for its key.
    pub fn set_attribute(&self, user: &Identity, key: &str, value: Option<String>) -> StoreResult<()> {
        let now = self.clock().now();
        let _guard = write_state(&self.state)?;
        let mut all = self.load_attributes()?;
        all.entry(user.as_str().to_string()).or_default().insert(
            key.to_string(),
            SubscriberAttribute {
                value,
                set_at: now,
                is_synced: false,
            },
        );
        self.save_attributes(&all)
    }

    /// Every attribute cached for `user`.
    pub fn subscriber_attributes(&self, user: &Identity) -> AttributeMap {
        let loaded = read_state(&self.state).and_then(|_guard| self.load_attributes());
        match loaded {
            Ok(mut all) => all.remove(user.as_str()).unwrap_or_default(),
            Err(e) => {
                tracing::warn!(error = %e, "Subscriber attributes unreadable");
                AttributeMap::new()
            }
        }
    }

    /// Attributes for `user` not yet accepted by the backend.
    pub fn unsynced_attributes(&self, user: &Identity) -> AttributeMap {
        self.subscriber_attributes(user)
            .into_iter()
            .filter(|(_, attr)| !attr.is_synced)
            .collect()
    }

    /// Mark `keys` as synced for `user`. Unknown keys are ignored.
    pub fn mark_attributes_synced<K: AsRef<str>>(&self, user: &Identity, keys: &[K]) -> StoreResult<()> {
        let _guard = write_state(&self.state)?;
        let mut all = self.load_attributes()?;
        let Some(attributes) = all.get_mut(user.as_str()) else {
            return Ok(());
        };
        for key in keys {
            if let Some(attr) = attributes.get_mut(key.as_ref()) {
                attr.is_synced = true;
            }
        }
        self.save_attributes(&all)
    }

    /// Fold per-user legacy attribute documents into the combined one.
    ///
    /// Values already present in the combined document win. Legacy keys are
    /// removed once folded. Returns the number of users migrated.
    pub fn migrate_legacy_subscriber_attributes(&self) -> StoreResult<usize> {
        let _guard = write_state(&self.state)?;
        let prefix = self.keys.legacy_subscriber_attributes_prefix();
        let legacy_keys = self.matching_keys(&prefix)?;
        if legacy_keys.is_empty() {
            return Ok(0);
        }

        let mut all = self.load_attributes()?;
        let mut migrated = 0;
        for key in &legacy_keys {
            let user = &key[prefix.len()..];
            let legacy: AttributeMap = match self.store.get(key)? {
                Some(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(map) => map,
                    Err(e) => {
                        tracing::debug!(key = %key, error = %e, "Dropping unreadable legacy attributes");
                        AttributeMap::new()
                    }
                },
                None => AttributeMap::new(),
            };

            let current = all.entry(user.to_string()).or_default();
            for (name, attr) in legacy {
                current.entry(name).or_insert(attr);
            }
            migrated += 1;
        }

        self.save_attributes(&all)?;
        for key in &legacy_keys {
            self.store.remove(key)?;
        }
        tracing::info!(users = migrated, "Migrated legacy subscriber attributes");
        Ok(migrated)
    }

    /// Caller must hold the cache lock.
    ///
    /// A corrupt document reads as empty. A failed read is returned so that
    /// writers never save over attributes they could not see.
    fn load_attributes(&self) -> StoreResult<AttributesByUser> {
        let key = self.keys.subscriber_attributes_key();
        let Some(bytes) = self.store.get(&key)? else {
            return Ok(AttributesByUser::new());
        };
        Ok(serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            tracing::debug!(key = %key, error = %e, "Discarding unreadable subscriber attributes");
            AttributesByUser::new()
        }))
    }

    /// Caller must hold the cache write lock.
    fn save_attributes(&self, all: &AttributesByUser) -> StoreResult<()> {
        let key = self.keys.subscriber_attributes_key();
        let bytes = serde_json::to_vec(all).map_err(|e| StoreError::Serialization {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.store.set(&key, &bytes)
    }
}
