//! Receipt deduplication ledger.
//!
//! Persists fingerprints of purchase tokens the backend has accepted so the
//! same receipt is never posted twice. The set is installation-scoped and
//! survives identity switches.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use purchases_core::{PurchaseRecord, ReceiptFingerprint, StoreResult};

use crate::device_cache::{read_state, write_state, SharedState};
use crate::store::KeyedStore;

/// Ledger of reported receipt fingerprints.
///
/// Obtained from [`crate::DeviceCache::ledger`]; shares the cache's lock, so
/// every read-modify-write here is serialized with the cache's own
/// mutations.
pub struct ReceiptLedger<S: KeyedStore> {
    store: Arc<S>,
    key: String,
    state: SharedState,
}

impl<S: KeyedStore> ReceiptLedger<S> {
    pub(crate) fn new(store: Arc<S>, key: String, state: SharedState) -> Self {
        Self { store, key, state }
    }

    /// Every fingerprint reported so far. Empty if nothing was ever stored.
    pub fn get_reported_fingerprints(&self) -> StoreResult<HashSet<ReceiptFingerprint>> {
        let _guard = read_state(&self.state)?;
        self.load()
    }

    /// Record `token` as reported. Idempotent.
    pub fn mark_reported(&self, token: &str) -> StoreResult<ReceiptFingerprint> {
        let fingerprint = ReceiptFingerprint::of_token(token);
        let _guard = write_state(&self.state)?;
        let mut stored = self.store.get_string_set(&self.key)?;
        if stored.insert(fingerprint.as_str().to_string()) {
            self.store.set_string_set(&self.key, &stored)?;
        }
        tracing::debug!(fingerprint = %fingerprint, "Marked receipt reported");
        Ok(fingerprint)
    }

    /// Forget fingerprints no longer backed by an active purchase.
    ///
    /// The stored set becomes `(active_subscriptions ∪ active_in_apps) ∩
    /// reported`; nothing new is ever added.
    pub fn prune(
        &self,
        active_subscriptions: &HashSet<ReceiptFingerprint>,
        active_in_apps: &HashSet<ReceiptFingerprint>,
    ) -> StoreResult<()> {
        let _guard = write_state(&self.state)?;
        let stored = self.store.get_string_set(&self.key)?;
        let kept: BTreeSet<String> = stored
            .iter()
            .filter(|fp| {
                let fp = ReceiptFingerprint::from_stored(fp.as_str());
                active_subscriptions.contains(&fp) || active_in_apps.contains(&fp)
            })
            .cloned()
            .collect();

        if kept.len() != stored.len() {
            tracing::debug!(
                removed = stored.len() - kept.len(),
                kept = kept.len(),
                "Pruned reported receipts"
            );
            self.store.set_string_set(&self.key, &kept)?;
        }
        Ok(())
    }

    /// Active purchases whose fingerprint has not been reported.
    ///
    /// The two maps are unioned with in-app entries winning on a shared
    /// fingerprint. Output is ordered by fingerprint.
    pub fn purchases_needing_report(
        &self,
        active_subscriptions: &HashMap<ReceiptFingerprint, PurchaseRecord>,
        active_in_apps: &HashMap<ReceiptFingerprint, PurchaseRecord>,
    ) -> StoreResult<Vec<PurchaseRecord>> {
        let reported = self.get_reported_fingerprints()?;

        let mut merged: HashMap<&ReceiptFingerprint, &PurchaseRecord> =
            active_subscriptions.iter().collect();
        merged.extend(active_in_apps.iter());

        let mut pending: Vec<(&ReceiptFingerprint, &PurchaseRecord)> = merged
            .into_iter()
            .filter(|(fp, _)| !reported.contains(*fp))
            .collect();
        pending.sort_by(|a, b| a.0.cmp(b.0));
        Ok(pending.into_iter().map(|(_, p)| p.clone()).collect())
    }

    fn load(&self) -> StoreResult<HashSet<ReceiptFingerprint>> {
        Ok(self
            .store
            .get_string_set(&self.key)?
            .into_iter()
            .map(ReceiptFingerprint::from_stored)
            .collect())
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use crate::store::InMemoryKeyedStore;
    use crate::DeviceCache;
    use proptest::prelude::*;
    use purchases_core::{ManualClock, ProductKind, SyncConfig};

    fn ledger() -> ReceiptLedger<InMemoryKeyedStore> {
        DeviceCache::new(
            Arc::new(InMemoryKeyedStore::new()),
            &SyncConfig::new("appl_key"),
            Arc::new(ManualClock::default()),
        )
        .expect("valid config")
        .ledger()
    }

    fn records(tokens: &BTreeSet<String>, kind: ProductKind) -> HashMap<ReceiptFingerprint, PurchaseRecord> {
        tokens
            .iter()
            .map(|t| {
                let record = PurchaseRecord {
                    token: t.clone(),
                    product_id: format!("{:?}-{}", kind, t),
                    is_active: true,
                    kind,
                };
                (record.fingerprint(), record)
            })
            .collect()
    }

    proptest! {
        /// Property: result fingerprints are exactly keys(A ∪ B) \ R, with B
        /// winning collisions.
        #[test]
        fn prop_needing_report_is_set_difference(
            subs in prop::collection::btree_set("[a-e]{1,2}", 0..8),
            in_apps in prop::collection::btree_set("[a-e]{1,2}", 0..8),
            reported in prop::collection::btree_set("[a-e]{1,2}", 0..8),
        ) {
            let ledger = ledger();
            for token in &reported {
                ledger.mark_reported(token).expect("mark");
            }
            let a = records(&subs, ProductKind::Subscription);
            let b = records(&in_apps, ProductKind::InApp);

            let pending = ledger.purchases_needing_report(&a, &b).expect("diff");

            let expected: BTreeSet<String> = subs
                .union(&in_apps)
                .filter(|t| !reported.contains(*t))
                .cloned()
                .collect();
            let got: BTreeSet<String> = pending.iter().map(|p| p.token.clone()).collect();
            prop_assert_eq!(got, expected);
            prop_assert_eq!(pending.len(), pending.iter().map(|p| &p.token).collect::<HashSet<_>>().len());
            for p in &pending {
                if in_apps.contains(&p.token) {
                    prop_assert_eq!(p.kind, ProductKind::InApp);
                }
            }
        }

        /// Property: pruning never introduces fingerprints.
        #[test]
        fn prop_prune_is_subset_of_reported_and_active(
            reported in prop::collection::btree_set("[a-f]", 0..6),
            subs in prop::collection::btree_set("[a-f]", 0..6),
            in_apps in prop::collection::btree_set("[a-f]", 0..6),
        ) {
            let ledger = ledger();
            for token in &reported {
                ledger.mark_reported(token).expect("mark");
            }
            let before = ledger.get_reported_fingerprints().expect("read");
            let sub_fps: HashSet<_> = subs.iter().map(|t| ReceiptFingerprint::of_token(t)).collect();
            let in_app_fps: HashSet<_> = in_apps.iter().map(|t| ReceiptFingerprint::of_token(t)).collect();

            ledger.prune(&sub_fps, &in_app_fps).expect("prune");
            let after = ledger.get_reported_fingerprints().expect("read");

            for fp in &after {
                prop_assert!(before.contains(fp));
                prop_assert!(sub_fps.contains(fp) || in_app_fps.contains(fp));
            }
            for fp in &before {
                if sub_fps.contains(fp) || in_app_fps.contains(fp) {
                    prop_assert!(after.contains(fp));
                }
            }
        }
    }
}
