//! Purchases Test Utilities
//!
//! Shared test infrastructure for the workspace:
//! - Scriptable mock backend and billing collaborators
//! - Proptest generators for entity types
//! - Fixtures for common scenarios

pub use purchases_core::{
    BackendError, BillingCollaborator, BillingUpdate, Catalog, Clock, Entitlement,
    EntitlementBackend, EntitlementSnapshot, Identity, ManualClock, Product, ProductKind,
    PurchaseRecord, ReceiptFingerprint, SyncConfig, SyncError, SyncEvent, Timestamp,
};
pub use purchases_storage::{DeviceCache, InMemoryKeyedStore};

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// MOCK BACKEND
// ============================================================================

/// A receipt post as seen by [`MockBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedReceipt {
    pub token: String,
    pub app_user_id: Identity,
    pub product_id: String,
    pub is_restore: bool,
}

#[derive(Debug, Default)]
struct BackendScript {
    fetch_responses: VecDeque<Result<EntitlementSnapshot, BackendError>>,
    failing_tokens: HashSet<String>,
    products: Vec<Product>,
    catalog_failure: Option<BackendError>,
    posted: Vec<PostedReceipt>,
    catalog_requests: Vec<Vec<String>>,
}

/// Entitlement backend with scripted responses.
///
/// Entitlement fetches pop scripted responses in order and fall back to an
/// empty snapshot for the requested user. Receipt posts succeed with a
/// snapshot granting the `pro` entitlement for the posted product, unless
/// the token was marked failing.
#[derive(Debug)]
pub struct MockBackend {
    script: Mutex<BackendScript>,
    fetch_calls: AtomicUsize,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(BackendScript::default()),
            fetch_calls: AtomicUsize::new(0),
            gate: Mutex::new(None),
        }
    }

    /// Queue the result of the next entitlement fetch.
    pub fn push_fetch(&self, response: Result<EntitlementSnapshot, BackendError>) {
        lock(&self.script).fetch_responses.push_back(response);
    }

    /// Make every post of `token` fail with a transport error.
    pub fn fail_post_for(&self, token: &str) {
        lock(&self.script).failing_tokens.insert(token.to_string());
    }

    pub fn set_products(&self, products: Vec<Product>) {
        lock(&self.script).products = products;
    }

    pub fn fail_catalog(&self, error: BackendError) {
        lock(&self.script).catalog_failure = Some(error);
    }

    /// Park entitlement fetches until [`Self::release_fetches`] is called.
    pub fn hold_fetches(&self) {
        *lock(&self.gate) = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let `n` parked fetches complete.
    pub fn release_fetches(&self, n: usize) {
        if let Some(gate) = lock(&self.gate).as_ref() {
            gate.add_permits(n);
        }
    }

    /// Number of entitlement fetches started so far.
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Yield until at least `n` fetches have started.
    pub async fn wait_for_fetches(&self, n: usize) {
        while self.fetch_calls() < n {
            tokio::task::yield_now().await;
        }
    }

    pub fn posted(&self) -> Vec<PostedReceipt> {
        lock(&self.script).posted.clone()
    }

    pub fn catalog_requests(&self) -> Vec<Vec<String>> {
        lock(&self.script).catalog_requests.clone()
    }
}

#[async_trait]
impl EntitlementBackend for MockBackend {
    async fn fetch_entitlements(
        &self,
        app_user_id: &Identity,
    ) -> Result<EntitlementSnapshot, BackendError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);

        let gate = lock(&self.gate).clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let scripted = lock(&self.script).fetch_responses.pop_front();
        scripted.unwrap_or_else(|| Ok(fixtures::make_snapshot(app_user_id, &[])))
    }

    async fn post_receipt(
        &self,
        token: &str,
        app_user_id: &Identity,
        product_id: &str,
        is_restore: bool,
    ) -> Result<EntitlementSnapshot, BackendError> {
        let mut script = lock(&self.script);
        script.posted.push(PostedReceipt {
            token: token.to_string(),
            app_user_id: app_user_id.clone(),
            product_id: product_id.to_string(),
            is_restore,
        });
        if script.failing_tokens.contains(token) {
            return Err(BackendError::Transport {
                reason: format!("post of {} failed", product_id),
            });
        }
        Ok(fixtures::make_snapshot(app_user_id, &[("pro", product_id)]))
    }

    async fn fetch_catalog(&self, product_ids: &[String]) -> Result<Catalog, BackendError> {
        let mut script = lock(&self.script);
        script.catalog_requests.push(product_ids.to_vec());
        if let Some(error) = script.catalog_failure.clone() {
            return Err(error);
        }
        Ok(Catalog::new(
            script
                .products
                .iter()
                .filter(|p| product_ids.contains(&p.product_id))
                .cloned()
                .collect(),
        ))
    }
}

// ============================================================================
// MOCK BILLING
// ============================================================================

#[derive(Debug, Default)]
struct BillingScript {
    subscriptions: Vec<PurchaseRecord>,
    in_apps: Vec<PurchaseRecord>,
    history: HashMap<ProductKind, Vec<PurchaseRecord>>,
    history_failures: HashMap<ProductKind, SyncError>,
    failure: Option<SyncError>,
}

/// Billing collaborator returning configured purchases.
#[derive(Debug, Default)]
pub struct MockBilling {
    script: Mutex<BillingScript>,
}

impl MockBilling {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_active(&self, subscriptions: Vec<PurchaseRecord>, in_apps: Vec<PurchaseRecord>) {
        let mut script = lock(&self.script);
        script.subscriptions = subscriptions;
        script.in_apps = in_apps;
    }

    pub fn set_history(&self, kind: ProductKind, purchases: Vec<PurchaseRecord>) {
        lock(&self.script).history.insert(kind, purchases);
    }

    /// Make every query fail with `error`.
    pub fn fail_with(&self, error: SyncError) {
        lock(&self.script).failure = Some(error);
    }

    /// Make history queries for `kind` fail with `error`.
    pub fn fail_history_for(&self, kind: ProductKind, error: SyncError) {
        lock(&self.script).history_failures.insert(kind, error);
    }

    fn answer(&self, pick: impl FnOnce(&BillingScript) -> Vec<PurchaseRecord>) -> Result<Vec<PurchaseRecord>, SyncError> {
        let script = lock(&self.script);
        match &script.failure {
            Some(error) => Err(error.clone()),
            None => Ok(pick(&script)),
        }
    }
}

#[async_trait]
impl BillingCollaborator for MockBilling {
    async fn active_subscriptions(&self) -> Result<Vec<PurchaseRecord>, SyncError> {
        self.answer(|s| s.subscriptions.clone())
    }

    async fn active_in_app_purchases(&self) -> Result<Vec<PurchaseRecord>, SyncError> {
        self.answer(|s| s.in_apps.clone())
    }

    async fn purchase_history(&self, kind: ProductKind) -> Result<Vec<PurchaseRecord>, SyncError> {
        if let Some(error) = lock(&self.script).history_failures.get(&kind).cloned() {
            return Err(error);
        }
        self.answer(|s| s.history.get(&kind).cloned().unwrap_or_default())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for purchase-state entity types.

    use super::*;
    use proptest::prelude::*;

    /// Generate a Timestamp within 2020-2030.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1577836800i64..1893456000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
        })
    }

    /// Generate an identified or anonymous identity.
    pub fn arb_identity() -> impl Strategy<Value = Identity> {
        prop_oneof![
            "[a-zA-Z0-9_-]{1,24}".prop_filter_map("non-blank", Identity::parse),
            Just(()).prop_map(|_| Identity::new_anonymous()),
        ]
    }

    /// Generate a purchase token.
    pub fn arb_token() -> impl Strategy<Value = String> {
        "[a-z]{8,24}\\.[A-Za-z0-9_-]{16,64}"
    }

    pub fn arb_product_kind() -> impl Strategy<Value = ProductKind> {
        prop_oneof![Just(ProductKind::Subscription), Just(ProductKind::InApp)]
    }

    pub fn arb_purchase_record() -> impl Strategy<Value = PurchaseRecord> {
        (arb_token(), "[a-z_]{3,16}", any::<bool>(), arb_product_kind()).prop_map(
            |(token, product_id, is_active, kind)| PurchaseRecord {
                token,
                product_id,
                is_active,
                kind,
            },
        )
    }

    pub fn arb_entitlement() -> impl Strategy<Value = Entitlement> {
        ("[a-z_]{3,16}", any::<bool>(), prop::option::of(arb_timestamp())).prop_map(
            |(product_id, is_active, expires_at)| Entitlement {
                product_id,
                is_active,
                expires_at,
            },
        )
    }

    pub fn arb_snapshot() -> impl Strategy<Value = EntitlementSnapshot> {
        (
            arb_identity(),
            arb_timestamp(),
            prop::collection::vec(("[a-z]{2,10}", arb_entitlement()), 0..5),
        )
            .prop_map(|(user, request_date, entitlements)| {
                entitlements.into_iter().fold(
                    EntitlementSnapshot::new(user, request_date),
                    |snapshot, (id, entitlement)| snapshot.with_entitlement(id, entitlement),
                )
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common scenarios.

    use super::*;

    pub const TEST_API_KEY: &str = "appl_test_key";

    /// Config with defaults and the test API key.
    pub fn test_config() -> SyncConfig {
        SyncConfig::new(TEST_API_KEY)
    }

    pub fn identity(app_user_id: &str) -> Identity {
        Identity::parse(app_user_id).unwrap_or_else(Identity::new_anonymous)
    }

    /// Snapshot for `user` with one active entitlement per `(entitlement, product)`.
    pub fn make_snapshot(user: &Identity, active: &[(&str, &str)]) -> EntitlementSnapshot {
        active.iter().fold(
            EntitlementSnapshot::new(user.clone(), Utc::now()),
            |snapshot, (id, product_id)| {
                snapshot.with_entitlement(
                    *id,
                    Entitlement {
                        product_id: product_id.to_string(),
                        is_active: true,
                        expires_at: None,
                    },
                )
            },
        )
    }

    pub fn make_purchase(token: &str, product_id: &str, kind: ProductKind) -> PurchaseRecord {
        PurchaseRecord {
            token: token.to_string(),
            product_id: product_id.to_string(),
            is_active: true,
            kind,
        }
    }

    pub fn make_product(product_id: &str, kind: ProductKind) -> Product {
        Product {
            product_id: product_id.to_string(),
            kind,
            title: format!("{} title", product_id),
            price_micros: 4_990_000,
            currency_code: "USD".to_string(),
        }
    }

    /// In-memory device cache driven by `clock`.
    pub fn memory_cache(config: &SyncConfig, clock: &ManualClock) -> Arc<DeviceCache<InMemoryKeyedStore>> {
        memory_cache_on(Arc::new(InMemoryKeyedStore::new()), config, clock)
    }

    /// Device cache over an existing store, e.g. to simulate a restart.
    pub fn memory_cache_on(
        store: Arc<InMemoryKeyedStore>,
        config: &SyncConfig,
        clock: &ManualClock,
    ) -> Arc<DeviceCache<InMemoryKeyedStore>> {
        match DeviceCache::new(store, config, Arc::new(clock.clone())) {
            Ok(cache) => Arc::new(cache),
            Err(e) => panic!("test config must validate: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_backend_scripted_fetches() {
        let backend = MockBackend::new();
        let alice = fixtures::identity("alice");
        backend.push_fetch(Err(BackendError::Transport {
            reason: "offline".to_string(),
        }));

        assert!(backend.fetch_entitlements(&alice).await.is_err());
        let fallback = backend.fetch_entitlements(&alice).await.expect("default snapshot");
        assert_eq!(fallback.app_user_id, alice);
        assert_eq!(backend.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn test_mock_backend_posts() {
        let backend = MockBackend::new();
        let alice = fixtures::identity("alice");
        backend.fail_post_for("bad");

        let snapshot = backend
            .post_receipt("good", &alice, "monthly", false)
            .await
            .expect("post succeeds");
        assert!(snapshot.is_entitled_to("pro"));
        assert!(backend.post_receipt("bad", &alice, "monthly", true).await.is_err());
        assert_eq!(backend.posted().len(), 2);
    }

    #[tokio::test]
    async fn test_mock_billing_failure() {
        let billing = MockBilling::new();
        billing.set_active(
            vec![fixtures::make_purchase("t", "monthly", ProductKind::Subscription)],
            vec![],
        );
        assert_eq!(billing.active_subscriptions().await.expect("ok").len(), 1);

        billing.fail_with(SyncError::Billing {
            code: 3,
            message: "unavailable".to_string(),
        });
        assert!(billing.active_in_app_purchases().await.is_err());
    }
}
