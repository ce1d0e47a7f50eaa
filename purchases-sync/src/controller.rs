//! Synchronization controller.
//!
//! Decides when the device cache is good enough and when the backend has to
//! be asked, for one identity at a time:
//!
//! - **Fresh**: snapshot cached and within TTL, served without a network call.
//! - **Stale/Missing**: fetched; success overwrites the cache and emits
//!   [`SyncEvent::Updated`], failure leaves the cache alone and emits
//!   [`SyncEvent::Failed`].
//! - **Throttled**: lifecycle triggers within the refresh cooldown of the
//!   last successful refresh do nothing.
//!
//! Identity switches, [`SyncController::invalidate`] and
//! [`SyncController::force_refresh`] bypass both TTL and cooldown. A
//! completed purchase writes the snapshot returned by the backend directly.
//!
//! At most one entitlement fetch per identity is in flight; later triggers
//! for the same identity join it instead of issuing another request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use purchases_core::{
    elapsed_between, index_by_fingerprint, BillingCollaborator, BillingUpdate, Catalog,
    EntitlementBackend, EntitlementSnapshot, Identity, Product,
    ProductKind, PurchaseRecord, PurchasesResult, SyncConfig, SyncError, SyncEvent, Timestamp,
};
use purchases_storage::{DeviceCache, KeyedStore};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

type FetchResult = Result<EntitlementSnapshot, SyncError>;

/// What prompted a cache-respecting refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
    /// First refresh after the controller was built
    Startup,
    /// The host app returned to the foreground
    AppForegrounded,
    /// A read found the cached snapshot stale
    StaleRead,
}

/// Result of a cache-respecting refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Cached snapshot is fresh; nothing fetched.
    Fresh,
    /// Within the refresh cooldown; nothing fetched.
    Throttled,
    /// A fetch for this identity was already in flight.
    Coalesced,
    /// Fetched and cached.
    Refreshed(EntitlementSnapshot),
    /// The fetch failed; the cache is unchanged.
    Failed(SyncError),
    /// The identity changed while the fetch was in flight; result dropped.
    Superseded,
}

impl From<FetchResult> for RefreshOutcome {
    fn from(result: FetchResult) -> Self {
        match result {
            Ok(snapshot) => RefreshOutcome::Refreshed(snapshot),
            Err(SyncError::Superseded) => RefreshOutcome::Superseded,
            Err(e) => RefreshOutcome::Failed(e),
        }
    }
}

#[derive(Debug)]
struct ControllerState {
    identity: Identity,
    last_successful_refresh: Option<Timestamp>,
    in_flight: HashMap<Identity, InFlight>,
    next_fetch_id: u64,
}

impl ControllerState {
    fn release_fetch(&mut self, identity: &Identity, id: u64) {
        if self.in_flight.get(identity).is_some_and(|f| f.id == id) {
            self.in_flight.remove(identity);
        }
    }
}

#[derive(Debug)]
struct InFlight {
    id: u64,
    rx: watch::Receiver<Option<FetchResult>>,
}

enum FetchSlot<S: KeyedStore + 'static> {
    Lead(FetchLease<S>),
    Join(watch::Receiver<Option<FetchResult>>),
}

/// Leadership of one in-flight fetch.
///
/// Dropping the lease frees the identity's slot whether or not the fetch
/// finished, so a cancelled leader never strands later callers.
struct FetchLease<S: KeyedStore + 'static> {
    inner: Arc<Inner<S>>,
    identity: Identity,
    id: u64,
    tx: watch::Sender<Option<FetchResult>>,
}

impl<S: KeyedStore + 'static> Drop for FetchLease<S> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        state.release_fetch(&self.identity, self.id);
    }
}

struct Inner<S: KeyedStore> {
    cache: Arc<DeviceCache<S>>,
    backend: Arc<dyn EntitlementBackend>,
    billing: Arc<dyn BillingCollaborator>,
    events: mpsc::UnboundedSender<SyncEvent>,
    refresh_cooldown: Duration,
    state: Mutex<ControllerState>,
}

/// Orchestrates cache reads, backend fetches and receipt posting.
///
/// Cheap to clone; clones share state. Listener events arrive on the
/// receiver returned by [`SyncController::new`].
pub struct SyncController<S: KeyedStore + 'static> {
    inner: Arc<Inner<S>>,
}

impl<S: KeyedStore + 'static> Clone for SyncController<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: KeyedStore + 'static> SyncController<S> {
    /// Build a controller and resolve the current identity.
    ///
    /// Identity resolution: a configured app user id wins (clearing the
    /// caches of a different cached user), then the cached identity
    /// (migrating a legacy one if needed), then a fresh anonymous id. The
    /// result is persisted. Legacy subscriber attributes are migrated too.
    ///
    /// # Errors
    ///
    /// Invalid configuration and store failures are fatal here.
    pub fn new(
        config: &SyncConfig,
        cache: Arc<DeviceCache<S>>,
        backend: Arc<dyn EntitlementBackend>,
        billing: Arc<dyn BillingCollaborator>,
    ) -> PurchasesResult<(Self, mpsc::UnboundedReceiver<SyncEvent>)> {
        config.validate()?;

        cache.migrate_legacy_identity()?;
        let cached = cache.get_identity()?;
        let configured = config.app_user_id.clone().and_then(Identity::parse);

        let identity = match (configured, cached) {
            (Some(configured), Some(cached)) if configured != cached => {
                tracing::info!(
                    previous = %cached,
                    app_user_id = %configured,
                    "Configured app user id differs from cached one; clearing caches"
                );
                cache.clear_for_identity()?;
                configured
            }
            (Some(configured), _) => configured,
            (None, Some(cached)) => cached,
            (None, None) => {
                let anonymous = Identity::new_anonymous();
                tracing::info!(app_user_id = %anonymous, "Generated anonymous app user id");
                anonymous
            }
        };
        cache.set_identity(&identity)?;
        cache.migrate_legacy_subscriber_attributes()?;

        let (events, receiver) = mpsc::unbounded_channel();
        let controller = Self {
            inner: Arc::new(Inner {
                cache,
                backend,
                billing,
                events,
                refresh_cooldown: config.refresh_cooldown(),
                state: Mutex::new(ControllerState {
                    identity,
                    last_successful_refresh: None,
                    in_flight: HashMap::new(),
                    next_fetch_id: 0,
                }),
            }),
        };
        Ok((controller, receiver))
    }

    // Every critical section leaves the state consistent before it can
    // panic, so a poisoned lock is still usable.
    fn lock_state(&self) -> MutexGuard<'_, ControllerState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: SyncEvent) {
        if self.inner.events.send(event).is_err() {
            tracing::debug!("Event receiver dropped; discarding sync event");
        }
    }

    pub fn cache(&self) -> &Arc<DeviceCache<S>> {
        &self.inner.cache
    }

    pub fn app_user_id(&self) -> Identity {
        self.lock_state().identity.clone()
    }

    pub fn is_anonymous(&self) -> bool {
        self.lock_state().identity.is_anonymous()
    }

    /// Cached snapshot for the current identity, stale or not.
    pub fn cached_entitlements(&self) -> Option<EntitlementSnapshot> {
        self.inner.cache.get_snapshot(&self.app_user_id())
    }

    /// Current entitlements.
    ///
    /// A fresh cached snapshot is returned as is. A stale one is returned
    /// immediately while a background refresh runs. Without a cached
    /// snapshot the fetch is awaited.
    pub async fn get_entitlements(&self) -> Result<EntitlementSnapshot, SyncError> {
        match self.cached_entitlements() {
            Some(snapshot) if !self.inner.cache.is_snapshot_stale() => Ok(snapshot),
            Some(snapshot) => {
                drop(self.spawn_refresh(RefreshTrigger::StaleRead));
                Ok(snapshot)
            }
            None => self.force_refresh().await,
        }
    }

    // ------------------------------------------------------------------
    // Refresh
    // ------------------------------------------------------------------

    /// Refresh on startup unless the cache makes it unnecessary.
    pub async fn refresh_if_needed(&self) -> RefreshOutcome {
        self.refresh(RefreshTrigger::Startup).await
    }

    pub async fn on_app_foregrounded(&self) -> RefreshOutcome {
        self.refresh(RefreshTrigger::AppForegrounded).await
    }

    /// Cache-respecting refresh. Failures are reported through
    /// [`SyncEvent::Failed`] and the returned outcome, never by clearing
    /// cached data.
    pub async fn refresh(&self, trigger: RefreshTrigger) -> RefreshOutcome {
        let slot = {
            let mut state = self.lock_state();
            if let Some(skip) = self.skip_reason(&state, trigger) {
                return skip;
            }
            self.claim_fetch(&mut state)
        };

        match slot {
            FetchSlot::Lead(lease) => self.lead_fetch(lease).await.into(),
            FetchSlot::Join(_) => {
                tracing::debug!(?trigger, "Entitlement fetch already in flight; coalescing");
                RefreshOutcome::Coalesced
            }
        }
    }

    /// Run [`Self::refresh`] on the tokio runtime without waiting for it.
    pub fn spawn_refresh(&self, trigger: RefreshTrigger) -> JoinHandle<RefreshOutcome> {
        let controller = self.clone();
        tokio::spawn(async move { controller.refresh(trigger).await })
    }

    /// Fetch regardless of TTL and cooldown.
    ///
    /// Joins an in-flight fetch for the same identity rather than starting a
    /// second one, and takes over if that fetch is abandoned. Unlike
    /// background refreshes, the failure is returned to the caller as well
    /// as emitted.
    pub async fn force_refresh(&self) -> Result<EntitlementSnapshot, SyncError> {
        loop {
            let slot = {
                let mut state = self.lock_state();
                self.claim_fetch(&mut state)
            };

            match slot {
                FetchSlot::Lead(lease) => return self.lead_fetch(lease).await,
                FetchSlot::Join(rx) => {
                    if let Some(result) = Self::join_fetch(rx).await {
                        return result;
                    }
                    tracing::debug!("Joined entitlement fetch was abandoned; retrying");
                }
            }
        }
    }

    /// Force the next refresh to go to the backend.
    pub fn invalidate(&self) -> Result<(), SyncError> {
        let mut state = self.lock_state();
        state.last_successful_refresh = None;
        self.inner.cache.clear_snapshot_timestamp()?;
        self.inner.cache.clear_catalog_timestamp();
        tracing::debug!(app_user_id = %state.identity, "Invalidated cached entitlements");
        Ok(())
    }

    fn skip_reason(&self, state: &ControllerState, trigger: RefreshTrigger) -> Option<RefreshOutcome> {
        let cache = &self.inner.cache;
        let now = cache.clock().now();

        if let Some(last) = state.last_successful_refresh {
            if elapsed_between(last, now) < self.inner.refresh_cooldown {
                tracing::debug!(?trigger, "Refresh skipped; within cooldown");
                return Some(RefreshOutcome::Throttled);
            }
        }

        if !cache.is_snapshot_stale() && cache.get_snapshot(&state.identity).is_some() {
            return Some(RefreshOutcome::Fresh);
        }
        None
    }

    fn claim_fetch(&self, state: &mut ControllerState) -> FetchSlot<S> {
        let identity = state.identity.clone();
        if let Some(in_flight) = state.in_flight.get(&identity) {
            if in_flight.rx.has_changed().is_ok() {
                return FetchSlot::Join(in_flight.rx.clone());
            }
            tracing::debug!(app_user_id = %identity, "Dropping abandoned entitlement fetch");
            state.in_flight.remove(&identity);
        }

        state.next_fetch_id += 1;
        let id = state.next_fetch_id;
        let (tx, rx) = watch::channel(None);
        state.in_flight.insert(identity.clone(), InFlight { id, rx });
        FetchSlot::Lead(FetchLease {
            inner: Arc::clone(&self.inner),
            identity,
            id,
            tx,
        })
    }

    async fn lead_fetch(&self, lease: FetchLease<S>) -> FetchResult {
        let fetched = self
            .inner
            .backend
            .fetch_entitlements(&lease.identity)
            .await
            .map_err(SyncError::from);
        let result = self.finish_fetch(&lease, fetched);
        lease.tx.send_replace(Some(result.clone()));
        result
    }

    /// `None` when the leader went away without a result.
    async fn join_fetch(mut rx: watch::Receiver<Option<FetchResult>>) -> Option<FetchResult> {
        let result = match rx.wait_for(Option::is_some).await {
            Ok(done) => (*done).clone(),
            Err(_) => None,
        };
        result
    }

    fn finish_fetch(&self, lease: &FetchLease<S>, fetched: FetchResult) -> FetchResult {
        let identity = &lease.identity;
        let mut state = self.lock_state();
        state.release_fetch(identity, lease.id);

        if state.identity != *identity {
            tracing::debug!(
                fetched_for = %identity,
                current = %state.identity,
                "Discarding entitlement fetch for previous identity"
            );
            return Err(SyncError::Superseded);
        }

        match fetched {
            Ok(snapshot) => {
                if let Err(e) = self.inner.cache.put_snapshot(identity, &snapshot) {
                    tracing::warn!(error = %e, "Failed to cache entitlement snapshot");
                }
                state.last_successful_refresh = Some(self.inner.cache.clock().now());
                tracing::debug!(app_user_id = %identity, "Entitlements refreshed");
                self.emit(SyncEvent::Updated(snapshot.clone()));
                Ok(snapshot)
            }
            Err(e) => {
                tracing::warn!(app_user_id = %identity, error = %e, "Entitlement fetch failed");
                self.emit(SyncEvent::Failed(e.clone()));
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    /// Switch to `app_user_id` and fetch its entitlements.
    ///
    /// Identifying as the current user only refreshes if needed.
    pub async fn identify(&self, app_user_id: &str) -> PurchasesResult<EntitlementSnapshot> {
        let identity = Identity::try_new(app_user_id)?;

        if identity == self.app_user_id() {
            return Ok(self.get_entitlements().await?);
        }
        self.switch_identity(identity)?;
        Ok(self.force_refresh().await?)
    }

    /// Drop the current user and continue as a new anonymous one.
    pub async fn reset(&self) -> PurchasesResult<EntitlementSnapshot> {
        self.switch_identity(Identity::new_anonymous())?;
        Ok(self.force_refresh().await?)
    }

    fn switch_identity(&self, identity: Identity) -> Result<(), SyncError> {
        let mut state = self.lock_state();
        self.inner.cache.clear_for_identity()?;
        self.inner.cache.set_identity(&identity)?;
        tracing::info!(previous = %state.identity, app_user_id = %identity, "Switched identity");
        state.identity = identity;
        state.last_successful_refresh = None;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Purchases
    // ------------------------------------------------------------------

    /// React to a billing client notification.
    ///
    /// Each completed purchase is posted; success emits
    /// [`SyncEvent::Completed`], failure [`SyncEvent::Failed`]. Purchases
    /// made while anonymous are posted as restores so the receipt can move
    /// to a later identified user.
    pub async fn handle_billing_update(&self, update: BillingUpdate) {
        match update {
            BillingUpdate::PurchasesUpdated(purchases) => {
                let is_restore = self.is_anonymous();
                for purchase in &purchases {
                    // Outcome is delivered through the event channel.
                    let _ = self
                        .post_purchase(purchase, is_restore, SyncEvent::Completed)
                        .await;
                }
            }
            BillingUpdate::PurchaseFailed { code, message } => {
                tracing::warn!(code, message = %message, "Billing flow failed");
                self.emit(SyncEvent::Failed(SyncError::Billing { code, message }));
            }
        }
    }

    /// Re-post the store account's purchase history for the current user.
    ///
    /// Subscription and in-app history are queried independently; a failed
    /// query emits [`SyncEvent::Failed`] and the other kind is still
    /// restored. Every successful post emits [`SyncEvent::Updated`]. With no
    /// history the current entitlements are fetched instead. Returns the
    /// last snapshot received, or the last error if nothing was restored.
    pub async fn restore_purchases(&self) -> Result<EntitlementSnapshot, SyncError> {
        let mut history = Vec::new();
        let mut last_err = None;
        for kind in [ProductKind::Subscription, ProductKind::InApp] {
            match self.billing_call(kind).await {
                Ok(purchases) => history.extend(purchases),
                Err(e) => last_err = Some(e),
            }
        }

        let mut restored = None;
        for purchase in &history {
            match self.post_purchase(purchase, true, SyncEvent::Updated).await {
                Ok(snapshot) => restored = Some(snapshot),
                Err(e) => last_err = Some(e),
            }
        }
        tracing::info!(
            purchases = history.len(),
            failed = last_err.is_some(),
            "Restore finished"
        );

        match (restored, last_err) {
            (Some(snapshot), _) => Ok(snapshot),
            (None, Some(e)) => Err(e),
            (None, None) => {
                tracing::debug!("No purchase history to restore; fetching entitlements");
                self.force_refresh().await
            }
        }
    }

    /// Post active purchases the ledger has not seen, then prune the ledger.
    ///
    /// Returns the number of purchases posted successfully.
    pub async fn sync_pending_purchases(&self) -> Result<usize, SyncError> {
        let subscriptions = self.emit_on_err(self.inner.billing.active_subscriptions().await)?;
        let in_apps = self.emit_on_err(self.inner.billing.active_in_app_purchases().await)?;

        let subscriptions = index_by_fingerprint(&subscriptions);
        let in_apps = index_by_fingerprint(&in_apps);

        let ledger = self.inner.cache.ledger();
        let pending = ledger.purchases_needing_report(&subscriptions, &in_apps)?;
        let is_restore = self.is_anonymous();

        let mut posted = 0;
        for purchase in &pending {
            if self
                .post_purchase(purchase, is_restore, SyncEvent::Updated)
                .await
                .is_ok()
            {
                posted += 1;
            }
        }

        ledger.prune(
            &subscriptions.keys().cloned().collect(),
            &in_apps.keys().cloned().collect(),
        )?;
        tracing::debug!(pending = pending.len(), posted, "Synced pending purchases");
        Ok(posted)
    }

    async fn billing_call(&self, kind: ProductKind) -> Result<Vec<PurchaseRecord>, SyncError> {
        self.emit_on_err(self.inner.billing.purchase_history(kind).await)
    }

    fn emit_on_err<T>(&self, result: Result<T, SyncError>) -> Result<T, SyncError> {
        if let Err(e) = &result {
            tracing::warn!(error = %e, "Billing query failed");
            self.emit(SyncEvent::Failed(e.clone()));
        }
        result
    }

    async fn post_purchase(
        &self,
        purchase: &PurchaseRecord,
        is_restore: bool,
        on_success: fn(EntitlementSnapshot) -> SyncEvent,
    ) -> Result<EntitlementSnapshot, SyncError> {
        let identity = self.app_user_id();
        let posted = self
            .inner
            .backend
            .post_receipt(&purchase.token, &identity, &purchase.product_id, is_restore)
            .await;

        match posted {
            Ok(snapshot) => {
                let fingerprint = match self.inner.cache.ledger().mark_reported(&purchase.token) {
                    Ok(fp) => Some(fp),
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to record reported receipt");
                        None
                    }
                };
                self.store_posted_snapshot(&identity, &snapshot);
                tracing::info!(
                    product_id = %purchase.product_id,
                    fingerprint = ?fingerprint.as_ref().map(|f| f.as_str()),
                    is_restore,
                    "Receipt posted"
                );
                self.emit(on_success(snapshot.clone()));
                Ok(snapshot)
            }
            Err(e) => {
                tracing::warn!(product_id = %purchase.product_id, error = %e, "Receipt post failed");
                let err = SyncError::from(e);
                self.emit(SyncEvent::Failed(err.clone()));
                Err(err)
            }
        }
    }

    fn store_posted_snapshot(&self, identity: &Identity, snapshot: &EntitlementSnapshot) {
        let mut state = self.lock_state();
        if state.identity != *identity {
            tracing::debug!(posted_for = %identity, "Identity changed; not caching post response");
            return;
        }
        match self.inner.cache.put_snapshot(identity, snapshot) {
            Ok(()) => state.last_successful_refresh = Some(self.inner.cache.clock().now()),
            Err(e) => tracing::warn!(error = %e, "Failed to cache post response"),
        }
    }

    // ------------------------------------------------------------------
    // Catalog and attributes
    // ------------------------------------------------------------------

    /// Catalog covering `product_ids`, from cache when fresh.
    pub async fn get_catalog(&self, product_ids: &[String]) -> Result<Catalog, SyncError> {
        let cache = &self.inner.cache;
        let stale = cache.is_catalog_stale();
        if !stale {
            if let Some(catalog) = cache.cached_catalog() {
                if catalog.covers(product_ids) {
                    return Ok(catalog);
                }
            }
        }

        let fetched = self.inner.backend.fetch_catalog(product_ids).await?;
        if stale {
            cache.cache_catalog(fetched);
        } else {
            cache.merge_catalog(fetched);
        }
        Ok(cache.cached_catalog().unwrap_or_default())
    }

    pub async fn get_subscription_products(&self, product_ids: &[String]) -> Result<Vec<Product>, SyncError> {
        Ok(self
            .get_catalog(product_ids)
            .await?
            .select(product_ids, ProductKind::Subscription))
    }

    pub async fn get_in_app_products(&self, product_ids: &[String]) -> Result<Vec<Product>, SyncError> {
        Ok(self
            .get_catalog(product_ids)
            .await?
            .select(product_ids, ProductKind::InApp))
    }

    /// Set a subscriber attribute for the current user.
    pub fn set_attribute(&self, key: &str, value: Option<String>) -> Result<(), SyncError> {
        let identity = self.app_user_id();
        Ok(self.inner.cache.set_attribute(&identity, key, value)?)
    }
}
