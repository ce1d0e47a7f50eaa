//! Traits for the collaborators the sync engine talks to.
//!
//! The HTTP client and the platform billing client live outside this
//! workspace; they plug in through these traits.

use crate::{
    BackendError, Catalog, EntitlementSnapshot, Identity, ProductKind, PurchaseRecord, SyncError,
};
use async_trait::async_trait;

/// Remote entitlement service.
#[async_trait]
pub trait EntitlementBackend: Send + Sync {
    /// Fetch the current entitlement snapshot for a user.
    async fn fetch_entitlements(
        &self,
        app_user_id: &Identity,
    ) -> Result<EntitlementSnapshot, BackendError>;

    /// Report a purchase token. The response carries the updated snapshot.
    async fn post_receipt(
        &self,
        token: &str,
        app_user_id: &Identity,
        product_id: &str,
        is_restore: bool,
    ) -> Result<EntitlementSnapshot, BackendError>;

    /// Fetch catalog entries for the given product ids.
    async fn fetch_catalog(&self, product_ids: &[String]) -> Result<Catalog, BackendError>;
}

/// Platform billing client.
#[async_trait]
pub trait BillingCollaborator: Send + Sync {
    /// Currently owned subscriptions.
    async fn active_subscriptions(&self) -> Result<Vec<PurchaseRecord>, SyncError>;

    /// Currently owned (unconsumed) one-time purchases.
    async fn active_in_app_purchases(&self) -> Result<Vec<PurchaseRecord>, SyncError>;

    /// Purchase history of the store account, used by restore flows.
    async fn purchase_history(&self, kind: ProductKind) -> Result<Vec<PurchaseRecord>, SyncError>;
}

/// Notification pushed by the billing client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingUpdate {
    /// The user completed one or more purchases.
    PurchasesUpdated(Vec<PurchaseRecord>),
    /// The billing flow failed before a receipt was produced.
    PurchaseFailed { code: i32, message: String },
}
