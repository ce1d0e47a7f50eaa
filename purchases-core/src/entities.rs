//! Core entity structures

use crate::{Identity, ReceiptFingerprint, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Schema version stamped on every persisted entitlement snapshot.
///
/// Bump whenever [`EntitlementSnapshot`] changes shape; older records are then
/// ignored and refetched instead of being partially trusted.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 3;

/// Store product kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductKind {
    /// Auto-renewing subscription
    Subscription,
    /// One-time (consumable or non-consumable) purchase
    InApp,
}

/// A single entitlement granted to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub product_id: String,
    pub is_active: bool,
    pub expires_at: Option<Timestamp>,
}

/// Entitlement snapshot - the backend's view of what a user has purchased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementSnapshot {
    pub schema_version: u32,
    pub app_user_id: Identity,
    /// Entitlements keyed by entitlement identifier
    pub entitlements: BTreeMap<String, Entitlement>,
    pub active_products: BTreeSet<String>,
    /// Server time at which the backend produced this snapshot
    pub request_date: Timestamp,
}

impl EntitlementSnapshot {
    /// Create an empty snapshot for a user at the current schema version.
    pub fn new(app_user_id: Identity, request_date: Timestamp) -> Self {
        Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            app_user_id,
            entitlements: BTreeMap::new(),
            active_products: BTreeSet::new(),
            request_date,
        }
    }

    /// Add an entitlement, tracking its product as active when applicable.
    pub fn with_entitlement(mut self, id: impl Into<String>, entitlement: Entitlement) -> Self {
        if entitlement.is_active {
            self.active_products.insert(entitlement.product_id.clone());
        }
        self.entitlements.insert(id.into(), entitlement);
        self
    }

    /// Identifiers of entitlements currently active.
    pub fn active_entitlements(&self) -> impl Iterator<Item = &str> {
        self.entitlements
            .iter()
            .filter(|(_, e)| e.is_active)
            .map(|(id, _)| id.as_str())
    }

    pub fn is_entitled_to(&self, entitlement_id: &str) -> bool {
        self.entitlements
            .get(entitlement_id)
            .map(|e| e.is_active)
            .unwrap_or(false)
    }
}

/// Purchase as reported by the billing collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PurchaseRecord {
    pub token: String,
    pub product_id: String,
    pub is_active: bool,
    pub kind: ProductKind,
}

impl PurchaseRecord {
    /// Fingerprint of this purchase's token, as stored by the receipt ledger.
    pub fn fingerprint(&self) -> ReceiptFingerprint {
        ReceiptFingerprint::of_token(&self.token)
    }
}

/// Index active purchases by fingerprint.
///
/// Inactive records are skipped. Later records win on duplicate tokens.
pub fn index_by_fingerprint<'a, I>(purchases: I) -> HashMap<ReceiptFingerprint, PurchaseRecord>
where
    I: IntoIterator<Item = &'a PurchaseRecord>,
{
    purchases
        .into_iter()
        .filter(|p| p.is_active)
        .map(|p| (p.fingerprint(), p.clone()))
        .collect()
}

/// Product as listed in the store catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub product_id: String,
    pub kind: ProductKind,
    pub title: String,
    pub price_micros: i64,
    pub currency_code: String,
}

/// Catalog snapshot fetched from the backend.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Catalog {
    pub products: Vec<Product>,
}

impl Catalog {
    pub fn new(products: Vec<Product>) -> Self {
        Self { products }
    }

    pub fn get(&self, product_id: &str) -> Option<&Product> {
        self.products.iter().find(|p| p.product_id == product_id)
    }

    /// Returns true if every requested product id is present.
    pub fn covers<S: AsRef<str>>(&self, product_ids: &[S]) -> bool {
        product_ids.iter().all(|id| self.get(id.as_ref()).is_some())
    }

    /// Products of the given kind among the requested ids, in request order.
    pub fn select<S: AsRef<str>>(&self, product_ids: &[S], kind: ProductKind) -> Vec<Product> {
        product_ids
            .iter()
            .filter_map(|id| self.get(id.as_ref()))
            .filter(|p| p.kind == kind)
            .cloned()
            .collect()
    }

    /// Merge freshly fetched products into this catalog, replacing by id.
    pub fn merge(&mut self, other: Catalog) {
        for product in other.products {
            match self
                .products
                .iter_mut()
                .find(|p| p.product_id == product.product_id)
            {
                Some(existing) => *existing = product,
                None => self.products.push(product),
            }
        }
    }
}
