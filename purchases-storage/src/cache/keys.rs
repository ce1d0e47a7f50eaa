//! Installation-scoped key scheme.
//!
//! Every persisted key starts with `<namespace>.<api_key>`. A [`CacheKeys`]
//! can only be built from both parts, so no partition can be addressed
//! without naming the installation it belongs to.

use purchases_core::Identity;

const SEPARATOR: char = '.';
const IDENTITY_SUFFIX: &str = "new";
const TOKENS_SUFFIX: &str = "tokens";
const SUBSCRIBER_ATTRIBUTES_SUFFIX: &str = "subscriberAttributes";
const ATTRIBUTION_SUFFIX: &str = "attribution";

/// Key derivation for one installation.
///
/// # Layout
///
/// | Partition | Key |
/// |-----------|-----|
/// | legacy identity | `<ns>.<api_key>` |
/// | identity | `<ns>.<api_key>.new` |
/// | reported fingerprints | `<ns>.<api_key>.tokens` |
/// | subscriber attributes | `<ns>.<api_key>.subscriberAttributes` |
/// | entitlement snapshot | `<ns>.<api_key>.<identity>` |
/// | attribution | `<ns>.<api_key>.attribution.<user>.<network>` |
///
/// Snapshot keys hang off the legacy key so records written before the
/// identity key moved stay addressable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKeys {
    base: String,
}

impl CacheKeys {
    pub fn new(namespace: &str, api_key: &str) -> Self {
        Self {
            base: format!("{}{}{}", namespace, SEPARATOR, api_key),
        }
    }

    /// Prefix shared by every key of this installation.
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn legacy_identity_key(&self) -> String {
        self.base.clone()
    }

    pub fn identity_key(&self) -> String {
        self.derive_key(IDENTITY_SUFFIX)
    }

    pub fn tokens_key(&self) -> String {
        self.derive_key(TOKENS_SUFFIX)
    }

    pub fn subscriber_attributes_key(&self) -> String {
        self.derive_key(SUBSCRIBER_ATTRIBUTES_SUFFIX)
    }

    /// Per-user attribute key written by older installs.
    pub fn legacy_subscriber_attributes_prefix(&self) -> String {
        format!("{}{}", self.subscriber_attributes_key(), SEPARATOR)
    }

    pub fn snapshot_key(&self, identity: &Identity) -> String {
        self.snapshot_key_for(identity.as_str())
    }

    pub(crate) fn snapshot_key_for(&self, raw_identity: &str) -> String {
        self.derive_key(raw_identity)
    }

    pub fn attribution_key(&self, network: &str, user: &Identity) -> String {
        format!("{}{}", self.attribution_prefix(user), network)
    }

    /// Prefix covering every attribution network cached for `user`.
    pub fn attribution_prefix(&self, user: &Identity) -> String {
        format!(
            "{}{}{}{}",
            self.derive_key(ATTRIBUTION_SUFFIX),
            SEPARATOR,
            user.as_str(),
            SEPARATOR
        )
    }

    /// Namespace an ad hoc key under this installation.
    pub fn derive_key(&self, suffix: &str) -> String {
        format!("{}{}{}", self.base, SEPARATOR, suffix)
    }
}
