//! Identity types for purchase-state sync

use crate::error::ConfigError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Prefix marking generated (anonymous) app user ids.
///
/// Persisted identities are plain strings, so the kind has to be recoverable
/// from the string itself after a restart.
pub const ANONYMOUS_ID_PREFIX: &str = "$RCAnonymousID:";

/// Key segments holding installation-wide records.
///
/// Entitlement snapshots are keyed `<ns>.<api_key>.<app_user_id>`, so an app
/// user id equal to one of these, or nested under one with a `.`, would
/// address those records instead of its own snapshot.
pub const RESERVED_APP_USER_IDS: &[&str] = &["new", "tokens", "subscriberAttributes", "attribution"];

/// The user an installation is currently acting for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Generate a fresh anonymous identity.
    pub fn new_anonymous() -> Self {
        Self(format!("{}{}", ANONYMOUS_ID_PREFIX, Uuid::now_v7().simple()))
    }

    /// Validate a caller-supplied app user id.
    ///
    /// # Errors
    ///
    /// Blank ids and [`RESERVED_APP_USER_IDS`] are rejected.
    pub fn try_new(app_user_id: impl Into<String>) -> Result<Self, ConfigError> {
        let id = app_user_id.into();
        if id.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "app_user_id",
                reason: "must not be blank".to_string(),
            });
        }
        if let Some(reserved) = RESERVED_APP_USER_IDS
            .iter()
            .find(|r| id == **r || id.strip_prefix(**r).is_some_and(|rest| rest.starts_with('.')))
        {
            return Err(ConfigError::InvalidValue {
                field: "app_user_id",
                reason: format!("'{}' is reserved", reserved),
            });
        }
        Ok(Self(id))
    }

    /// Wrap a caller-supplied (or previously persisted) app user id.
    ///
    /// Returns `None` wherever [`Self::try_new`] fails.
    pub fn parse(app_user_id: impl Into<String>) -> Option<Self> {
        Self::try_new(app_user_id).ok()
    }

    /// Returns true if this identity was generated rather than supplied.
    pub fn is_anonymous(&self) -> bool {
        self.0.starts_with(ANONYMOUS_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
