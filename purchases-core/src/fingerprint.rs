//! Irreversible receipt fingerprints.
//!
//! The ledger only has to prove that a given purchase token was already
//! reported, so it stores SHA-256 digests of tokens instead of the tokens.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Lowercase hex SHA-256 digest of a purchase token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiptFingerprint(String);

impl ReceiptFingerprint {
    /// Fingerprint a purchase token.
    pub fn of_token(token: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Rehydrate a fingerprint read back from the store.
    pub fn from_stored(hex_digest: impl Into<String>) -> Self {
        Self(hex_digest.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ReceiptFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        // sha256("abc")
        assert_eq!(
            ReceiptFingerprint::of_token("abc").as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_fingerprint_does_not_contain_token() {
        let token = "purchase-token-with-secrets";
        let fp = ReceiptFingerprint::of_token(token);
        assert!(!fp.as_str().contains(token));
        assert_eq!(fp.as_str().len(), 64);
    }

    #[test]
    fn test_stored_roundtrip() {
        let fp = ReceiptFingerprint::of_token("tok1");
        let restored = ReceiptFingerprint::from_stored(fp.as_str().to_string());
        assert_eq!(fp, restored);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Property: fingerprinting is deterministic.
        #[test]
        fn prop_fingerprint_deterministic(token in ".*") {
            prop_assert_eq!(
                ReceiptFingerprint::of_token(&token),
                ReceiptFingerprint::of_token(&token)
            );
        }

        /// Property: distinct tokens produce distinct fingerprints.
        #[test]
        fn prop_distinct_tokens_distinct_fingerprints(a in ".{0,64}", b in ".{0,64}") {
            prop_assume!(a != b);
            prop_assert_ne!(ReceiptFingerprint::of_token(&a), ReceiptFingerprint::of_token(&b));
        }
    }
}
