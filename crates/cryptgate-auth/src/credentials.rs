//! Client credential lookup.
//!
//! The gateway authenticates inbound requests against a set of credentials
//! registered at startup. The store is immutable for the lifetime of a
//! request; [`StaticCredentialProvider`] is the configuration-file-backed
//! implementation used in production and tests alike.

use std::collections::HashMap;

use crate::error::AuthError;

/// A registered client credential.
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    /// The secret access key.
    pub secret_key: String,
    /// Optional region binding; when set, the credential scope of a request
    /// signed with this key must name this region.
    pub region: Option<String>,
}

/// Trait for looking up client credentials by access key ID.
pub trait CredentialProvider: Send + Sync {
    /// Retrieve the credential record for the given access key ID.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::UnknownAccessKey`] if the access key ID is not
    /// recognized.
    fn get_credential(&self, access_key_id: &str) -> Result<CredentialRecord, AuthError>;
}

/// An in-memory credential provider backed by a `HashMap`.
///
/// Populated from configuration at startup and never mutated afterwards,
/// so lookups take no lock.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentialProvider {
    credentials: HashMap<String, CredentialRecord>,
}

impl StaticCredentialProvider {
    /// Create a provider from (access_key_id, record) pairs.
    pub fn new(credentials: impl IntoIterator<Item = (String, CredentialRecord)>) -> Self {
        Self {
            credentials: credentials.into_iter().collect(),
        }
    }

    /// Create a provider from plain (access_key_id, secret_key) pairs with
    /// no region binding.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        Self::new(pairs.into_iter().map(|(ak, sk)| {
            (
                ak,
                CredentialRecord {
                    secret_key: sk,
                    region: None,
                },
            )
        }))
    }

    /// The number of registered credentials.
    #[must_use]
    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    /// Whether the provider has no credentials at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn get_credential(&self, access_key_id: &str) -> Result<CredentialRecord, AuthError> {
        self.credentials
            .get(access_key_id)
            .cloned()
            .ok_or_else(|| AuthError::UnknownAccessKey(access_key_id.to_owned()))
    }
}
