//! Shared-access credentials.
//!
//! A [`Credential`] names the policy key (`key_name`), carries the shared key
//! material and identifies the namespace and entity the key grants access to.
//! Key material lives in a zeroizing buffer and never shows up in `Debug`
//! output or logs.

use crate::error::CredentialError;
use std::fmt;
use zeroize::Zeroizing;

#[cfg(test)]
#[path = "credential_tests.rs"]
mod tests;

/// Shared access key material
///
/// The key string is used as-is (its UTF-8 bytes) as the HMAC key; it is not
/// base64-decoded first.
#[derive(Clone)]
pub struct SharedKey {
    bytes: Zeroizing<Vec<u8>>,
}

impl SharedKey {
    /// Create key material from raw bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: Zeroizing::new(bytes.into()),
        }
    }

    /// Create key material from the key string
    pub fn from_string(value: String) -> Self {
        Self::new(value.into_bytes())
    }

    /// Expose the raw key bytes (only for immediate signing use)
    pub fn expose_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Check if key is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Get key length without exposing content
    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedKey")
            .field("length", &self.len())
            .field("value", &"[REDACTED]")
            .finish()
    }
}

/// Key name, key material and the entity scope they authorize
#[derive(Clone)]
pub struct Credential {
    key_name: String,
    shared_key: SharedKey,
    namespace: String,
    entity_path: String,
}

impl Credential {
    /// Create a credential, rejecting empty fields
    pub fn new(
        key_name: impl Into<String>,
        shared_key: SharedKey,
        namespace: impl Into<String>,
        entity_path: impl Into<String>,
    ) -> Result<Self, CredentialError> {
        let key_name = key_name.into();
        let namespace = namespace.into();
        let entity_path = entity_path.into();

        if key_name.is_empty() {
            return Err(CredentialError::EmptyKeyName);
        }
        if shared_key.is_empty() {
            return Err(CredentialError::EmptyKey);
        }
        if namespace.is_empty() || entity_path.is_empty() {
            return Err(CredentialError::EmptyResourceUri);
        }

        Ok(Self {
            key_name,
            shared_key,
            namespace,
            entity_path,
        })
    }

    /// Name of the shared access policy
    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    /// Key material
    pub fn shared_key(&self) -> &SharedKey {
        &self.shared_key
    }

    /// Broker namespace (first label of the endpoint host)
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Entity path the credential is scoped to
    pub fn entity_path(&self) -> &str {
        &self.entity_path
    }

    /// Endpoint host: `<namespace>.<broker_domain>`
    pub fn endpoint(&self, broker_domain: &str) -> String {
        format!("{}.{}", self.namespace, broker_domain)
    }

    /// Resource URI the token is signed for: `<namespace>.<broker_domain>/<entity_path>`
    pub fn resource_uri(&self, broker_domain: &str) -> String {
        format!("{}/{}", self.endpoint(broker_domain), self.entity_path)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("key_name", &self.key_name)
            .field("shared_key", &self.shared_key)
            .field("namespace", &self.namespace)
            .field("entity_path", &self.entity_path)
            .finish()
    }
}
