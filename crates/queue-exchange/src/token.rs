//! Time-bounded shared access signature (SAS) tokens.
//!
//! A token grants delegated access to one resource URI until its expiry,
//! without handing out the long-lived shared key. Signing works as follows:
//!
//! 1. `expiry = now + validity` in whole seconds since the Unix epoch
//! 2. `string_to_sign = percent_encode(resource_uri) + "\n" + expiry`
//! 3. `signature = base64(HMAC-SHA256(shared_key, string_to_sign))`
//! 4. The token is `SharedAccessSignature sr=..&sig=..&se=..&skn=..` with every
//!    field percent-encoded independently
//!
//! The same RFC 3986 encoder is used for the signing input and for the `sr`
//! field so the broker recomputes exactly the bytes that were signed.
//!
//! # Example
//!
//! ```rust
//! use queue_exchange::credential::SharedKey;
//! use queue_exchange::message::Timestamp;
//! use queue_exchange::token::{issue_token, DEFAULT_TOKEN_VALIDITY};
//!
//! let now = Timestamp::from_epoch_seconds(1_700_000_000).unwrap();
//! let key = SharedKey::from_string("my-key".to_string());
//! let token = issue_token(
//!     "contoso.servicebus.windows.net/orders",
//!     "RootManageSharedAccessKey",
//!     &key,
//!     DEFAULT_TOKEN_VALIDITY,
//!     now,
//! )
//! .unwrap();
//!
//! assert_eq!(token.expiry(), 1_700_000_000 + 604_800);
//! assert!(token.to_string().starts_with("SharedAccessSignature sr="));
//! ```

use crate::clock::Clock;
use crate::credential::{Credential, SharedKey};
use crate::error::CredentialError;
use crate::message::Timestamp;
use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
#[path = "token_tests.rs"]
mod tests;

type HmacSha256 = Hmac<Sha256>;

/// Authorization scheme prefix of the token wire format
pub const TOKEN_SCHEME: &str = "SharedAccessSignature";

/// Default validity window: seven days from issuance
pub const DEFAULT_TOKEN_VALIDITY: Duration = Duration::from_secs(60 * 60 * 24 * 7);

/// Issue a signed token for `resource_uri`.
///
/// Deterministic: identical inputs, including `now`, always produce
/// byte-identical tokens.
///
/// # Errors
///
/// Returns `CredentialError` if any input is empty, the validity is shorter
/// than one second, the expiry overflows, or the HMAC cannot be initialised.
/// No partially signed token is ever returned.
pub fn issue_token(
    resource_uri: &str,
    key_name: &str,
    shared_key: &SharedKey,
    validity: Duration,
    now: Timestamp,
) -> Result<SignedToken, CredentialError> {
    if resource_uri.is_empty() {
        return Err(CredentialError::EmptyResourceUri);
    }
    if key_name.is_empty() {
        return Err(CredentialError::EmptyKeyName);
    }
    if shared_key.is_empty() {
        return Err(CredentialError::EmptyKey);
    }

    let validity_secs = validity.as_secs();
    if validity_secs == 0 {
        return Err(CredentialError::InvalidValidity);
    }

    let expiry = i64::try_from(validity_secs)
        .ok()
        .and_then(|secs| now.epoch_seconds().checked_add(secs))
        .filter(|expiry| Timestamp::from_epoch_seconds(*expiry).is_some())
        .ok_or(CredentialError::ExpiryOverflow { validity_secs })?;

    let signature = compute_signature(resource_uri, expiry, shared_key)?;

    Ok(SignedToken {
        resource_uri: resource_uri.to_string(),
        signature,
        expiry,
        key_name: key_name.to_string(),
    })
}

/// Compute `base64(HMAC-SHA256(key, percent_encode(resource) + "\n" + expiry))`
fn compute_signature(
    resource_uri: &str,
    expiry: i64,
    shared_key: &SharedKey,
) -> Result<String, CredentialError> {
    let string_to_sign = format!("{}\n{}", percent_encode(resource_uri), expiry);

    let mut mac = HmacSha256::new_from_slice(shared_key.expose_bytes()).map_err(|e| {
        CredentialError::SigningFailed {
            message: e.to_string(),
        }
    })?;
    mac.update(string_to_sign.as_bytes());

    Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

/// The single percent-encoding scheme used for signing and for the wire format
pub fn percent_encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

fn percent_decode(field: &str, value: &str) -> Result<String, CredentialError> {
    urlencoding::decode(value)
        .map(|decoded| decoded.into_owned())
        .map_err(|e| CredentialError::Encoding {
            field: field.to_string(),
            message: e.to_string(),
        })
}

// ============================================================================
// Signed Token
// ============================================================================

/// A signed, time-bounded access token
///
/// Tokens are immutable. A fresh token is issued for every connection build and
/// discarded on reconnect.
#[derive(Clone, PartialEq, Eq)]
pub struct SignedToken {
    resource_uri: String,
    signature: String,
    expiry: i64,
    key_name: String,
}

impl SignedToken {
    /// The signed resource URI (decoded)
    pub fn resource_uri(&self) -> &str {
        &self.resource_uri
    }

    /// The signed resource URI as it appears on the wire
    pub fn encoded_resource_uri(&self) -> String {
        percent_encode(&self.resource_uri)
    }

    /// Base64 HMAC-SHA256 signature
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Expiry in whole seconds since the Unix epoch
    pub fn expiry(&self) -> i64 {
        self.expiry
    }

    /// Name of the policy key that signed the token
    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    /// Expiry as a timestamp
    pub fn expires_at(&self) -> Option<Timestamp> {
        Timestamp::from_epoch_seconds(self.expiry)
    }

    /// A token is invalid once `now > expiry`
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        now.epoch_seconds() > self.expiry
    }

    /// Check if the token expires within `margin` of `now`
    pub fn expires_soon(&self, margin: Duration, now: Timestamp) -> bool {
        let margin_secs = i64::try_from(margin.as_secs()).unwrap_or(i64::MAX);
        now.epoch_seconds().saturating_add(margin_secs) >= self.expiry
    }

    /// Whether the token covers `resource_uri` (same resource or a sub-path of it)
    pub fn covers(&self, resource_uri: &str) -> bool {
        let scope = self.resource_uri.trim_end_matches('/');
        resource_uri == scope
            || resource_uri
                .strip_prefix(scope)
                .is_some_and(|rest| rest.starts_with('/'))
    }

    /// Verify the signature against `shared_key` and the expiry against `now`
    ///
    /// The signature comparison runs in constant time.
    pub fn verify(&self, shared_key: &SharedKey, now: Timestamp) -> Result<(), CredentialError> {
        use subtle::ConstantTimeEq;

        let expected = compute_signature(&self.resource_uri, self.expiry, shared_key)?;
        let matches = expected.len() == self.signature.len()
            && bool::from(expected.as_bytes().ct_eq(self.signature.as_bytes()));
        if !matches {
            return Err(CredentialError::SignatureMismatch);
        }

        if self.is_expired_at(now) {
            return Err(CredentialError::Expired {
                resource: self.resource_uri.clone(),
                expired_at: self.expiry,
            });
        }

        Ok(())
    }

    /// Render the token wire format
    pub fn to_wire(&self) -> String {
        format!(
            "{} sr={}&sig={}&se={}&skn={}",
            TOKEN_SCHEME,
            percent_encode(&self.resource_uri),
            percent_encode(&self.signature),
            self.expiry,
            percent_encode(&self.key_name),
        )
    }

    /// Parse the token wire format
    pub fn parse(value: &str) -> Result<Self, CredentialError> {
        let fields = value
            .trim()
            .strip_prefix(TOKEN_SCHEME)
            .and_then(|rest| rest.strip_prefix(' '))
            .ok_or_else(|| CredentialError::MalformedToken {
                message: format!("token must start with '{} '", TOKEN_SCHEME),
            })?;

        let mut resource_uri = None;
        let mut signature = None;
        let mut expiry = None;
        let mut key_name = None;

        for pair in fields.split('&') {
            let (name, raw) = pair
                .split_once('=')
                .ok_or_else(|| CredentialError::MalformedToken {
                    message: format!("field '{}' has no value", pair),
                })?;

            let slot = match name {
                "sr" => &mut resource_uri,
                "sig" => &mut signature,
                "se" => &mut expiry,
                "skn" => &mut key_name,
                // Unknown fields are ignored for forward compatibility
                _ => continue,
            };
            if slot.is_some() {
                return Err(CredentialError::MalformedToken {
                    message: format!("duplicate field '{}'", name),
                });
            }
            *slot = Some(percent_decode(name, raw)?);
        }

        let missing = |field: &str| CredentialError::MalformedToken {
            message: format!("missing field '{}'", field),
        };

        let expiry = expiry
            .ok_or_else(|| missing("se"))?
            .parse::<i64>()
            .map_err(|e| CredentialError::MalformedToken {
                message: format!("invalid expiry: {}", e),
            })?;

        Ok(Self {
            resource_uri: resource_uri.ok_or_else(|| missing("sr"))?,
            signature: signature.ok_or_else(|| missing("sig"))?,
            expiry,
            key_name: key_name.ok_or_else(|| missing("skn"))?,
        })
    }
}

impl fmt::Display for SignedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

impl FromStr for SignedToken {
    type Err = CredentialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// A token is a bearer credential; keep the signature out of logs.
impl fmt::Debug for SignedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedToken")
            .field("resource_uri", &self.resource_uri)
            .field("signature", &"[REDACTED]")
            .field("expiry", &self.expiry)
            .field("key_name", &self.key_name)
            .finish()
    }
}

// ============================================================================
// Token Issuer
// ============================================================================

/// Issues tokens against an injected clock with a fixed validity window
#[derive(Debug, Clone)]
pub struct TokenIssuer {
    clock: Arc<dyn Clock>,
    validity: Duration,
}

impl TokenIssuer {
    /// Create an issuer using the default seven-day validity
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            validity: DEFAULT_TOKEN_VALIDITY,
        }
    }

    /// Override the validity window
    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    /// Configured validity window
    pub fn validity(&self) -> Duration {
        self.validity
    }

    /// Issue a token for an explicit resource URI
    pub fn issue(
        &self,
        resource_uri: &str,
        key_name: &str,
        shared_key: &SharedKey,
    ) -> Result<SignedToken, CredentialError> {
        issue_token(
            resource_uri,
            key_name,
            shared_key,
            self.validity,
            self.clock.now(),
        )
    }

    /// Issue a token for the resource a credential is scoped to
    pub fn issue_for(
        &self,
        credential: &Credential,
        broker_domain: &str,
    ) -> Result<SignedToken, CredentialError> {
        self.issue(
            &credential.resource_uri(broker_domain),
            credential.key_name(),
            credential.shared_key(),
        )
    }
}
