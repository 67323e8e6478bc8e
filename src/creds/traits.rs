use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::future::Future;
use tokio::sync::{mpsc, watch};
use zeroize::Zeroize;

use crate::creds::state::CredentialSecretState;
use crate::error::{BoxError, Result};

// ==============================================================================
// 1. Secret Change Feed (Kubernetes watch, consumed as a tagged-union stream)
// ==============================================================================

#[derive(Clone, Debug)]
pub enum SecretEvent {
    Added(Secret),
    Updated(Secret),
    Deleted,
}

impl SecretEvent {
    /// Overwrites the payload bytes carried by the event once the store has
    /// taken its own copy.
    pub fn scrub(&mut self) {
        if let SecretEvent::Added(secret) | SecretEvent::Updated(secret) = self {
            for value in secret.data.iter_mut().flat_map(|d| d.values_mut()) {
                value.0.zeroize();
            }
            for value in secret.string_data.iter_mut().flat_map(|d| d.values_mut()) {
                value.zeroize();
            }
        }
    }
}

#[async_trait]
pub trait SecretFeed: Send + Sync {
    /// Starts delivering events for one `(namespace, name)` Secret.
    /// The receiver is drained by a single task, so at most one store
    /// callback is ever in flight.
    async fn start(&mut self) -> Result<mpsc::Receiver<SecretEvent>>;

    async fn stop(&mut self);
}

// ==============================================================================
// 2. Credential State Stores (one per provider Secret)
// ==============================================================================

pub trait CredentialStore: Send + Sync + 'static {
    /// Provider credentials derived from the current state.
    type Credentials: Clone + Send + Sync + 'static;

    /// Callbacks run on the feed's task and must return quickly.
    fn on_add(&self, secret: &Secret);
    fn on_update(&self, secret: &Secret);
    fn on_delete(&self);

    /// Read-only view of the current state under a shared lock.
    fn snapshot(&self) -> CredentialSecretState;

    /// Rebuilds provider credentials from the current state. Never cached.
    fn derive(&self) -> Result<Self::Credentials>;

    /// Change generations; a bump means "rebuild your clients".
    fn subscribe(&self) -> watch::Receiver<u64>;

    /// Releases resources owned by the store (mirrored files, ...).
    fn shutdown(&self) {}

    fn apply(&self, event: &SecretEvent) {
        match event {
            SecretEvent::Added(secret) => self.on_add(secret),
            SecretEvent::Updated(secret) => self.on_update(secret),
            SecretEvent::Deleted => self.on_delete(),
        }
    }
}

// ==============================================================================
// 3. OAuth2-shaped Token Source
// ==============================================================================

/// Access token in the usual OAuth2 shape. The token value never shows up in
/// `Debug` output.
#[derive(Clone)]
pub struct AccessToken {
    pub access_token: SecretString,
    pub token_type: String,
    /// `None` means the token does not expire.
    pub expiry: Option<DateTime<Utc>>,
}

impl AccessToken {
    pub fn new(access_token: impl Into<String>, expiry: Option<DateTime<Utc>>) -> Self {
        Self {
            access_token: SecretString::new(access_token.into()),
            token_type: "Bearer".to_string(),
            expiry,
        }
    }

    pub fn secret(&self) -> &str {
        self.access_token.expose_secret()
    }

    /// A token is valid while it is non-empty and not past its expiry.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        if self.access_token.expose_secret().is_empty() {
            return false;
        }
        self.expiry.is_none_or(|expiry| now < expiry)
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("access_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("expiry", &self.expiry)
            .finish()
    }
}

#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> std::result::Result<AccessToken, BoxError>;
}

// ==============================================================================
// 4. SDK Client Factories
// ==============================================================================

/// Builds one SDK client of type `T` from provider credentials `C`.
#[async_trait]
pub trait ClientFactory<C, T>: Send + Sync
where
    C: Send + Sync + 'static,
    T: Send + 'static,
{
    async fn new_client(&self, credentials: &C) -> std::result::Result<T, BoxError>;
}

/// Any `Fn(C) -> impl Future<Output = Result<T, BoxError>>` is a factory.
#[async_trait]
impl<C, T, F, Fut> ClientFactory<C, T> for F
where
    C: Clone + Send + Sync + 'static,
    T: Send + 'static,
    F: Fn(C) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<T, BoxError>> + Send,
{
    async fn new_client(&self, credentials: &C) -> std::result::Result<T, BoxError> {
        (self)(credentials.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creds::secrets::test_support::secret_with;

    #[test]
    fn scrub_wipes_data_and_string_data() {
        let mut secret = secret_with("credentials", b"hunter2");
        secret.string_data = Some(std::collections::BTreeMap::from([(
            "config".to_string(),
            "region = us-east-1".to_string(),
        )]));
        let mut event = SecretEvent::Updated(secret);

        event.scrub();

        let SecretEvent::Updated(secret) = event else { unreachable!() };
        let data = secret.data.unwrap();
        let string_data = secret.string_data.unwrap();
        // Keys survive, values are zeroed and truncated.
        assert!(data["credentials"].0.is_empty());
        assert!(string_data["config"].is_empty());
    }

    #[test]
    fn token_validity_respects_expiry_and_emptiness() {
        let now = Utc::now();
        assert!(AccessToken::new("t", None).is_valid_at(now));
        assert!(AccessToken::new("t", Some(now + chrono::Duration::seconds(5))).is_valid_at(now));
        assert!(!AccessToken::new("t", Some(now)).is_valid_at(now));
        assert!(!AccessToken::new("", None).is_valid_at(now));
        assert!(!format!("{:?}", AccessToken::new("abc", None)).contains("abc"));
    }
}
