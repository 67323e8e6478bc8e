// src/providers/gcp.rs

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::AgentConfig;
use crate::creds::coordinator::{RotationCoordinator, RotationReport};
use crate::creds::diffed::{DiffedSecretStore, GoogleCredentials};
use crate::creds::feed::KubeSecretFeed;
use crate::creds::handle::ClientHandle;
use crate::creds::token_cache::TokenCache;
use crate::creds::traits::{AccessToken, ClientFactory, CredentialStore, SecretFeed, TokenSource};
use crate::error::{BoxError, Result};

/// Exchanges Google credentials for an access token (STS / IAM credentials
/// endpoint). Supplied by whoever owns the HTTP transport.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange(&self, credentials: &GoogleCredentials) -> std::result::Result<AccessToken, BoxError>;
}

/// Upstream token producer for the cache: derives fresh credentials from the
/// store on every fetch, so a rotated Secret is picked up by the next refresh.
pub struct CredentialsTokenSource {
    store: Arc<DiffedSecretStore>,
    exchanger: Arc<dyn TokenExchanger>,
}

impl CredentialsTokenSource {
    pub fn new(store: Arc<DiffedSecretStore>, exchanger: Arc<dyn TokenExchanger>) -> Self {
        Self { store, exchanger }
    }
}

#[async_trait]
impl TokenSource for CredentialsTokenSource {
    async fn token(&self) -> std::result::Result<AccessToken, BoxError> {
        let credentials = self.store.derive()?;
        self.exchanger.exchange(&credentials).await
    }
}

/// Google side of the agent: credentials JSON kept in memory, diffed on every
/// event, with a shared token cache invalidated on change.
pub struct GcpCredentialsManager {
    coordinator: Arc<RotationCoordinator<DiffedSecretStore>>,
}

impl GcpCredentialsManager {
    /// `kube == None` means no API access: degraded mode. Without an
    /// exchanger no token cache is maintained.
    pub fn new(
        config: &AgentConfig,
        kube: Option<kube::Client>,
        exchanger: Option<Arc<dyn TokenExchanger>>,
    ) -> Self {
        let feed = kube.map(|client| {
            Box::new(KubeSecretFeed::new(
                client,
                config.namespace.clone(),
                config.gcp_secret_name.clone(),
            )) as Box<dyn SecretFeed>
        });
        Self::with_feed(config, feed, exchanger)
    }

    pub fn with_feed(
        config: &AgentConfig,
        feed: Option<Box<dyn SecretFeed>>,
        exchanger: Option<Arc<dyn TokenExchanger>>,
    ) -> Self {
        let store = Arc::new(DiffedSecretStore::new(
            config.namespace.clone(),
            config.gcp_secret_name.clone(),
            config.data_key.clone(),
        ));
        let mut coordinator =
            RotationCoordinator::new("gcp", Arc::clone(&store), feed, config.drain_timeout);
        if let Some(exchanger) = exchanger {
            let upstream = Arc::new(CredentialsTokenSource::new(store, exchanger));
            coordinator = coordinator.with_token_cache(Arc::new(TokenCache::new(upstream)));
        }
        Self {
            coordinator: Arc::new(coordinator),
        }
    }

    pub fn get_credentials(&self) -> Result<GoogleCredentials> {
        self.coordinator.store().get_credentials()
    }

    /// Cached token source, present when an exchanger was supplied.
    pub fn token_source(&self) -> Option<Arc<TokenCache>> {
        self.coordinator.token_cache().cloned()
    }

    pub fn register_client<T, F>(&self, name: &str, factory: F) -> Arc<ClientHandle<T>>
    where
        T: Clone + Send + Sync + 'static,
        F: ClientFactory<GoogleCredentials, T> + 'static,
    {
        self.coordinator.register(name, factory)
    }

    pub fn coordinator(&self) -> &Arc<RotationCoordinator<DiffedSecretStore>> {
        &self.coordinator
    }

    pub async fn update_clients(&self) -> RotationReport {
        self.coordinator.update_clients().await
    }

    pub async fn start(&self) {
        self.coordinator.start().await;
    }

    pub async fn stop(&self) {
        self.coordinator.stop().await;
    }
}
