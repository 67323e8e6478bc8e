// src/providers/aws.rs

use std::sync::Arc;

use crate::config::AgentConfig;
use crate::creds::coordinator::{RotationCoordinator, RotationReport};
use crate::creds::feed::KubeSecretFeed;
use crate::creds::handle::ClientHandle;
use crate::creds::mirrored::{AwsSessionOptions, MirroredSecretStore};
use crate::creds::traits::{ClientFactory, SecretFeed};
use crate::error::Result;

/// AWS side of the agent: the STS shared-config Secret is mirrored to disk and
/// every registered SDK client is rebuilt from a fresh session when it changes.
pub struct AwsCredentialsManager {
    coordinator: Arc<RotationCoordinator<MirroredSecretStore>>,
}

impl AwsCredentialsManager {
    /// `kube == None` means no API access: degraded mode.
    pub fn new(config: &AgentConfig, kube: Option<kube::Client>) -> Self {
        let feed = kube.map(|client| {
            Box::new(KubeSecretFeed::new(
                client,
                config.namespace.clone(),
                config.aws_secret_name.clone(),
            )) as Box<dyn SecretFeed>
        });
        Self::with_feed(config, feed)
    }

    pub fn with_feed(config: &AgentConfig, feed: Option<Box<dyn SecretFeed>>) -> Self {
        let store = Arc::new(MirroredSecretStore::new(
            config.namespace.clone(),
            config.aws_secret_name.clone(),
            config.data_key.clone(),
            config.aws_mirror_path.clone(),
        ));
        Self {
            coordinator: Arc::new(RotationCoordinator::new(
                "aws",
                store,
                feed,
                config.drain_timeout,
            )),
        }
    }

    /// Session options built from the current state, never cached.
    pub fn new_session(&self) -> Result<AwsSessionOptions> {
        self.coordinator.store().new_session()
    }

    pub fn register_client<T, F>(&self, name: &str, factory: F) -> Arc<ClientHandle<T>>
    where
        T: Clone + Send + Sync + 'static,
        F: ClientFactory<AwsSessionOptions, T> + 'static,
    {
        self.coordinator.register(name, factory)
    }

    pub fn coordinator(&self) -> &Arc<RotationCoordinator<MirroredSecretStore>> {
        &self.coordinator
    }

    pub async fn update_clients(&self) -> RotationReport {
        self.coordinator.update_clients().await
    }

    pub async fn start(&self) {
        self.coordinator.start().await;
    }

    /// Also removes the mirrored credentials file.
    pub async fn stop(&self) {
        self.coordinator.stop().await;
    }
}
