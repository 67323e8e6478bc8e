// src/creds/feed.rs

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::watcher::Event;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::creds::traits::{SecretEvent, SecretFeed};
use crate::error::{Result, RotationError};

const FEED_BUFFER: usize = 16;

/// Obtains a Kubernetes client from the in-cluster service account, or from a
/// local kubeconfig when running outside a cluster. Failure means the agent
/// runs in degraded mode.
pub async fn connect_kube() -> Result<Client> {
    Client::try_default()
        .await
        .map_err(|e| RotationError::FeedUnavailable(format!("no Kubernetes API access: {e}")))
}

// ==============================================================================
// 1. Kubernetes watch feed
// ==============================================================================

/// Turns raw watcher events for a single named object into add/update/delete.
#[derive(Debug, Default)]
struct WatchTracker {
    seen: bool,
    seen_in_relist: bool,
}

impl WatchTracker {
    fn observe(&mut self, event: Event<Secret>) -> Option<SecretEvent> {
        match event {
            Event::Apply(secret) => Some(self.applied(secret)),
            Event::InitApply(secret) => {
                self.seen_in_relist = true;
                Some(self.applied(secret))
            }
            Event::Delete(_) => {
                self.seen = false;
                Some(SecretEvent::Deleted)
            }
            Event::Init => {
                self.seen_in_relist = false;
                None
            }
            // The object vanished while we were not watching.
            Event::InitDone if self.seen && !self.seen_in_relist => {
                self.seen = false;
                Some(SecretEvent::Deleted)
            }
            Event::InitDone => None,
        }
    }

    fn applied(&mut self, secret: Secret) -> SecretEvent {
        if std::mem::replace(&mut self.seen, true) {
            SecretEvent::Updated(secret)
        } else {
            SecretEvent::Added(secret)
        }
    }
}

/// Watches one Secret through the Kubernetes API.
pub struct KubeSecretFeed {
    client: Client,
    namespace: String,
    name: String,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl KubeSecretFeed {
    pub fn new(client: Client, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            name: name.into(),
            shutdown: CancellationToken::new(),
            task: None,
        }
    }
}

#[async_trait]
impl SecretFeed for KubeSecretFeed {
    async fn start(&mut self) -> Result<mpsc::Receiver<SecretEvent>> {
        if self.task.is_some() {
            return Err(RotationError::FeedUnavailable(format!(
                "watch for {}/{} already running",
                self.namespace, self.name
            )));
        }

        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let config = watcher::Config::default().fields(&format!("metadata.name={}", self.name));
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let shutdown = self.shutdown.clone();
        let namespace = self.namespace.clone();
        let name = self.name.clone();

        self.task = Some(tokio::spawn(async move {
            let stream = watcher(api, config).default_backoff();
            tokio::pin!(stream);
            let mut tracker = WatchTracker::default();

            loop {
                let next = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(event)) => {
                        let Some(event) = tracker.observe(event) else { continue };
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        // The backoff layer retries; nothing to do but report.
                        tracing::warn!(namespace = %namespace, secret = %name, error = %e, "secret watch error");
                    }
                    None => break,
                }
            }
            tracing::debug!(namespace = %namespace, secret = %name, "secret watch stopped");
        }));

        tracing::info!(namespace = %self.namespace, secret = %self.name, "secret watch started");
        Ok(rx)
    }

    async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "secret watch task ended abnormally");
            }
        }
    }
}

// ==============================================================================
// 2. In-process feed (embedding & tests)
// ==============================================================================

/// Feed driven by hand through a [`SecretFeedSender`].
pub struct ChannelSecretFeed {
    rx: Option<mpsc::Receiver<SecretEvent>>,
}

#[derive(Clone, Debug)]
pub struct SecretFeedSender {
    tx: mpsc::Sender<SecretEvent>,
}

impl ChannelSecretFeed {
    pub fn new() -> (Self, SecretFeedSender) {
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        (Self { rx: Some(rx) }, SecretFeedSender { tx })
    }
}

#[async_trait]
impl SecretFeed for ChannelSecretFeed {
    async fn start(&mut self) -> Result<mpsc::Receiver<SecretEvent>> {
        self.rx
            .take()
            .ok_or_else(|| RotationError::FeedUnavailable("channel feed already started".into()))
    }

    async fn stop(&mut self) {}
}

impl SecretFeedSender {
    pub async fn send(&self, event: SecretEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| RotationError::FeedUnavailable("feed consumer has stopped".into()))
    }

    pub async fn added(&self, secret: Secret) -> Result<()> {
        self.send(SecretEvent::Added(secret)).await
    }

    pub async fn updated(&self, secret: Secret) -> Result<()> {
        self.send(SecretEvent::Updated(secret)).await
    }

    pub async fn deleted(&self) -> Result<()> {
        self.send(SecretEvent::Deleted).await
    }
}
