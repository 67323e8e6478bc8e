// src/creds/coordinator.rs

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::creds::handle::ClientHandle;
use crate::creds::state::ChangeNotifier;
use crate::creds::token_cache::TokenCache;
use crate::creds::traits::{ClientFactory, CredentialStore, SecretEvent, SecretFeed};
use crate::error::{Result, RotationError};

// ==============================================================================
// 1. Type-erased client bindings
// ==============================================================================

/// One managed handle plus the factory that rebuilds it, with the client type
/// erased so handles of different SDKs can share a coordinator.
#[async_trait]
trait ManagedClient<C>: Send + Sync {
    fn name(&self) -> &str;

    async fn rebuild(
        &self,
        credentials: &C,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

struct Binding<C, T>
where
    C: Send + Sync + 'static,
    T: Send + 'static,
{
    handle: Arc<ClientHandle<T>>,
    factory: Arc<dyn ClientFactory<C, T>>,
}

#[async_trait]
impl<C, T> ManagedClient<C> for Binding<C, T>
where
    C: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        self.handle.name()
    }

    async fn rebuild(
        &self,
        credentials: &C,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let factory = Arc::clone(&self.factory);
        let credentials = credentials.clone();
        self.handle
            .replace_within(timeout, cancel, |_| async move {
                factory.new_client(&credentials).await
            })
            .await
    }
}

// ==============================================================================
// 2. Coordinator
// ==============================================================================

/// Outcome of one `update_clients` pass.
#[derive(Debug, Default)]
pub struct RotationReport {
    pub rebuilt: Vec<String>,
    /// A derivation failure is shared by every client it held back.
    pub failed: Vec<(String, Arc<RotationError>)>,
}

impl RotationReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Wires a credential store's change notifications to token invalidation and
/// to a hot swap of every managed client.
///
/// `start`/`stop` must not race each other; callers serialize them.
pub struct RotationCoordinator<S: CredentialStore> {
    label: String,
    store: Arc<S>,
    token_cache: Option<Arc<TokenCache>>,
    clients: RwLock<Vec<Arc<dyn ManagedClient<S::Credentials>>>>,
    feed: AsyncMutex<Option<Box<dyn SecretFeed>>>,
    drain_timeout: Duration,
    rotations: ChangeNotifier,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: CredentialStore> RotationCoordinator<S> {
    /// `feed == None` is degraded mode: no Secret is watched and every
    /// derivation resolves to the ambient default chain.
    pub fn new(
        label: impl Into<String>,
        store: Arc<S>,
        feed: Option<Box<dyn SecretFeed>>,
        drain_timeout: Duration,
    ) -> Self {
        let label = label.into();
        if feed.is_none() {
            tracing::error!(
                provider = %label,
                "no secret feed available, running in degraded mode with default credentials"
            );
        }
        Self {
            label,
            store,
            token_cache: None,
            clients: RwLock::new(Vec::new()),
            feed: AsyncMutex::new(feed),
            drain_timeout,
            rotations: ChangeNotifier::new(),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_token_cache(mut self, cache: Arc<TokenCache>) -> Self {
        self.token_cache = Some(cache);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn token_cache(&self) -> Option<&Arc<TokenCache>> {
        self.token_cache.as_ref()
    }

    /// Creates an uninitialized handle rebuilt by `factory` on every rotation.
    pub fn register<T, F>(&self, name: impl Into<String>, factory: F) -> Arc<ClientHandle<T>>
    where
        T: Clone + Send + Sync + 'static,
        F: ClientFactory<S::Credentials, T> + 'static,
    {
        let handle = Arc::new(ClientHandle::uninitialized(name));
        self.manage(Arc::clone(&handle), factory);
        handle
    }

    /// Puts an existing handle under management.
    pub fn manage<T, F>(&self, handle: Arc<ClientHandle<T>>, factory: F)
    where
        T: Clone + Send + Sync + 'static,
        F: ClientFactory<S::Credentials, T> + 'static,
    {
        let binding: Arc<dyn ManagedClient<S::Credentials>> = Arc::new(Binding {
            handle,
            factory: Arc::new(factory),
        });
        self.clients.write().push(binding);
    }

    /// Completed `update_clients` passes. Useful to wait for a rotation.
    pub fn subscribe_rotations(&self) -> watch::Receiver<u64> {
        self.rotations.subscribe()
    }

    /// Derives fresh credentials and replaces every managed client with one
    /// built from them. A failing client does not stop the others.
    pub async fn update_clients(&self) -> RotationReport {
        let mut report = RotationReport::default();

        let credentials = match self.store.derive() {
            Ok(credentials) => credentials,
            Err(e) => {
                tracing::error!(provider = %self.label, error = %e, "credential derivation failed, keeping current clients");
                let e = Arc::new(e);
                let clients = self.clients.read().clone();
                report
                    .failed
                    .extend(clients.iter().map(|c| (c.name().to_string(), Arc::clone(&e))));
                self.rotations.notify();
                return report;
            }
        };

        let clients = self.clients.read().clone();
        for client in clients {
            match client
                .rebuild(&credentials, self.drain_timeout, &self.shutdown)
                .await
            {
                Ok(()) => report.rebuilt.push(client.name().to_string()),
                Err(e) => {
                    tracing::warn!(provider = %self.label, client = %client.name(), error = %e, "client rebuild failed");
                    report.failed.push((client.name().to_string(), Arc::new(e)));
                }
            }
        }

        tracing::info!(
            provider = %self.label,
            rebuilt = report.rebuilt.len(),
            failed = report.failed.len(),
            "clients updated"
        );
        self.rotations.notify();
        report
    }

    async fn on_credentials_changed(&self) {
        if let Some(cache) = &self.token_cache {
            cache.invalidate().await;
        }
        self.update_clients().await;
    }
}

impl<S: CredentialStore> RotationCoordinator<S> {
    /// Populates the managed clients once, then starts the Secret feed and the
    /// rotation loop. A feed that fails to start degrades to default
    /// credentials instead of failing.
    pub async fn start(self: &Arc<Self>) {
        let changes = self.store.subscribe();
        self.update_clients().await;

        let mut tasks = Vec::with_capacity(2);
        if let Some(feed) = self.feed.lock().await.as_mut() {
            match feed.start().await {
                Ok(events) => tasks.push(self.spawn_dispatch(events)),
                Err(e) => tracing::error!(
                    provider = %self.label,
                    error = %e,
                    "secret feed failed to start, running in degraded mode with default credentials"
                ),
            }
        }
        tasks.push(self.spawn_rotation_loop(changes));

        self.tasks.lock().extend(tasks);
        tracing::info!(provider = %self.label, "credential rotation started");
    }

    /// Stops the feed and the loops, then lets the store release what it owns.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        if let Some(feed) = self.feed.lock().await.as_mut() {
            feed.stop().await;
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(provider = %self.label, error = %e, "rotation task ended abnormally");
            }
        }

        let store = Arc::clone(&self.store);
        if let Err(e) = tokio::task::spawn_blocking(move || store.shutdown()).await {
            tracing::warn!(provider = %self.label, error = %e, "store shutdown panicked");
        }
        tracing::info!(provider = %self.label, "credential rotation stopped");
    }

    /// Single consumer of the feed: store callbacks never overlap.
    fn spawn_dispatch(&self, mut events: mpsc::Receiver<SecretEvent>) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                let Some(mut event) = event else { break };
                // Stores may touch the filesystem; keep that off the async workers.
                // Awaiting here keeps a single callback in flight.
                let store = Arc::clone(&store);
                let applied = tokio::task::spawn_blocking(move || {
                    store.apply(&event);
                    event.scrub();
                })
                .await;
                if let Err(e) = applied {
                    tracing::error!(error = %e, "secret event callback panicked");
                }
            }
        })
    }

    fn spawn_rotation_loop(self: &Arc<Self>, mut changes: watch::Receiver<u64>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let generation = *changes.borrow_and_update();
                tracing::debug!(provider = %this.label, generation, "credentials changed, rotating clients");
                this.on_credentials_changed().await;
            }
        })
    }
}
