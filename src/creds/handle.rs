// src/creds/handle.rs

use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::error::{BoxError, Result, RotationError};

/// Borrow counter shared between a handle and its outstanding leases.
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    drained: Notify,
}

impl InFlight {
    fn acquire(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    fn current(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

/// Owns one live SDK client and hands out leases on it.
///
/// `borrow` and `replace` serialize on the same lock. A pending `replace`
/// holds that lock while it waits for outstanding leases to drop, so new
/// borrowers queue behind it instead of picking up a client that is about to
/// be swapped out. A borrower therefore never uses a client concurrently with
/// that client's replacement.
pub struct ClientHandle<T> {
    name: String,
    client: Mutex<Option<T>>,
    in_flight: Arc<InFlight>,
}

impl<T> ClientHandle<T>
where
    T: Clone + Send,
{
    /// Handle with no client yet; populated by a later `replace`.
    pub fn uninitialized(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client: Mutex::new(None),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn with_client(name: impl Into<String>, client: T) -> Self {
        Self {
            name: name.into(),
            client: Mutex::new(Some(client)),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Builds the first client right away when credentials are already known.
    pub async fn connect<F, Fut>(name: impl Into<String>, build: F) -> Result<Self>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = std::result::Result<T, BoxError>>,
    {
        let name = name.into();
        let client = build(CancellationToken::new())
            .await
            .map_err(|source| RotationError::ClientBuild {
                client: name.clone(),
                source,
            })?;
        Ok(Self::with_client(name, client))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of leases not yet released.
    pub fn in_flight(&self) -> usize {
        self.in_flight.current()
    }

    pub async fn is_initialized(&self) -> bool {
        self.client.lock().await.is_some()
    }

    /// Leases the current client. The lease releases itself on drop.
    pub async fn borrow(&self) -> Result<Lease<T>> {
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or(RotationError::NotInitialized)?.clone();
        self.in_flight.acquire();
        drop(guard);

        Ok(Lease {
            client,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// Swaps in a client produced by `build` once every outstanding lease has
    /// been released. Cancelling `cancel` during the drain aborts the swap and
    /// leaves the current client in place.
    pub async fn replace<F, Fut>(&self, cancel: &CancellationToken, build: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = std::result::Result<T, BoxError>>,
    {
        self.replace_inner(cancel, None, build).await
    }

    /// `replace` with an upper bound on the drain-wait.
    pub async fn replace_within<F, Fut>(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
        build: F,
    ) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = std::result::Result<T, BoxError>>,
    {
        self.replace_inner(cancel, Some(timeout), build).await
    }

    async fn replace_inner<F, Fut>(
        &self,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
        build: F,
    ) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = std::result::Result<T, BoxError>>,
    {
        // Held until the swap is done: new borrowers wait here.
        let mut guard = self.client.lock().await;

        self.drain(cancel, timeout).await?;

        let next = build(cancel.clone())
            .await
            .map_err(|source| RotationError::ClientBuild {
                client: self.name.clone(),
                source,
            })?;
        *guard = Some(next);

        tracing::debug!(client = %self.name, "client replaced");
        Ok(())
    }

    async fn drain(&self, cancel: &CancellationToken, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| (t, tokio::time::Instant::now() + t));

        loop {
            // Register for the wake-up before reading the count so a release
            // landing in between is not missed.
            let notified = self.in_flight.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let outstanding = self.in_flight.current();
            if outstanding == 0 {
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(RotationError::DrainCancelled {
                    in_flight: outstanding,
                });
            }

            tracing::debug!(client = %self.name, in_flight = outstanding, "waiting for borrowers to release");

            match deadline {
                Some((timeout, at)) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = cancel.cancelled() => {
                            return Err(RotationError::DrainCancelled { in_flight: self.in_flight.current() });
                        }
                        _ = tokio::time::sleep_until(at) => {
                            return Err(RotationError::DrainTimeout { timeout });
                        }
                    }
                }
                None => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = cancel.cancelled() => {
                            return Err(RotationError::DrainCancelled { in_flight: self.in_flight.current() });
                        }
                    }
                }
            }
        }
    }
}

impl<T> fmt::Debug for ClientHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("name", &self.name)
            .field("in_flight", &self.in_flight.current())
            .finish_non_exhaustive()
    }
}

/// A borrowed client. Dropping it (or calling `release`) decrements the
/// handle's in-flight count.
pub struct Lease<T> {
    client: T,
    in_flight: Arc<InFlight>,
}

impl<T> Lease<T> {
    pub fn release(self) {
        drop(self);
    }
}

impl<T> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.client
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        self.in_flight.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_client(value: &'static str) -> std::result::Result<String, BoxError> {
        Ok(value.to_string())
    }

    #[tokio::test]
    async fn borrow_before_initialization_fails() {
        let handle: ClientHandle<String> = ClientHandle::uninitialized("storage");
        assert!(matches!(
            handle.borrow().await,
            Err(RotationError::NotInitialized)
        ));
        assert_eq!(handle.in_flight(), 0);

        handle
            .replace(&CancellationToken::new(), |_| async { ok_client("v1") })
            .await
            .unwrap();
        assert_eq!(*handle.borrow().await.unwrap(), "v1");
    }

    #[tokio::test]
    async fn connect_short_circuits_to_populated_client() {
        let handle = ClientHandle::connect("scc", |_| async { ok_client("ready") })
            .await
            .unwrap();
        assert!(handle.is_initialized().await);
        assert_eq!(*handle.borrow().await.unwrap(), "ready");
    }

    #[tokio::test]
    async fn lease_counts_in_flight() {
        let handle = ClientHandle::with_client("storage", "v1".to_string());
        let a = handle.borrow().await.unwrap();
        let b = handle.borrow().await.unwrap();
        assert_eq!(handle.in_flight(), 2);
        a.release();
        assert_eq!(handle.in_flight(), 1);
        drop(b);
        assert_eq!(handle.in_flight(), 0);
    }

    #[tokio::test]
    async fn replace_waits_for_outstanding_lease() {
        let handle = Arc::new(ClientHandle::with_client("storage", "old".to_string()));
        let lease = handle.borrow().await.unwrap();

        let replacer = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move {
                handle
                    .replace(&CancellationToken::new(), |_| async { ok_client("new") })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!replacer.is_finished());
        assert_eq!(*lease, "old");

        lease.release();
        replacer.await.unwrap().unwrap();
        assert_eq!(*handle.borrow().await.unwrap(), "new");
    }

    #[tokio::test]
    async fn pending_replace_blocks_new_borrowers() {
        let handle = Arc::new(ClientHandle::with_client("storage", "old".to_string()));
        let lease = handle.borrow().await.unwrap();

        let replacer = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move {
                handle
                    .replace(&CancellationToken::new(), |_| async { ok_client("new") })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let blocked = tokio::time::timeout(Duration::from_millis(50), handle.borrow()).await;
        assert!(blocked.is_err(), "borrow must wait behind a pending replace");

        drop(lease);
        replacer.await.unwrap().unwrap();
        assert_eq!(*handle.borrow().await.unwrap(), "new");
    }

    #[tokio::test]
    async fn cancelled_drain_leaves_client_untouched() {
        let handle = ClientHandle::with_client("storage", "old".to_string());
        let lease = handle.borrow().await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = handle
            .replace(&cancel, |_| async { ok_client("new") })
            .await
            .unwrap_err();
        assert!(matches!(err, RotationError::DrainCancelled { in_flight: 1 }));

        drop(lease);
        assert_eq!(*handle.borrow().await.unwrap(), "old");
    }

    #[tokio::test]
    async fn drain_timeout_is_reported() {
        let handle = ClientHandle::with_client("storage", "old".to_string());
        let _lease = handle.borrow().await.unwrap();

        let err = handle
            .replace_within(
                Duration::from_millis(30),
                &CancellationToken::new(),
                |_| async { ok_client("new") },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RotationError::DrainTimeout { .. }));
    }

    #[tokio::test]
    async fn failed_build_keeps_previous_client() {
        let handle = ClientHandle::with_client("storage", "old".to_string());
        let err = handle
            .replace(&CancellationToken::new(), |_| async {
                Err::<String, BoxError>("sdk refused credentials".into())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RotationError::ClientBuild { ref client, .. } if client == "storage"));
        assert_eq!(*handle.borrow().await.unwrap(), "old");
    }
}
