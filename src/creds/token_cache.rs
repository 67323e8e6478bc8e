// src/creds/token_cache.rs

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::creds::traits::{AccessToken, TokenSource};
use crate::error::{BoxError, Result, RotationError};

#[derive(Default)]
struct CachedToken {
    token: Option<AccessToken>,
    forced_invalid: bool,
}

impl CachedToken {
    fn servable(&self) -> Option<&AccessToken> {
        if self.forced_invalid {
            return None;
        }
        self.token.as_ref().filter(|t| t.is_valid_at(Utc::now()))
    }
}

/// Serves a cached token until it expires or is explicitly invalidated.
///
/// One lock spans the whole `token()` call, upstream fetch included, so
/// concurrent callers queue behind a refresh instead of each issuing their
/// own.
pub struct TokenCache {
    upstream: Arc<dyn TokenSource>,
    cached: Mutex<CachedToken>,
}

impl TokenCache {
    pub fn new(upstream: Arc<dyn TokenSource>) -> Self {
        Self {
            upstream,
            cached: Mutex::new(CachedToken::default()),
        }
    }

    pub async fn token(&self) -> Result<AccessToken> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.servable() {
            return Ok(token.clone());
        }

        // A failed refresh leaves the previous token and the invalid flag as
        // they were; the next caller simply tries again.
        let fresh = self.upstream.token().await.map_err(|e| {
            tracing::warn!(error = %e, "upstream token refresh failed");
            RotationError::TokenFetch(e)
        })?;

        cached.token = Some(fresh.clone());
        cached.forced_invalid = false;
        tracing::debug!(expiry = ?fresh.expiry, "token refreshed");
        Ok(fresh)
    }

    /// Forces the next `token()` call to go upstream. Does not fetch.
    pub async fn invalidate(&self) {
        self.cached.lock().await.forced_invalid = true;
        tracing::debug!("token cache invalidated");
    }
}

/// The cache is itself a token source, so it can be handed to anything that
/// expects the standard shape.
#[async_trait]
impl TokenSource for TokenCache {
    async fn token(&self) -> std::result::Result<AccessToken, BoxError> {
        TokenCache::token(self).await.map_err(BoxError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns "1", "2", ... on successive calls, valid for one hour.
    #[derive(Default)]
    struct CountingSource {
        calls: AtomicUsize,
        fail_next: parking_lot::Mutex<bool>,
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn token(&self) -> std::result::Result<AccessToken, BoxError> {
            if std::mem::take(&mut *self.fail_next.lock()) {
                return Err("sts endpoint unavailable".into());
            }
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(AccessToken::new(
                n.to_string(),
                Some(Utc::now() + Duration::hours(1)),
            ))
        }
    }

    fn cache() -> (Arc<CountingSource>, TokenCache) {
        let source = Arc::new(CountingSource::default());
        let cache = TokenCache::new(source.clone());
        (source, cache)
    }

    #[tokio::test]
    async fn valid_token_is_reused() {
        let (source, cache) = cache();
        let first = cache.token().await.unwrap();
        let second = cache.token().await.unwrap();
        assert_eq!(first.secret(), second.secret());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_exactly_one_refresh() {
        let (source, cache) = cache();
        assert_eq!(cache.token().await.unwrap().secret(), "1");
        assert_eq!(cache.token().await.unwrap().secret(), "1");
        cache.invalidate().await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1, "invalidate must not fetch");
        assert_eq!(cache.token().await.unwrap().secret(), "2");
        assert_eq!(cache.token().await.unwrap().secret(), "2");
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_refresh_preserves_previous_token() {
        let (source, cache) = cache();
        assert_eq!(cache.token().await.unwrap().secret(), "1");
        cache.invalidate().await;

        *source.fail_next.lock() = true;
        assert!(matches!(
            cache.token().await,
            Err(RotationError::TokenFetch(_))
        ));

        let cached = cache.cached.lock().await;
        assert_eq!(cached.token.as_ref().unwrap().secret(), "1");
        assert!(cached.forced_invalid);
        drop(cached);

        assert_eq!(cache.token().await.unwrap().secret(), "2");
    }

    #[tokio::test]
    async fn expired_token_is_refetched() {
        struct Expired(AtomicUsize);

        #[async_trait]
        impl TokenSource for Expired {
            async fn token(&self) -> std::result::Result<AccessToken, BoxError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(AccessToken::new("stale", Some(Utc::now() - Duration::seconds(1))))
            }
        }

        let source = Arc::new(Expired(AtomicUsize::new(0)));
        let cache = TokenCache::new(source.clone());
        cache.token().await.unwrap();
        cache.token().await.unwrap();
        assert_eq!(source.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let (source, cache) = cache();
        let cache = Arc::new(cache);
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.token().await.map(|t| t.secret().to_string()) })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "1");
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }
}
