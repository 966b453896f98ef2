//! OIDC access-token cache with single-flight refresh.
//!
//! Kept as an explicitly constructed service (`Arc<dyn TokenProvider>`)
//! rather than a process-wide singleton so producers, sinks, and tests can
//! each hold (or fake) their own reference — see the "Global mutable state
//! to eliminate" design note.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, Notify, RwLock};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token fetch failed: {0}")]
    FetchFailed(String),
    #[error("scope {0:?} is not permitted")]
    ScopeRejected(String),
    #[error("no scopes requested")]
    NoScopes,
}

#[derive(Debug, Clone)]
pub struct CachedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Fetches a fresh token for a tenant/scope set from the upstream OIDC
/// endpoint. Implemented by a thin `reqwest`-based client against the
/// configured `auth.method` (service principal, managed identity, or CLI
/// credential); kept abstract here so [`TokenCache`] can be tested against
/// a fake.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self, tenant_id: &str, scopes: &[String]) -> Result<CachedToken, AuthError>;
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_token(&self, tenant_id: &str, scopes: &[String]) -> Result<CachedToken, AuthError>;
    async fn clear_cache(&self);
    async fn cache_size(&self) -> usize;
}

/// Single-flight, expiry-aware token cache. Concurrent misses for the same
/// `(tenant_id, scopes)` key coalesce into one upstream fetch; other
/// callers await the shared result via a `Notify`.
pub struct TokenCache {
    source: Arc<dyn TokenSource>,
    refresh_before_expiry: Duration,
    expected_scope_prefixes: Vec<String>,
    denied_scope_prefixes: Vec<String>,
    cache: RwLock<HashMap<String, CachedToken>>,
    in_flight: Mutex<HashMap<String, Arc<Notify>>>,
}

impl TokenCache {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self {
            source,
            refresh_before_expiry: Duration::from_secs(5 * 60),
            expected_scope_prefixes: Vec::new(),
            denied_scope_prefixes: Vec::new(),
            cache: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_refresh_buffer(mut self, buffer: Duration) -> Self {
        self.refresh_before_expiry = buffer;
        self
    }

    pub fn with_expected_scopes(mut self, prefixes: Vec<String>) -> Self {
        self.expected_scope_prefixes = prefixes;
        self
    }

    pub fn with_denied_scopes(mut self, prefixes: Vec<String>) -> Self {
        self.denied_scope_prefixes = prefixes;
        self
    }

    fn validate_scopes(&self, scopes: &[String]) -> Result<(), AuthError> {
        if scopes.is_empty() {
            return Err(AuthError::NoScopes);
        }
        for scope in scopes {
            if self.denied_scope_prefixes.iter().any(|d| scope.starts_with(d.as_str())) {
                return Err(AuthError::ScopeRejected(scope.clone()));
            }
        }
        if !self.expected_scope_prefixes.is_empty()
            && !scopes
                .iter()
                .any(|s| self.expected_scope_prefixes.iter().any(|e| s.starts_with(e.as_str())))
        {
            return Err(AuthError::ScopeRejected(scopes.join(",")));
        }
        Ok(())
    }

    fn key(tenant_id: &str, scopes: &[String]) -> String {
        format!("{tenant_id}:{}", scopes.join(","))
    }
}

#[async_trait]
impl TokenProvider for TokenCache {
    async fn get_token(&self, tenant_id: &str, scopes: &[String]) -> Result<CachedToken, AuthError> {
        self.validate_scopes(scopes)?;
        let key = Self::key(tenant_id, scopes);
        let now = Utc::now();

        if let Some(cached) = self.cache.read().await.get(&key) {
            if now + chrono::Duration::from_std(self.refresh_before_expiry).unwrap_or_default()
                < cached.expires_at
            {
                return Ok(cached.clone());
            }
        }

        // Single-flight: the first caller for this key performs the
        // upstream fetch; concurrent callers await its `Notify` and then
        // re-read the cache.
        let notify = {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(existing) = in_flight.get(&key) {
                Some(existing.clone())
            } else {
                in_flight.insert(key.clone(), Arc::new(Notify::new()));
                None
            }
        };

        if let Some(notify) = notify {
            notify.notified().await;
            return self
                .cache
                .read()
                .await
                .get(&key)
                .cloned()
                .ok_or_else(|| AuthError::FetchFailed("single-flight fetch did not populate cache".into()));
        }

        let result = self.source.fetch(tenant_id, scopes).await;
        if let Ok(token) = &result {
            self.cache.write().await.insert(key.clone(), token.clone());
        }

        let notify = self.in_flight.lock().await.remove(&key);
        if let Some(notify) = notify {
            notify.notify_waiters();
        }

        result
    }

    async fn clear_cache(&self) {
        self.cache.write().await.clear();
    }

    async fn cache_size(&self) -> usize {
        self.cache.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn fetch(&self, _tenant_id: &str, _scopes: &[String]) -> Result<CachedToken, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(CachedToken {
                token: "tok".to_string(),
                expires_at: Utc::now() + chrono::Duration::hours(1),
            })
        }
    }

    #[tokio::test]
    async fn rejects_empty_scopes() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(0),
        });
        let cache = TokenCache::new(source);
        assert!(matches!(cache.get_token("tenant", &[]).await, Err(AuthError::NoScopes)));
    }

    #[tokio::test]
    async fn rejects_denied_scope() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(0),
        });
        let cache = TokenCache::new(source).with_denied_scopes(vec!["forbidden".to_string()]);
        let result = cache.get_token("tenant", &["forbidden.read".to_string()]).await;
        assert!(matches!(result, Err(AuthError::ScopeRejected(_))));
    }

    #[tokio::test]
    async fn concurrent_misses_single_flight() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(50),
        });
        let cache = Arc::new(TokenCache::new(source.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.get_token("tenant", &["svc.read".to_string()]).await.unwrap()
            }));
        }
        let mut tokens = Vec::new();
        for handle in handles {
            tokens.push(handle.await.unwrap());
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(tokens.iter().all(|t| t.token == tokens[0].token));
    }

    #[tokio::test]
    async fn cache_clear_forces_refetch() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(0),
        });
        let cache = TokenCache::new(source.clone());
        cache.get_token("t", &["svc.read".to_string()]).await.unwrap();
        assert_eq!(cache.cache_size().await, 1);
        cache.clear_cache().await;
        assert_eq!(cache.cache_size().await, 0);
        cache.get_token("t", &["svc.read".to_string()]).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }
}
