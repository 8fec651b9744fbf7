//! Response caches keyed by the request's structured hash.

use async_trait::async_trait;
use redis::{AsyncCommands, Client};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use llm_dispatch_core::{
    config::CacheConfig,
    traits::ResponseCache,
    types::{QueryRequest, QueryResponse},
    Error, Result,
};

/// Cache entry with expiration.
#[derive(Debug, Clone)]
struct CacheEntry {
    response: QueryResponse,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Stored entries, including expired ones not yet purged.
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

// =============================================================================
// In-memory cache
// =============================================================================

/// In-memory response cache with TTL expiry and an item cap.
///
/// Once the cap is reached, expired entries are purged; if the cache is
/// still full, responses for new keys are dropped. Existing keys can always
/// be refreshed.
pub struct InMemoryResponseCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    max_items: usize,
    enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl InMemoryResponseCache {
    pub fn new(ttl: Duration, max_items: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            max_items,
            enabled: true,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        let mut cache = Self::new(config.ttl(), config.max_items);
        cache.enabled = config.enabled;
        cache
    }

    /// A cache that stores nothing.
    pub fn disabled() -> Self {
        let mut cache = Self::new(Duration::ZERO, 0);
        cache.enabled = false;
        cache
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Get cache statistics.
    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len().await,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Clear expired entries. Returns how many were removed.
    pub async fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// Sweep expired entries every `interval` until `shutdown` fires or the
    /// cache is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        let period = interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let removed = cache.cleanup().await;
                if removed > 0 {
                    let remaining = cache.len().await;
                    tracing::debug!(removed, remaining, "Swept expired cache entries");
                }
            }
            tracing::debug!("Cache cleanup stopped");
        })
    }
}

#[async_trait]
impl ResponseCache for InMemoryResponseCache {
    async fn get(&self, request: &QueryRequest) -> Result<Option<QueryResponse>> {
        if !self.enabled {
            return Ok(None);
        }

        let key = request.cache_key();
        let entries = self.entries.read().await;
        match entries.get(&key) {
            Some(entry) if !entry.is_expired(Instant::now()) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry.response.clone()))
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn set(&self, request: &QueryRequest, response: &QueryResponse) -> Result<()> {
        if !self.enabled || self.max_items == 0 {
            return Ok(());
        }

        let key = request.cache_key();
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        if !entries.contains_key(&key) && entries.len() >= self.max_items {
            entries.retain(|_, entry| !entry.is_expired(now));
            if entries.len() >= self.max_items {
                tracing::debug!(max_items = self.max_items, "Response cache full, dropping entry");
                return Ok(());
            }
        }

        entries.insert(
            key,
            CacheEntry {
                response: response.clone(),
                expires_at: now + self.ttl,
            },
        );
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.entries.write().await.clear();
        Ok(())
    }
}

// =============================================================================
// Redis cache
// =============================================================================

/// Redis-backed response cache. Expiry is delegated to `SET EX`.
pub struct RedisResponseCache {
    client: Client,
    prefix: String,
    ttl: Duration,
    enabled: bool,
}

impl RedisResponseCache {
    /// Create a new Redis cache. Connections are opened lazily.
    pub fn new(url: &str, ttl: Duration) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| Error::cache(format!("Failed to connect to Redis: {}", e)))?;

        Ok(Self {
            client,
            prefix: "llm-dispatch:response".to_string(),
            ttl,
            enabled: true,
        })
    }

    pub fn from_config(config: &CacheConfig) -> Result<Option<Self>> {
        match &config.redis_url {
            Some(url) => {
                let mut cache = Self::new(url, config.ttl())?;
                cache.enabled = config.enabled;
                Ok(Some(cache))
            }
            None => Ok(None),
        }
    }

    /// Override the key namespace.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn key(&self, request: &QueryRequest) -> String {
        format!("{}:{}", self.prefix, request.cache_key())
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::cache(format!("Redis connection error: {}", e)))
    }
}

#[async_trait]
impl ResponseCache for RedisResponseCache {
    async fn get(&self, request: &QueryRequest) -> Result<Option<QueryResponse>> {
        if !self.enabled {
            return Ok(None);
        }
        let mut conn = self.connection().await?;

        let data: Option<String> = conn
            .get(self.key(request))
            .await
            .map_err(|e| Error::cache(format!("Redis get error: {}", e)))?;

        match data {
            Some(json) => {
                let response = serde_json::from_str(&json)
                    .map_err(|e| Error::cache(format!("Failed to deserialize response: {}", e)))?;
                Ok(Some(response))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, request: &QueryRequest, response: &QueryResponse) -> Result<()> {
        let ttl_secs = self.ttl.as_secs();
        if !self.enabled || ttl_secs == 0 {
            return Ok(());
        }
        let mut conn = self.connection().await?;

        let json = serde_json::to_string(response)?;
        let _: () = conn
            .set_ex(self.key(request), json, ttl_secs)
            .await
            .map_err(|e| Error::cache(format!("Redis set error: {}", e)))?;

        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let mut conn = self.connection().await?;

        let pattern = format!("{}:*", self.prefix);
        let keys: Vec<String> = conn
            .keys(&pattern)
            .await
            .map_err(|e| Error::cache(format!("Redis keys error: {}", e)))?;
        if keys.is_empty() {
            return Ok(());
        }

        let _: () = conn
            .del(keys)
            .await
            .map_err(|e| Error::cache(format!("Redis delete error: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llm_dispatch_core::types::{Provider, ProviderCompletion, TaskType};

    fn response(text: &str) -> QueryResponse {
        let mut response = QueryResponse::from_completion(
            Provider::OpenAi,
            ProviderCompletion {
                text: text.to_string(),
                input_tokens: 5,
                output_tokens: 9,
            },
            42,
        );
        response.request_id = Some("req-7".into());
        response
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_then_get_until_expiry() {
        let cache = InMemoryResponseCache::new(Duration::from_secs(60), 10);
        let request = QueryRequest::new("hello").with_task_type(TaskType::Generation);
        let stored = response("world");

        cache.set(&request, &stored).await.unwrap();
        assert_eq!(cache.get(&request).await.unwrap(), Some(stored));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get(&request).await.unwrap(), None);

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_distinct_requests_do_not_share_entries() {
        let cache = InMemoryResponseCache::new(Duration::from_secs(60), 10);
        let summarize = QueryRequest::new("hello").with_task_type(TaskType::Summarization);
        let sentiment = QueryRequest::new("hello").with_task_type(TaskType::Sentiment);

        cache.set(&summarize, &response("summary")).await.unwrap();
        assert!(cache.get(&sentiment).await.unwrap().is_none());
        assert!(cache.get(&summarize).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_items_rejects_new_keys() {
        let cache = InMemoryResponseCache::new(Duration::from_secs(60), 2);
        let a = QueryRequest::new("a");
        let b = QueryRequest::new("b");
        let c = QueryRequest::new("c");

        cache.set(&a, &response("1")).await.unwrap();
        cache.set(&b, &response("2")).await.unwrap();
        cache.set(&c, &response("3")).await.unwrap();
        assert_eq!(cache.len().await, 2);
        assert!(cache.get(&c).await.unwrap().is_none());

        // Existing keys can still be refreshed at the cap.
        cache.set(&a, &response("1b")).await.unwrap();
        assert_eq!(cache.get(&a).await.unwrap().unwrap().response, "1b");

        // Expired entries make room.
        tokio::time::advance(Duration::from_secs(61)).await;
        cache.set(&c, &response("3")).await.unwrap();
        assert_eq!(cache.len().await, 1);
        assert!(cache.get(&c).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_and_flush() {
        let cache = InMemoryResponseCache::new(Duration::from_secs(10), 10);
        cache.set(&QueryRequest::new("a"), &response("1")).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        cache.set(&QueryRequest::new("b"), &response("2")).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.cleanup().await, 1);
        assert_eq!(cache.len().await, 1);

        cache.flush().await.unwrap();
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_disabled_cache_stores_nothing() {
        let cache = InMemoryResponseCache::from_config(&CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        });
        let request = QueryRequest::new("hello");

        cache.set(&request, &response("x")).await.unwrap();
        assert!(cache.get(&request).await.unwrap().is_none());
        assert!(cache.is_empty().await);
        assert!(InMemoryResponseCache::disabled().get(&request).await.unwrap().is_none());
    }

    #[test]
    fn test_redis_key_is_namespaced() {
        let cache = RedisResponseCache::new("redis://127.0.0.1:6379", Duration::from_secs(60))
            .unwrap()
            .with_prefix("test");
        let request = QueryRequest::new("hello");
        assert_eq!(cache.key(&request), format!("test:{}", request.cache_key()));
    }

    #[test]
    fn test_redis_from_config_without_url() {
        assert!(RedisResponseCache::from_config(&CacheConfig::default())
            .unwrap()
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_purges_expired() {
        let cache = Arc::new(InMemoryResponseCache::new(Duration::from_secs(30), 100));
        let shutdown = CancellationToken::new();
        let handle = cache.spawn_cleanup(Duration::from_secs(10), shutdown.clone());

        cache.set(&QueryRequest::new("old"), &response("a")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(25)).await;
        cache.set(&QueryRequest::new("new"), &response("b")).await.unwrap();
        assert_eq!(cache.len().await, 2);

        // The sweep at 30s drops only the first entry.
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(cache.len().await, 1);
        assert!(cache.get(&QueryRequest::new("new")).await.unwrap().is_some());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_stops_when_cache_dropped() {
        let cache = Arc::new(InMemoryResponseCache::new(Duration::from_secs(30), 100));
        let handle = cache.spawn_cleanup(Duration::from_secs(10), CancellationToken::new());

        drop(cache);
        handle.await.unwrap();
    }
}
