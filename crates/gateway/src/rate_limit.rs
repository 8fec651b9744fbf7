//! Token-bucket admission control, globally and per client.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use llm_dispatch_core::{config::RateLimitConfig, Error};
use llm_dispatch_governance::metrics::track_rate_limited;

use crate::server::ApiError;

/// Continuously refilled token bucket.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate_per_sec: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(capacity: f64, rate_per_sec: f64) -> Self {
        let now = Instant::now();
        Self {
            tokens: capacity,
            capacity,
            rate_per_sec,
            last_refill: now,
            last_seen: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token if available.
    pub fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        self.refill(now);
        self.last_seen = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available, after refill.
    pub fn available(&mut self) -> f64 {
        self.refill(Instant::now());
        self.tokens
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }
}

/// Decision hook that replaces bucket logic, keyed by client id. Global
/// checks pass an empty id.
pub type RateLimitOverride = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Global and per-client token buckets.
pub struct RateLimiter {
    capacity: f64,
    rate_per_sec: f64,
    retention: Duration,
    global: Mutex<TokenBucket>,
    clients: DashMap<String, TokenBucket>,
    override_fn: Option<RateLimitOverride>,
}

impl RateLimiter {
    /// `requests_per_minute` refill with room for `burst` requests at once.
    pub fn new(requests_per_minute: u32, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        let rate_per_sec = f64::from(requests_per_minute) / 60.0;
        Self {
            capacity,
            rate_per_sec,
            retention: Duration::from_secs(24 * 60 * 60),
            global: Mutex::new(TokenBucket::new(capacity, rate_per_sec)),
            clients: DashMap::new(),
            override_fn: None,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.requests_per_minute, config.burst)
            .with_retention(Duration::from_secs(config.client_retention_secs))
    }

    /// Drop client buckets idle for longer than `retention`.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Bypass bucket logic with a fixed decision function.
    pub fn with_override<F>(mut self, decide: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.override_fn = Some(Arc::new(decide));
        self
    }

    /// Admit one request against the global bucket.
    pub fn allow(&self) -> bool {
        if let Some(decide) = &self.override_fn {
            return decide("");
        }
        let mut bucket = self.global.lock().unwrap_or_else(|e| e.into_inner());
        bucket.try_acquire()
    }

    /// Admit one request from `client_id`, creating its bucket on first sight.
    pub fn allow_client(&self, client_id: &str) -> bool {
        if let Some(decide) = &self.override_fn {
            return decide(client_id);
        }
        if let Some(mut bucket) = self.clients.get_mut(client_id) {
            return bucket.try_acquire();
        }
        self.clients
            .entry(client_id.to_string())
            .or_insert_with(|| TokenBucket::new(self.capacity, self.rate_per_sec))
            .try_acquire()
    }

    /// Number of tracked clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Remove idle client buckets. Returns how many were dropped.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let before = self.clients.len();
        self.clients
            .retain(|_, bucket| bucket.idle_for(now) < self.retention);
        before.saturating_sub(self.clients.len())
    }

    /// Sweep idle clients every `interval` until `shutdown` fires or the
    /// limiter is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let limiter = Arc::downgrade(self);
        let period = interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                let removed = limiter.cleanup();
                if removed > 0 {
                    tracing::debug!(
                        removed,
                        remaining = limiter.client_count(),
                        "Swept idle rate-limit buckets"
                    );
                }
            }
            tracing::debug!("Rate-limit cleanup stopped");
        })
    }
}

/// Identify the caller: first `X-Forwarded-For` entry, then `X-Real-IP`,
/// then the peer address.
pub fn client_id_from_headers(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = real_ip {
        return ip.to_string();
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Reject requests once the client's bucket or the global bucket is empty.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client_id = client_id_from_headers(request.headers(), peer);

    if !limiter.allow_client(&client_id) || !limiter.allow() {
        tracing::warn!(client = %client_id, path = %request.uri().path(), "Rate limit exceeded");
        track_rate_limited();
        return ApiError::from(Error::RateLimited).into_response();
    }

    next.run(request).await
}
