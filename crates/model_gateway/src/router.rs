//! Availability-aware provider router.
//!
//! Routing order for a fresh request:
//! 1. explicit provider preference, if available
//! 2. task-type affinity table, if the mapped provider is available
//! 3. uniform random pick among available providers
//!
//! Availability comes from a snapshot refreshed lazily once it is older than
//! its TTL. Probes run outside the snapshot lock; only each write takes the
//! exclusive half. A routing call waits for a refresh only as long as its
//! own context allows.

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio::time::Instant;

use llm_dispatch_core::{
    config::RouterConfig,
    types::{AvailabilitySnapshot, Provider, QueryRequest, RouteDecision, RouteReason, TaskType},
    Error, ProviderError, RequestContext, Result,
};

use crate::providers::ProviderRegistry;

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct AvailabilityState {
    providers: BTreeMap<Provider, bool>,
    last_refresh: Option<Instant>,
    refreshed_at: Option<DateTime<Utc>>,
}

impl AvailabilityState {
    fn available(&self) -> Vec<Provider> {
        self.providers
            .iter()
            .filter(|(_, up)| **up)
            .map(|(p, _)| *p)
            .collect()
    }
}

/// Chooses a provider for each request and a replacement after failures.
pub struct ProviderRouter {
    registry: Arc<ProviderRegistry>,
    task_affinity: HashMap<TaskType, Provider>,
    ttl: Duration,
    auto_refresh: bool,
    probe_timeout: Duration,
    state: RwLock<AvailabilityState>,
    /// Serializes refreshes so concurrent stale readers probe only once.
    refresh_lock: AsyncMutex<()>,
    rng: Mutex<StdRng>,
}

impl ProviderRouter {
    /// Create a router over the providers in `registry`.
    pub fn new(registry: Arc<ProviderRegistry>, config: &RouterConfig) -> Self {
        Self {
            registry,
            task_affinity: config.task_affinity.clone(),
            ttl: config.availability_ttl(),
            auto_refresh: !config.test_mode,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            state: RwLock::new(AvailabilityState::default()),
            refresh_lock: AsyncMutex::new(()),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Disable automatic refresh; availability is then set explicitly.
    pub fn test_mode(mut self) -> Self {
        self.auto_refresh = false;
        self
    }

    /// Seed the selection RNG for reproducible picks.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock().unwrap_or_else(|e| e.into_inner()) = StdRng::seed_from_u64(seed);
        self
    }

    /// Bound how long a single availability probe may take.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    // =========================================================================
    // Availability
    // =========================================================================

    /// Set one provider's availability directly.
    pub async fn set_availability(&self, provider: Provider, available: bool) {
        let mut state = self.state.write().await;
        state.providers.insert(provider, available);
    }

    pub async fn is_available(&self, provider: Provider) -> bool {
        self.refresh_if_stale().await;
        let state = self.state.read().await;
        state.providers.get(&provider).copied().unwrap_or(false)
    }

    /// Copy of the current availability snapshot, refreshed first if stale.
    pub async fn availability_snapshot(&self) -> AvailabilitySnapshot {
        self.refresh_if_stale().await;
        self.current_snapshot().await
    }

    /// Like [`availability_snapshot`](Self::availability_snapshot), but a
    /// stale refresh is abandoned once `ctx` ends.
    pub async fn availability_snapshot_within(&self, ctx: &RequestContext) -> Result<AvailabilitySnapshot> {
        self.refresh_within(ctx).await?;
        Ok(self.current_snapshot().await)
    }

    /// Copy of the snapshot as it stands, without probing.
    pub async fn current_snapshot(&self) -> AvailabilitySnapshot {
        let state = self.state.read().await;
        AvailabilitySnapshot {
            providers: state.providers.clone(),
            refreshed_at: state.refreshed_at,
            ttl_secs: self.ttl.as_secs(),
        }
    }

    /// Probe every registered provider and update the snapshot.
    ///
    /// Each answer is recorded as it arrives, so an interrupted refresh still
    /// keeps the probes that finished. The snapshot age only resets once all
    /// probes have answered. Providers that are known but not registered are
    /// recorded as unavailable.
    pub async fn refresh(&self) {
        let clients = self.registry.clients();
        {
            let mut state = self.state.write().await;
            for provider in Provider::ALL {
                if !clients.iter().any(|(p, _)| *p == provider) {
                    state.providers.insert(provider, false);
                }
            }
        }

        let probe_timeout = self.probe_timeout;
        let mut probes: FuturesUnordered<_> = clients
            .into_iter()
            .map(|(provider, client)| async move {
                let up = match tokio::time::timeout(probe_timeout, client.check_availability()).await {
                    Ok(up) => up,
                    Err(_) => {
                        tracing::warn!(provider = %provider, "Availability probe timed out");
                        false
                    }
                };
                (provider, up)
            })
            .collect();

        while let Some((provider, up)) = probes.next().await {
            self.state.write().await.providers.insert(provider, up);
        }

        let mut state = self.state.write().await;
        state.last_refresh = Some(Instant::now());
        state.refreshed_at = Some(Utc::now());
        let available = state.available();
        drop(state);

        tracing::info!(available = ?available, "Refreshed provider availability");
    }

    async fn is_stale(&self) -> bool {
        let state = self.state.read().await;
        match state.last_refresh {
            Some(at) => at.elapsed() >= self.ttl,
            None => true,
        }
    }

    async fn refresh_if_stale(&self) {
        if !self.auto_refresh || !self.is_stale().await {
            return;
        }
        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited.
        if self.is_stale().await {
            self.refresh().await;
        }
    }

    /// Waiting for another caller's refresh counts against `ctx` too.
    async fn refresh_within(&self, ctx: &RequestContext) -> Result<()> {
        ctx.run(async {
            self.refresh_if_stale().await;
            Ok(())
        })
        .await
    }

    async fn available(&self, ctx: &RequestContext) -> Result<Vec<Provider>> {
        self.refresh_within(ctx).await?;
        Ok(self.state.read().await.available())
    }

    fn pick_random(&self, candidates: &[Provider]) -> Option<Provider> {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        candidates.choose(&mut *rng).copied()
    }

    // =========================================================================
    // Routing
    // =========================================================================

    /// Choose a provider for a fresh request.
    pub async fn route_request(&self, ctx: &RequestContext, request: &QueryRequest) -> Result<RouteDecision> {
        ctx.check()?;
        let available = self.available(ctx).await?;

        ctx.check()?;
        if let Some(preferred) = request.provider {
            if available.contains(&preferred) {
                tracing::debug!(provider = %preferred, "Routing to preferred provider");
                return Ok(RouteDecision::new(preferred, RouteReason::UserPreference));
            }
            tracing::warn!(
                provider = %preferred,
                "Preferred provider unavailable, selecting automatically"
            );
        }

        ctx.check()?;
        if let Some(task) = request.task_type {
            match self.task_affinity.get(&task) {
                Some(provider) if available.contains(provider) => {
                    tracing::debug!(task = %task, provider = %provider, "Routing by task affinity");
                    return Ok(RouteDecision::new(*provider, RouteReason::TaskAffinity));
                }
                Some(provider) => {
                    tracing::debug!(task = %task, provider = %provider, "Affinity provider unavailable");
                }
                None => {}
            }
        }

        ctx.check()?;
        match self.pick_random(&available) {
            Some(provider) => {
                tracing::debug!(provider = %provider, candidates = available.len(), "Routing to random provider");
                Ok(RouteDecision::new(provider, RouteReason::Random))
            }
            None => Err(ProviderError::unavailable(None, "no providers available").into()),
        }
    }

    /// Choose a replacement for `original` after `err`.
    ///
    /// Errors that are not retryable are handed back unchanged. The result is
    /// never `original`.
    pub async fn fallback_on_error(
        &self,
        ctx: &RequestContext,
        original: Provider,
        request: &QueryRequest,
        err: Error,
    ) -> Result<RouteDecision> {
        if !err.is_retryable() {
            return Err(err);
        }
        ctx.check()?;

        let candidates: Vec<Provider> = self
            .available(ctx)
            .await?
            .into_iter()
            .filter(|p| *p != original)
            .collect();

        if candidates.is_empty() {
            tracing::warn!(original = %original, error = %err, "No fallback provider available");
            return Err(ProviderError::unavailable(
                None,
                format!("no fallback available after {} failed", original),
            )
            .into());
        }

        let chosen = match request.provider {
            Some(preferred) if preferred != original && candidates.contains(&preferred) => preferred,
            _ => self
                .pick_random(&candidates)
                .ok_or_else(|| Error::internal("empty fallback candidate set"))?,
        };

        tracing::info!(
            original = %original,
            fallback = %chosen,
            error = %err,
            "Falling back to alternate provider"
        );
        Ok(RouteDecision::new(chosen, RouteReason::Fallback))
    }
}
