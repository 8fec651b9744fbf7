//! Single-query dispatch.
//!
//! A request moves through: cache check, routing, invocation, and at most
//! one fallback to a different provider. Successful responses are written
//! back to the cache.

use std::sync::Arc;
use tokio::time::Instant;

use llm_dispatch_core::{
    traits::ResponseCache,
    types::{Provider, ProviderCompletion, QueryRequest, QueryResponse},
    Error, ProviderError, RequestContext, Result,
};
use llm_dispatch_governance::metrics::track_cache_lookup;

use crate::providers::ProviderRegistry;
use crate::router::ProviderRouter;

/// Serves one query end to end.
pub struct Dispatcher {
    router: Arc<ProviderRouter>,
    registry: Arc<ProviderRegistry>,
    cache: Arc<dyn ResponseCache>,
}

impl Dispatcher {
    pub fn new(
        router: Arc<ProviderRouter>,
        registry: Arc<ProviderRegistry>,
        cache: Arc<dyn ResponseCache>,
    ) -> Self {
        Self {
            router,
            registry,
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<dyn ResponseCache> {
        &self.cache
    }

    /// Handle a query.
    ///
    /// Retryable failures of the routed provider trigger exactly one fallback
    /// attempt. Errors that are not retryable are returned unchanged.
    pub async fn handle(&self, ctx: &RequestContext, request: &QueryRequest) -> Result<QueryResponse> {
        let started = Instant::now();
        ctx.check()?;

        match self.cache.get(request).await {
            Ok(Some(mut hit)) => {
                track_cache_lookup(true);
                hit.cached = true;
                hit.latency_ms = elapsed_ms(started);
                hit.request_id = request.request_id.clone();
                tracing::debug!(provider = %hit.provider, "Cache hit");
                return Ok(hit);
            }
            Ok(None) => {
                track_cache_lookup(false);
                tracing::debug!("Cache miss");
            }
            Err(e) => {
                track_cache_lookup(false);
                tracing::warn!(error = %e, "Cache lookup failed, treating as miss");
            }
        }

        ctx.check()?;
        let decision = self.router.route_request(ctx, request).await?;
        let original = decision.provider;
        tracing::debug!(provider = %original, reason = ?decision.reason, "Routed query");

        let err = match self.invoke(ctx, original, request).await {
            Ok(completion) => {
                return Ok(self.finish(request, original, completion, started, None).await);
            }
            Err(err) => err,
        };

        if err.is_cancellation() || !err.is_retryable() {
            tracing::warn!(provider = %original, error = %err, "Query failed");
            return Err(err);
        }

        let Some(first_failure) = err.as_provider_error().cloned() else {
            return Err(err);
        };

        let fallback = match self.router.fallback_on_error(ctx, original, request, err).await {
            Ok(decision) => decision.provider,
            Err(e) if e.is_cancellation() => return Err(e),
            Err(e) => {
                tracing::warn!(provider = %original, error = %e, "No fallback for failed query");
                return Err(Error::AllProvidersFailed {
                    attempted: vec![original],
                    source: first_failure,
                });
            }
        };

        match self.invoke(ctx, fallback, request).await {
            Ok(completion) => Ok(self
                .finish(request, fallback, completion, started, Some(original))
                .await),
            Err(e) if e.is_cancellation() => Err(e),
            Err(e) => match e.as_provider_error().cloned() {
                Some(source) => {
                    tracing::warn!(
                        original = %original,
                        fallback = %fallback,
                        error = %source,
                        "Fallback provider failed"
                    );
                    Err(Error::AllProvidersFailed {
                        attempted: vec![original, fallback],
                        source,
                    })
                }
                None => Err(e),
            },
        }
    }

    /// Call one provider under the request context.
    async fn invoke(
        &self,
        ctx: &RequestContext,
        provider: Provider,
        request: &QueryRequest,
    ) -> Result<ProviderCompletion> {
        let client = self.registry.get(provider).ok_or_else(|| {
            ProviderError::missing_credential(provider, "no client registered for provider")
        })?;

        let started = Instant::now();
        let result = ctx
            .run(client.query(ctx, &request.query, request.model_version.as_deref()))
            .await;

        match &result {
            Ok(_) => self.registry.record_success(provider, elapsed_ms(started)),
            Err(e) if !e.is_cancellation() => self.registry.record_failure(provider),
            Err(_) => {}
        }
        result
    }

    async fn finish(
        &self,
        request: &QueryRequest,
        provider: Provider,
        completion: ProviderCompletion,
        started: Instant,
        original_provider: Option<Provider>,
    ) -> QueryResponse {
        let mut response = QueryResponse::from_completion(provider, completion, elapsed_ms(started));
        response.request_id = request.request_id.clone();
        if original_provider.is_some() {
            response.retries = 1;
            response.original_provider = original_provider;
        }

        if let Err(e) = self.cache.set(request, &response).await {
            tracing::warn!(error = %e, "Failed to populate cache");
        }

        tracing::info!(
            provider = %provider,
            latency_ms = response.latency_ms,
            total_tokens = response.total_tokens,
            retries = response.retries,
            "Query served"
        );
        response
    }
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
