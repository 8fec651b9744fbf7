//! Fan one query out to several providers under a shared deadline.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;

use llm_dispatch_core::{
    types::{ParallelQueryResponse, Provider, ProviderOutcome, QueryRequest, QueryResponse},
    Error, ProviderError, RequestContext,
};

use crate::dispatcher::elapsed_ms;
use crate::providers::ProviderRegistry;
use crate::router::ProviderRouter;

/// Queries several providers concurrently and reports each outcome.
pub struct ParallelDispatcher {
    registry: Arc<ProviderRegistry>,
    router: Arc<ProviderRouter>,
    default_timeout: Duration,
}

impl ParallelDispatcher {
    pub fn new(registry: Arc<ProviderRegistry>, router: Arc<ProviderRouter>, default_timeout: Duration) -> Self {
        Self {
            registry,
            router,
            default_timeout,
        }
    }

    /// Send `request` to every provider in `providers`, or to every
    /// available provider when the list is empty.
    ///
    /// The result holds exactly one outcome per target provider. Units still
    /// running when the shared deadline passes report a timeout; the call
    /// itself never fails.
    pub async fn handle(
        &self,
        ctx: &RequestContext,
        request: &QueryRequest,
        providers: &[Provider],
        timeout: Option<Duration>,
    ) -> ParallelQueryResponse {
        let started = Instant::now();
        let group = ctx.child_with_timeout(timeout.unwrap_or(self.default_timeout));

        let mut targets: Vec<Provider> = if providers.is_empty() {
            match self.router.availability_snapshot_within(&group).await {
                Ok(snapshot) => snapshot.available(),
                Err(e) => {
                    tracing::warn!(error = %e, "Availability refresh interrupted, using last snapshot");
                    self.router.current_snapshot().await.available()
                }
            }
        } else {
            providers.to_vec()
        };
        targets.sort();
        targets.dedup();

        let mut results = BTreeMap::new();
        let mut units = JoinSet::new();
        let mut unit_ids = HashMap::new();

        for provider in targets {
            let Some(client) = self.registry.get(provider) else {
                let err: Error =
                    ProviderError::missing_credential(provider, "provider is not configured").into();
                results.insert(provider, ProviderOutcome::from_error(&err));
                continue;
            };

            // Reported if the unit never gets to say otherwise.
            results.insert(provider, ProviderOutcome::Timeout);

            let unit_ctx = group.child();
            let query = request.query.clone();
            let model_version = request.model_version.clone();
            let registry = self.registry.clone();
            let handle = units.spawn(async move {
                let unit_started = Instant::now();
                let result = unit_ctx
                    .run(client.query(&unit_ctx, &query, model_version.as_deref()))
                    .await;
                let latency_ms = elapsed_ms(unit_started);
                match &result {
                    Ok(_) => registry.record_success(provider, latency_ms),
                    Err(e) if !e.is_cancellation() => registry.record_failure(provider),
                    Err(_) => {}
                }
                (provider, result, latency_ms)
            });
            unit_ids.insert(handle.id(), provider);
        }

        tracing::debug!(units = units.len(), "Dispatched parallel query");

        while let Some(joined) = units.join_next_with_id().await {
            match joined {
                Ok((_, (provider, Ok(completion), latency_ms))) => {
                    let mut response = QueryResponse::from_completion(provider, completion, latency_ms);
                    response.request_id = request.request_id.clone();
                    results.insert(provider, ProviderOutcome::Success { response });
                }
                Ok((_, (provider, Err(err), _))) => {
                    tracing::debug!(provider = %provider, error = %err, "Parallel unit failed");
                    results.insert(provider, ProviderOutcome::from_error(&err));
                }
                Err(e) => {
                    let Some(provider) = unit_ids.get(&e.id()).copied() else {
                        tracing::error!(error = %e, "Unknown parallel unit failed");
                        continue;
                    };
                    tracing::error!(provider = %provider, error = %e, "Parallel unit panicked");
                    self.registry.record_failure(provider);
                    results.insert(
                        provider,
                        ProviderOutcome::Error {
                            message: "unit panicked".to_string(),
                            kind: None,
                            code: None,
                        },
                    );
                }
            }
        }

        let response = ParallelQueryResponse {
            request_id: request.request_id.clone(),
            latency_ms: elapsed_ms(started),
            results,
        };
        tracing::info!(
            providers = response.results.len(),
            succeeded = response.success_count(),
            latency_ms = response.latency_ms,
            "Parallel query complete"
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llm_dispatch_core::config::RouterConfig;
    use llm_dispatch_core::mocks::{MockProvider, MockReply};
    use llm_dispatch_core::ErrorKind;

    async fn parallel(providers: Vec<MockProvider>, available: &[Provider]) -> ParallelDispatcher {
        let registry = ProviderRegistry::new();
        for p in providers {
            registry.register(Arc::new(p));
        }
        let registry = Arc::new(registry);
        let router = ProviderRouter::new(registry.clone(), &RouterConfig::default()).test_mode();
        for p in available {
            router.set_availability(*p, true).await;
        }
        ParallelDispatcher::new(registry, Arc::new(router), Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_deadline_bounds_slow_provider() {
        let dispatcher = parallel(
            vec![
                MockProvider::new(Provider::OpenAi, "fast").with_delay(Duration::from_millis(50)),
                MockProvider::hanging(Provider::Gemini),
            ],
            &[],
        )
        .await;
        let started = Instant::now();

        let response = dispatcher
            .handle(
                &RequestContext::new(),
                &QueryRequest::new("hi"),
                &[Provider::OpenAi, Provider::Gemini],
                Some(Duration::from_millis(100)),
            )
            .await;

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(110), "{:?}", elapsed);

        assert_eq!(response.results.len(), 2);
        match &response.results[&Provider::OpenAi] {
            ProviderOutcome::Success { response } => assert_eq!(response.response, "fast"),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(response.results[&Provider::Gemini], ProviderOutcome::Timeout);
        assert_eq!(response.success_count(), 1);
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let dispatcher = parallel(
            vec![
                MockProvider::new(Provider::OpenAi, "ok"),
                MockProvider::failing(
                    Provider::Mistral,
                    ProviderError::rate_limit(Provider::Mistral, "429"),
                ),
            ],
            &[],
        )
        .await;

        let response = dispatcher
            .handle(
                &RequestContext::new(),
                &QueryRequest::new("hi").with_request_id("p-1"),
                &[Provider::OpenAi, Provider::Mistral],
                None,
            )
            .await;

        assert_eq!(response.request_id.as_deref(), Some("p-1"));
        assert!(response.results[&Provider::OpenAi].is_success());
        match &response.results[&Provider::Mistral] {
            ProviderOutcome::Error { kind, code, .. } => {
                assert_eq!(*kind, Some(ErrorKind::RateLimit));
                assert_eq!(*code, Some(429));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unregistered_provider_reports_missing_credential() {
        let dispatcher = parallel(vec![MockProvider::new(Provider::OpenAi, "ok")], &[]).await;

        let response = dispatcher
            .handle(
                &RequestContext::new(),
                &QueryRequest::new("hi"),
                &[Provider::OpenAi, Provider::Bedrock],
                None,
            )
            .await;

        match &response.results[&Provider::Bedrock] {
            ProviderOutcome::Error { kind, .. } => {
                assert_eq!(*kind, Some(ErrorKind::MissingCredential))
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(response.results[&Provider::OpenAi].is_success());
    }

    #[tokio::test]
    async fn test_empty_list_targets_available_providers() {
        let dispatcher = parallel(
            vec![
                MockProvider::new(Provider::OpenAi, "a"),
                MockProvider::new(Provider::Gemini, "b"),
                MockProvider::new(Provider::Claude, "c"),
            ],
            &[Provider::OpenAi, Provider::Claude],
        )
        .await;

        let response = dispatcher
            .handle(&RequestContext::new(), &QueryRequest::new("hi"), &[], None)
            .await;

        let targets: Vec<Provider> = response.results.keys().copied().collect();
        assert_eq!(targets, vec![Provider::OpenAi, Provider::Claude]);
        assert_eq!(response.success_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_cancellation_reported_per_provider() {
        let dispatcher = parallel(
            vec![
                MockProvider::hanging(Provider::OpenAi),
                MockProvider::hanging(Provider::Gemini),
            ],
            &[],
        )
        .await;
        let ctx = RequestContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let response = dispatcher
            .handle(
                &ctx,
                &QueryRequest::new("hi"),
                &[Provider::OpenAi, Provider::Gemini],
                None,
            )
            .await;

        assert_eq!(response.results[&Provider::OpenAi], ProviderOutcome::Cancelled);
        assert_eq!(response.results[&Provider::Gemini], ProviderOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_panicking_unit_reports_error() {
        let dispatcher = parallel(
            vec![
                MockProvider::new(Provider::OpenAi, "ok"),
                MockProvider::new(Provider::Gemini, "unused").with_script(vec![MockReply::Panic]),
            ],
            &[],
        )
        .await;

        let response = dispatcher
            .handle(
                &RequestContext::new(),
                &QueryRequest::new("hi"),
                &[Provider::OpenAi, Provider::Gemini],
                None,
            )
            .await;

        assert!(response.results[&Provider::OpenAi].is_success());
        assert_eq!(
            response.results[&Provider::Gemini],
            ProviderOutcome::Error {
                message: "unit panicked".to_string(),
                kind: None,
                code: None,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_snapshot_refresh_stays_within_deadline() {
        let registry = Arc::new(
            ProviderRegistry::new()
                .with(Arc::new(MockProvider::new(Provider::OpenAi, "ok")))
                .with(Arc::new(
                    MockProvider::new(Provider::Gemini, "g").with_probe_delay(Duration::from_secs(10)),
                )),
        );
        let router = Arc::new(ProviderRouter::new(registry.clone(), &RouterConfig::default()));
        let dispatcher = ParallelDispatcher::new(registry, router, Duration::from_secs(30));
        let started = Instant::now();

        let response = dispatcher
            .handle(
                &RequestContext::new(),
                &QueryRequest::new("hi"),
                &[],
                Some(Duration::from_millis(100)),
            )
            .await;

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(110), "{:?}", elapsed);

        // Only the provider whose probe answered is targeted, and the
        // deadline was spent before its unit could run.
        let targets: Vec<Provider> = response.results.keys().copied().collect();
        assert_eq!(targets, vec![Provider::OpenAi]);
        assert_eq!(response.results[&Provider::OpenAi], ProviderOutcome::Timeout);
    }
}
