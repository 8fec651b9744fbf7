//! End-to-end pipeline: probing router, in-memory cache, dispatch, fallback
//! and parallel fan-out, wired the way the binary wires them.

use std::sync::Arc;
use std::time::Duration;

use llm_dispatch_core::config::{CacheConfig, RouterConfig};
use llm_dispatch_core::mocks::{MockProvider, MockReply};
use llm_dispatch_core::{
    Error, ErrorKind, Provider, ProviderError, ProviderOutcome, QueryRequest, RequestContext,
    TaskType,
};
use llm_dispatch_gateway::InMemoryResponseCache;
use llm_dispatch_model_gateway::{Dispatcher, ParallelDispatcher, ProviderRegistry, ProviderRouter};

struct Stack {
    openai: Arc<MockProvider>,
    gemini: Arc<MockProvider>,
    mistral: Arc<MockProvider>,
    cache: Arc<InMemoryResponseCache>,
    dispatcher: Dispatcher,
    parallel: ParallelDispatcher,
}

fn stack(openai: MockProvider, gemini: MockProvider, mistral: MockProvider) -> Stack {
    let openai = Arc::new(openai);
    let gemini = Arc::new(gemini);
    let mistral = Arc::new(mistral);
    let registry = Arc::new(
        ProviderRegistry::new()
            .with(openai.clone())
            .with(gemini.clone())
            .with(mistral.clone()),
    );
    let router = Arc::new(ProviderRouter::new(registry.clone(), &RouterConfig::default()).with_seed(11));
    let cache = Arc::new(InMemoryResponseCache::from_config(&CacheConfig::default()));

    Stack {
        dispatcher: Dispatcher::new(router.clone(), registry.clone(), cache.clone()),
        parallel: ParallelDispatcher::new(registry, router, Duration::from_secs(5)),
        openai,
        gemini,
        mistral,
        cache,
    }
}

#[tokio::test]
async fn test_unavailable_preference_is_rerouted_and_cached() {
    let s = stack(
        MockProvider::new(Provider::OpenAi, "openai says hi"),
        MockProvider::new(Provider::Gemini, "unused").unavailable(),
        MockProvider::new(Provider::Mistral, "mistral says hi").unavailable(),
    );
    let request = QueryRequest::new("hello").with_provider(Provider::Gemini);

    let first = s.dispatcher.handle(&RequestContext::new(), &request).await.unwrap();
    assert_eq!(first.provider, Provider::OpenAi);
    assert!(!first.cached);

    let second = s.dispatcher.handle(&RequestContext::new(), &request).await.unwrap();
    assert!(second.cached);
    assert_eq!(second.response, "openai says hi");

    assert_eq!(s.openai.call_count(), 1);
    assert_eq!(s.gemini.call_count(), 0);
    assert_eq!(s.cache.stats().await.hits, 1);
}

#[tokio::test]
async fn test_affinity_then_fallback_after_rate_limit() {
    let s = stack(
        MockProvider::new(Provider::OpenAi, "openai answer"),
        MockProvider::new(Provider::Gemini, "unused").unavailable(),
        MockProvider::new(Provider::Mistral, "mistral answer").with_script(vec![MockReply::Fail(
            ProviderError::rate_limit(Provider::Mistral, "429"),
        )]),
    );
    let request = QueryRequest::new("what is rust?").with_task_type(TaskType::QuestionAnswering);

    let response = s.dispatcher.handle(&RequestContext::new(), &request).await.unwrap();

    assert_eq!(response.provider, Provider::OpenAi);
    assert_eq!(response.original_provider, Some(Provider::Mistral));
    assert_eq!(response.retries, 1);
    assert_eq!(s.mistral.call_count(), 1);
}

#[tokio::test]
async fn test_non_retryable_failure_surfaces_kind() {
    let s = stack(
        MockProvider::failing(Provider::OpenAi, ProviderError::empty_response(Provider::OpenAi)),
        MockProvider::new(Provider::Gemini, "unused"),
        MockProvider::new(Provider::Mistral, "unused"),
    );
    let request = QueryRequest::new("hello").with_provider(Provider::OpenAi);

    let err = s.dispatcher.handle(&RequestContext::new(), &request).await.unwrap_err();

    assert!(matches!(err, Error::Provider(_)));
    assert!(err.is_kind(ErrorKind::EmptyResponse));
    assert_eq!(s.gemini.call_count() + s.mistral.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_parallel_over_available_providers() {
    let s = stack(
        MockProvider::new(Provider::OpenAi, "fast").with_delay(Duration::from_millis(20)),
        MockProvider::hanging(Provider::Gemini),
        MockProvider::new(Provider::Mistral, "unused").unavailable(),
    );

    let response = s
        .parallel
        .handle(
            &RequestContext::new(),
            &QueryRequest::new("hello"),
            &[],
            Some(Duration::from_millis(100)),
        )
        .await;

    let targets: Vec<Provider> = response.results.keys().copied().collect();
    assert_eq!(targets, vec![Provider::OpenAi, Provider::Gemini]);
    assert!(response.results[&Provider::OpenAi].is_success());
    assert_eq!(response.results[&Provider::Gemini], ProviderOutcome::Timeout);
    assert!(response.latency_ms >= 100);
}
