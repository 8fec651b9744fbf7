#![deny(unused)]
//! LLM Dispatch - query gateway for interchangeable language-model providers.
//!
//! Routes each query to an available provider by preference, task affinity,
//! or random choice, falls back once on retryable failures, caches responses,
//! and rate-limits callers.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use llm_dispatch_core::{config::AppConfig, traits::ResponseCache};
use llm_dispatch_gateway::{GatewayConfig, GatewayServer, InMemoryResponseCache, RateLimiter, RedisResponseCache};
use llm_dispatch_model_gateway::{registry_from_config, Dispatcher, ParallelDispatcher, ProviderRouter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;

    // Initialize tracing
    llm_dispatch_governance::configure_tracing(config.logging.json)?;

    tracing::info!("Starting LLM Dispatch v{}", env!("CARGO_PKG_VERSION"));

    let shutdown = CancellationToken::new();

    // =========================================================================
    // Initialize Providers & Router
    // =========================================================================
    let registry = Arc::new(registry_from_config(&config)?);
    if registry.is_empty() {
        tracing::warn!("No providers registered; every query will fail until one is configured");
    }

    let router = Arc::new(ProviderRouter::new(registry.clone(), &config.router));
    if !config.router.test_mode {
        router.refresh().await;
    }

    // =========================================================================
    // Initialize Response Cache
    // =========================================================================
    let cache: Arc<dyn ResponseCache> = match RedisResponseCache::from_config(&config.cache)? {
        Some(redis) => {
            tracing::info!("Initializing Redis Response Cache");
            Arc::new(redis)
        }
        None => {
            tracing::info!(
                max_items = config.cache.max_items,
                ttl_secs = config.cache.ttl_secs,
                enabled = config.cache.enabled,
                "Initializing In-Memory Response Cache"
            );
            let memory = Arc::new(InMemoryResponseCache::from_config(&config.cache));
            memory.spawn_cleanup(config.cache.cleanup_interval(), shutdown.clone());
            memory
        }
    };

    // =========================================================================
    // Initialize Dispatchers
    // =========================================================================
    let dispatcher = Arc::new(Dispatcher::new(router.clone(), registry.clone(), cache));
    let parallel = Arc::new(ParallelDispatcher::new(
        registry.clone(),
        router.clone(),
        config.parallel.timeout(),
    ));

    // =========================================================================
    // Initialize Observability (Metrics)
    // =========================================================================
    let metrics_handle = llm_dispatch_governance::setup_metrics_recorder()?;

    // =========================================================================
    // Initialize Gateway
    // =========================================================================
    let gateway_config = GatewayConfig::from(&config.server);
    let mut server = GatewayServer::with_shutdown(
        gateway_config.clone(),
        dispatcher,
        parallel,
        router,
        shutdown.clone(),
    )
    .with_metrics(metrics_handle);

    if config.rate_limit.enabled {
        let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));
        limiter.spawn_cleanup(
            Duration::from_secs(config.rate_limit.cleanup_interval_secs),
            shutdown.clone(),
        );
        server = server.with_rate_limiter(limiter);
        tracing::info!(
            requests_per_minute = config.rate_limit.requests_per_minute,
            burst = config.rate_limit.burst,
            "Rate limiting enabled"
        );
    }

    tracing::info!(
        host = %gateway_config.host,
        port = gateway_config.port,
        providers = ?registry.providers(),
        "Gateway initialized"
    );

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        tracing::info!("Shutdown signal received");
        signal.cancel();
    });

    server.run().await?;
    Ok(())
}
