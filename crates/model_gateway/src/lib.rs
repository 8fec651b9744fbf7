#![deny(unused)]
//! Model gateway: provider selection, fallback, and dispatch.
//!
//! This crate provides:
//! - Provider registry with per-provider request statistics
//! - Availability-aware routing with task affinity and fallback
//! - Retry with exponential backoff and jitter
//! - Single-query dispatch (cache → route → invoke → fallback → cache)
//! - Parallel fan-out of one query to several providers
//! - Rig-backed provider clients

pub mod dispatcher;
pub mod parallel;
pub mod providers;
pub mod retry;
pub mod rig_client;
pub mod router;

pub use dispatcher::Dispatcher;
pub use parallel::ParallelDispatcher;
pub use providers::{ProviderRegistry, ProviderStats};
pub use retry::RetryPolicy;
pub use rig_client::{RigConfig, RigProviderClient};
pub use router::ProviderRouter;

use std::sync::Arc;

use llm_dispatch_core::{config::AppConfig, Result};

/// Build a registry with a Rig client for every enabled provider in `config`.
///
/// Providers without a Rig backend are skipped with a warning; they can still
/// be registered by hand with another [`ProviderClient`](llm_dispatch_core::ProviderClient).
pub fn registry_from_config(config: &AppConfig) -> Result<ProviderRegistry> {
    let registry = ProviderRegistry::new();
    let retry = RetryPolicy::new(config.retry.clone());

    for (provider, settings) in config.enabled_providers() {
        if !RigProviderClient::supports(provider) {
            tracing::warn!(provider = %provider, "No Rig backend for provider, skipping");
            continue;
        }
        let mut rig_cfg = RigConfig::new(provider, &settings.model);
        if let Some(prompt) = &settings.system_prompt {
            rig_cfg = rig_cfg.with_system_prompt(prompt.clone());
        }
        let client = RigProviderClient::new(rig_cfg)?.with_retry(retry.clone());
        registry.register(Arc::new(client));
        tracing::info!(provider = %provider, model = %settings.model, "Registered provider");
    }

    Ok(registry)
}
