//! Provider registry.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use llm_dispatch_core::{traits::ProviderClient, types::Provider};

/// Request counters for one provider.
#[derive(Debug, Default)]
struct ProviderStatus {
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    last_latency_ms: AtomicU64,
}

impl ProviderStatus {
    fn record_success(&self, latency_ms: u64) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.last_latency_ms.store(latency_ms, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, provider: Provider) -> ProviderStats {
        let total = self.total_requests.load(Ordering::Relaxed);
        let failed = self.failed_requests.load(Ordering::Relaxed);
        ProviderStats {
            provider,
            total_requests: total,
            failed_requests: failed,
            failure_rate: if total == 0 { 0.0 } else { failed as f64 / total as f64 },
            last_latency_ms: self.last_latency_ms.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counters for one provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStats {
    pub provider: Provider,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub failure_rate: f64,
    pub last_latency_ms: u64,
}

/// Registry of provider clients, keyed by identity.
pub struct ProviderRegistry {
    providers: DashMap<Provider, (Arc<dyn ProviderClient>, Arc<ProviderStatus>)>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            providers: DashMap::new(),
        }
    }

    /// Register a client under its own identity, replacing any previous one.
    pub fn register(&self, client: Arc<dyn ProviderClient>) {
        let provider = client.identity();
        self.providers
            .insert(provider, (client, Arc::new(ProviderStatus::default())));
    }

    /// Builder-style registration.
    pub fn with(self, client: Arc<dyn ProviderClient>) -> Self {
        self.register(client);
        self
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn ProviderClient>> {
        self.providers.get(&provider).map(|entry| entry.value().0.clone())
    }

    pub fn contains(&self, provider: Provider) -> bool {
        self.providers.contains_key(&provider)
    }

    /// Registered providers in stable order.
    pub fn providers(&self) -> Vec<Provider> {
        let mut providers: Vec<Provider> = self.providers.iter().map(|e| *e.key()).collect();
        providers.sort();
        providers
    }

    /// Registered clients, paired with their identity.
    pub fn clients(&self) -> Vec<(Provider, Arc<dyn ProviderClient>)> {
        let mut clients: Vec<_> = self
            .providers
            .iter()
            .map(|e| (*e.key(), e.value().0.clone()))
            .collect();
        clients.sort_by_key(|(p, _)| *p);
        clients
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Record a successful call.
    pub fn record_success(&self, provider: Provider, latency_ms: u64) {
        if let Some(entry) = self.providers.get(&provider) {
            entry.value().1.record_success(latency_ms);
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self, provider: Provider) {
        if let Some(entry) = self.providers.get(&provider) {
            entry.value().1.record_failure();
        }
    }

    /// Counters for every registered provider.
    pub fn stats(&self) -> Vec<ProviderStats> {
        let mut stats: Vec<_> = self
            .providers
            .iter()
            .map(|e| e.value().1.snapshot(*e.key()))
            .collect();
        stats.sort_by_key(|s| s.provider);
        stats
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
