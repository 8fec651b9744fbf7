use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::provider::Provider;

/// Point-in-time view of which providers are up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilitySnapshot {
    /// Provider → available.
    pub providers: BTreeMap<Provider, bool>,
    /// When the snapshot was last refreshed; `None` before the first refresh.
    pub refreshed_at: Option<DateTime<Utc>>,
    /// Refresh interval in seconds.
    pub ttl_secs: u64,
}

impl AvailabilitySnapshot {
    pub fn is_available(&self, provider: Provider) -> bool {
        self.providers.get(&provider).copied().unwrap_or(false)
    }

    /// Available providers in stable order.
    pub fn available(&self) -> Vec<Provider> {
        self.providers
            .iter()
            .filter(|(_, up)| **up)
            .map(|(p, _)| *p)
            .collect()
    }
}

/// Why the router picked a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteReason {
    /// The caller asked for this provider and it is available.
    UserPreference,
    /// The task-type affinity table mapped to this provider.
    TaskAffinity,
    /// Uniform random pick among available providers.
    Random,
    /// Replacement after a retryable failure.
    Fallback,
}

/// A routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub provider: Provider,
    pub reason: RouteReason,
}

impl RouteDecision {
    pub fn new(provider: Provider, reason: RouteReason) -> Self {
        Self { provider, reason }
    }
}
