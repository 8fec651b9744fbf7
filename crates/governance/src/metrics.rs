//! Metrics implementation using Prometheus.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use llm_dispatch_core::{types::Provider, Error, Result};

/// Initialize Prometheus recorder and return the handle.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle> {
    let builder = PrometheusBuilder::new();

    let handle = builder
        .install_recorder()
        .map_err(|e| Error::internal(format!("Failed to install Prometheus recorder: {}", e)))?;

    tracing::info!("Prometheus metrics recorder initialized");
    Ok(handle)
}

/// Helper to track HTTP request metrics (latency, count).
pub fn track_request(method: &str, path: &str, status: u16, latency_sec: f64) {
    metrics::counter!(
        "http_requests_total",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "http_request_duration_seconds",
        "method" => method.to_string(),
        "path" => path.to_string()
    )
    .record(latency_sec);
}

/// Outcome label of a dispatched query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    Success,
    Cached,
    Fallback,
    Error,
}

impl QueryOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Cached => "cached",
            Self::Fallback => "fallback",
            Self::Error => "error",
        }
    }
}

/// Count a query and record its latency against the serving provider.
///
/// Failures with no single provider to blame are labelled `none`.
pub fn track_query(provider: Option<Provider>, outcome: QueryOutcome, latency_sec: f64) {
    let provider = provider.as_ref().map(Provider::as_str).unwrap_or("none");

    metrics::counter!(
        "llm_queries_total",
        "provider" => provider,
        "outcome" => outcome.as_str()
    )
    .increment(1);

    metrics::histogram!("llm_query_duration_seconds", "provider" => provider).record(latency_sec);
}

/// Helper to track token usage.
pub fn track_tokens(provider: Provider, prompt: u64, completion: u64) {
    metrics::counter!("llm_token_usage_total", "provider" => provider.as_str(), "type" => "prompt").increment(prompt);
    metrics::counter!("llm_token_usage_total", "provider" => provider.as_str(), "type" => "completion").increment(completion);
}

/// Count a cache lookup.
pub fn track_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    metrics::counter!("llm_cache_lookups_total", "result" => result).increment(1);
}

/// Count a request rejected by the rate limiter.
pub fn track_rate_limited() {
    metrics::counter!("llm_rate_limited_total").increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_labels() {
        assert_eq!(QueryOutcome::Success.as_str(), "success");
        assert_eq!(QueryOutcome::Cached.as_str(), "cached");
        assert_eq!(QueryOutcome::Fallback.as_str(), "fallback");
        assert_eq!(QueryOutcome::Error.as_str(), "error");
    }

    #[test]
    fn test_helpers_without_recorder_are_noops() {
        // With no recorder installed the facade discards everything.
        track_query(Some(Provider::OpenAi), QueryOutcome::Success, 0.25);
        track_query(None, QueryOutcome::Error, 0.01);
        track_tokens(Provider::Claude, 10, 20);
        track_cache_lookup(true);
        track_rate_limited();
        track_request("POST", "/v1/query", 200, 0.3);
    }
}
