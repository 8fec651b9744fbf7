use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::provider::{Provider, TaskType};
use crate::error::{Error, ErrorKind, Result};

// =============================================================================
// Request Types
// =============================================================================

/// A single text query to be dispatched to a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Query text.
    pub query: String,
    /// Explicit provider preference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
    /// Task hint used for affinity routing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<TaskType>,
    /// Provider-specific model version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    /// Caller-supplied request identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Fields that identify a request semantically. Serialized as JSON before
/// hashing so that field boundaries are explicit.
#[derive(Serialize)]
struct CacheKeyMaterial<'a> {
    query: &'a str,
    provider: Option<Provider>,
    task_type: Option<TaskType>,
}

impl QueryRequest {
    /// Create a request with only query text.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            provider: None,
            task_type: None,
            model_version: None,
            request_id: None,
        }
    }

    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = Some(task_type);
        self
    }

    pub fn with_model_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = Some(version.into());
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Reject empty queries and queries longer than `max_len` characters.
    pub fn validate(&self, max_len: usize) -> Result<()> {
        if self.query.trim().is_empty() {
            return Err(Error::invalid_request("query must not be empty"));
        }
        let len = self.query.chars().count();
        if len > max_len {
            return Err(Error::invalid_request(format!(
                "query length {} exceeds maximum of {}",
                len, max_len
            )));
        }
        Ok(())
    }

    /// Deterministic cache key over `{query, provider, task_type}`.
    ///
    /// Model version and request id do not participate: two requests that
    /// ask the same thing of the same provider share a cache slot.
    pub fn cache_key(&self) -> String {
        let material = CacheKeyMaterial {
            query: &self.query,
            provider: self.provider,
            task_type: self.task_type,
        };
        // Serializing a struct of strings and unit enums cannot fail.
        let bytes = serde_json::to_vec(&material).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        format!("{:x}", hasher.finalize())
    }
}

// =============================================================================
// Response Types
// =============================================================================

/// What a provider client returns for one successful call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCompletion {
    /// Generated text.
    pub text: String,
    /// Prompt tokens.
    pub input_tokens: u64,
    /// Completion tokens.
    pub output_tokens: u64,
}

/// Normalized response returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Response text.
    pub response: String,
    /// Provider that actually served the request.
    pub provider: Provider,
    /// Request identifier (echoed or generated).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// End-to-end latency in milliseconds.
    pub latency_ms: u64,
    /// Whether the response came from the cache.
    pub cached: bool,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    /// Number of re-dispatches after the first attempt.
    pub retries: u32,
    /// Provider that failed before a fallback served the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_provider: Option<Provider>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u16>,
}

impl QueryResponse {
    /// Build a response from a provider completion.
    pub fn from_completion(provider: Provider, completion: ProviderCompletion, latency_ms: u64) -> Self {
        Self {
            total_tokens: completion.input_tokens + completion.output_tokens,
            response: completion.text,
            provider,
            request_id: None,
            latency_ms,
            cached: false,
            input_tokens: completion.input_tokens,
            output_tokens: completion.output_tokens,
            retries: 0,
            original_provider: None,
            error: None,
            error_code: None,
        }
    }
}

// =============================================================================
// Parallel Query Types
// =============================================================================

/// Outcome of one provider in a parallel query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProviderOutcome {
    /// The provider answered.
    Success { response: QueryResponse },
    /// The provider failed.
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<ErrorKind>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<u16>,
    },
    /// The shared deadline elapsed first.
    Timeout,
    /// The caller cancelled the query.
    Cancelled,
}

impl ProviderOutcome {
    /// Map a failed call onto an outcome.
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::DeadlineExceeded => Self::Timeout,
            Error::Cancelled => Self::Cancelled,
            other => Self::Error {
                message: other.to_string(),
                kind: other.kind(),
                code: other.as_provider_error().map(|e| e.code),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Aggregated result of querying several providers at once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelQueryResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// One entry per requested provider.
    pub results: BTreeMap<Provider, ProviderOutcome>,
    /// Wall-clock time of the whole fan-out.
    pub latency_ms: u64,
}

impl ParallelQueryResponse {
    /// Number of providers that answered.
    pub fn success_count(&self) -> usize {
        self.results.values().filter(|o| o.is_success()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;

    #[test]
    fn test_cache_key_identical_requests_collide() {
        let a = QueryRequest::new("hello")
            .with_provider(Provider::OpenAi)
            .with_task_type(TaskType::Summarization)
            .with_request_id("a");
        let b = QueryRequest::new("hello")
            .with_provider(Provider::OpenAi)
            .with_task_type(TaskType::Summarization)
            .with_request_id("b");
        assert_eq!(a.cache_key(), b.cache_key());
        assert_eq!(a.cache_key().len(), 64);
    }

    #[test]
    fn test_cache_key_distinguishes_task_type() {
        let a = QueryRequest::new("hello").with_task_type(TaskType::Summarization);
        let b = QueryRequest::new("hello").with_task_type(TaskType::Sentiment);
        let c = QueryRequest::new("hello");
        assert_ne!(a.cache_key(), b.cache_key());
        assert_ne!(a.cache_key(), c.cache_key());
    }

    #[test]
    fn test_cache_key_distinguishes_provider() {
        let a = QueryRequest::new("hello").with_provider(Provider::OpenAi);
        let b = QueryRequest::new("hello").with_provider(Provider::Gemini);
        let c = QueryRequest::new("hello");
        assert_ne!(a.cache_key(), b.cache_key());
        assert_ne!(a.cache_key(), c.cache_key());
    }

    #[test]
    fn test_cache_key_field_boundaries() {
        // Moving text between fields must not produce the same key.
        let a = QueryRequest::new("summarize openai");
        let b = QueryRequest::new("summarize").with_provider(Provider::OpenAi);
        assert_ne!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn test_validate() {
        assert!(QueryRequest::new("ok").validate(10).is_ok());
        assert!(matches!(
            QueryRequest::new("   ").validate(10),
            Err(Error::InvalidRequest(_))
        ));
        assert!(QueryRequest::new("x".repeat(11)).validate(10).is_err());
    }

    #[test]
    fn test_request_deserializes_with_optional_fields() {
        let req: QueryRequest = serde_json::from_str(
            r#"{"query":"hi","provider":"gemini","task_type":"qa"}"#,
        )
        .unwrap();
        assert_eq!(req.provider, Some(Provider::Gemini));
        assert_eq!(req.task_type, Some(TaskType::QuestionAnswering));
        assert!(req.model_version.is_none());
    }

    #[test]
    fn test_outcome_from_error() {
        assert_eq!(ProviderOutcome::from_error(&Error::DeadlineExceeded), ProviderOutcome::Timeout);
        assert_eq!(ProviderOutcome::from_error(&Error::Cancelled), ProviderOutcome::Cancelled);

        let err: Error = ProviderError::empty_response(Provider::Mistral).into();
        match ProviderOutcome::from_error(&err) {
            ProviderOutcome::Error { kind, code, .. } => {
                assert_eq!(kind, Some(ErrorKind::EmptyResponse));
                assert_eq!(code, Some(502));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_from_completion_totals_tokens() {
        let response = QueryResponse::from_completion(
            Provider::Claude,
            ProviderCompletion {
                text: "hi".into(),
                input_tokens: 3,
                output_tokens: 4,
            },
            12,
        );
        assert_eq!(response.total_tokens, 7);
        assert!(!response.cached);
        assert_eq!(response.retries, 0);
    }
}
