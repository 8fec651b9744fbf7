//! Error types for the dispatch gateway.
//!
//! Provider failures are classified into a small, closed set of kinds so that
//! retry and fallback decisions switch on [`ErrorKind`] and the `retryable`
//! flag instead of inspecting error text.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::types::Provider;

/// Result type alias using the gateway's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Classified failure kinds for provider calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// The provider call exceeded its deadline.
    Timeout,
    /// The provider signalled throttling.
    RateLimit,
    /// The provider returned a payload that could not be parsed.
    InvalidResponse,
    /// The provider returned no content.
    EmptyResponse,
    /// The provider is not configured (no API key).
    MissingCredential,
    /// No provider is currently able to serve the request.
    Unavailable,
}

impl ErrorKind {
    /// Numeric code attached to errors of this kind.
    pub fn code(self) -> u16 {
        match self {
            Self::Timeout => 504,
            Self::RateLimit => 429,
            Self::InvalidResponse | Self::EmptyResponse => 502,
            Self::MissingCredential => 401,
            Self::Unavailable => 503,
        }
    }

    /// Whether errors of this kind are retryable unless overridden.
    pub fn default_retryable(self) -> bool {
        matches!(self, Self::Timeout | Self::RateLimit | Self::Unavailable)
    }

    /// Stable wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimit => "rate-limit",
            Self::InvalidResponse => "invalid-response",
            Self::EmptyResponse => "empty-response",
            Self::MissingCredential => "missing-credential",
            Self::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified provider error.
///
/// Constructors fix `code` and the default `retryable` flag from the kind;
/// [`ProviderError::with_retryable`] overrides the flag when a provider knows
/// better (e.g. a rate limit with a daily quota that will not reset soon).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderError {
    /// Provider that produced the error, if any.
    pub provider: Option<Provider>,
    /// Numeric code.
    pub code: u16,
    /// Classified kind.
    pub kind: ErrorKind,
    /// Whether a retry or fallback may succeed.
    pub retryable: bool,
    /// Human-readable detail.
    pub message: String,
}

impl ProviderError {
    /// Create a classified error of the given kind.
    pub fn new(provider: Option<Provider>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            provider,
            code: kind.code(),
            kind,
            retryable: kind.default_retryable(),
            message: message.into(),
        }
    }

    pub fn timeout(provider: Provider, message: impl Into<String>) -> Self {
        Self::new(Some(provider), ErrorKind::Timeout, message)
    }

    pub fn rate_limit(provider: Provider, message: impl Into<String>) -> Self {
        Self::new(Some(provider), ErrorKind::RateLimit, message)
    }

    pub fn invalid_response(provider: Provider, message: impl Into<String>) -> Self {
        Self::new(Some(provider), ErrorKind::InvalidResponse, message)
    }

    pub fn empty_response(provider: Provider) -> Self {
        Self::new(Some(provider), ErrorKind::EmptyResponse, "provider returned no content")
    }

    pub fn missing_credential(provider: Provider, message: impl Into<String>) -> Self {
        Self::new(Some(provider), ErrorKind::MissingCredential, message)
    }

    /// No provider can serve the request. `provider` is `None` when the
    /// failure is not attributable to a single backend.
    pub fn unavailable(provider: Option<Provider>, message: impl Into<String>) -> Self {
        Self::new(provider, ErrorKind::Unavailable, message)
    }

    /// Override the default retryability.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.provider {
            Some(provider) => write!(f, "{} error from {} ({}): {}", self.kind, provider, self.code, self.message),
            None => write!(f, "{} error ({}): {}", self.kind, self.code, self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Core error type for the gateway.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Provider Errors
    // =========================================================================
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("All providers failed (attempted: {}): {source}", format_providers(.attempted))]
    AllProvidersFailed {
        attempted: Vec<Provider>,
        source: ProviderError,
    },

    // =========================================================================
    // Request Lifecycle Errors
    // =========================================================================
    #[error("Request cancelled by caller")]
    Cancelled,

    #[error("Request deadline exceeded")]
    DeadlineExceeded,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    // =========================================================================
    // Component Errors
    // =========================================================================
    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // =========================================================================
    // Generic Errors
    // =========================================================================
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn format_providers(providers: &[Provider]) -> String {
    providers
        .iter()
        .map(Provider::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Create a gateway error.
    pub fn gateway(msg: impl Into<String>) -> Self {
        Self::Gateway(msg.into())
    }

    /// Create an invalid request error.
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a cache error.
    pub fn cache(msg: impl Into<String>) -> Self {
        Self::Cache(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// The classified provider error, if this is one.
    pub fn as_provider_error(&self) -> Option<&ProviderError> {
        match self {
            Self::Provider(e) => Some(e),
            Self::AllProvidersFailed { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Kind of the classified error, if any.
    pub fn kind(&self) -> Option<ErrorKind> {
        self.as_provider_error().map(|e| e.kind)
    }

    /// Whether this error is a classified error of `kind`.
    pub fn is_kind(&self, kind: ErrorKind) -> bool {
        self.kind() == Some(kind)
    }

    /// Only a single classified provider error marked retryable qualifies;
    /// an exhausted fallback is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Provider(e) if e.retryable)
    }

    /// Cancellation and deadline errors originate from the caller, not a provider.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}
