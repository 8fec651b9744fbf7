//! Rig provider client adapter.
//!
//! Wraps Rig's agents for integration with our ProviderClient trait.

use async_trait::async_trait;

use llm_dispatch_core::{
    traits::ProviderClient,
    types::{Provider, ProviderCompletion},
    Error, ProviderError, RequestContext, Result,
};

// Import required Rig traits
use rig::client::{CompletionClient, ProviderClient as _};
use rig::completion::{CompletionError, Prompt, PromptError};

use crate::retry::RetryPolicy;

/// Configuration for a Rig client.
#[derive(Debug, Clone, PartialEq)]
pub struct RigConfig {
    /// Provider to call.
    pub provider: Provider,
    /// Default model name.
    pub model: String,
    /// System prompt.
    pub system_prompt: Option<String>,
}

impl RigConfig {
    pub fn new(provider: Provider, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            system_prompt: None,
        }
    }

    /// Set system prompt.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

/// Environment variable holding the API key for a Rig-backed provider.
fn api_key_var(provider: Provider) -> Option<&'static str> {
    match provider {
        Provider::OpenAi => Some("OPENAI_API_KEY"),
        Provider::Claude => Some("ANTHROPIC_API_KEY"),
        Provider::Gemini => Some("GEMINI_API_KEY"),
        Provider::Mistral => Some("MISTRAL_API_KEY"),
        Provider::Vertex | Provider::Bedrock => None,
    }
}

/// Build a Rig agent for `$module`, prompt it once and yield the raw result.
macro_rules! prompt_with {
    ($module:ident, $model:expr, $system:expr, $text:expr) => {{
        use rig::providers::$module;

        let client = $module::Client::from_env();
        let mut agent_builder = client.agent($model);
        if let Some(system) = $system {
            agent_builder = agent_builder.preamble(system);
        }
        agent_builder.build().prompt($text).await
    }};
}

/// Rig-based provider client.
///
/// Each call runs under the request context and is wrapped by the client's
/// own retry policy.
pub struct RigProviderClient {
    config: RigConfig,
    retry: RetryPolicy,
}

impl RigProviderClient {
    /// Whether Rig has a backend for `provider`.
    pub fn supports(provider: Provider) -> bool {
        api_key_var(provider).is_some()
    }

    /// Create a client for the configured provider.
    pub fn new(config: RigConfig) -> Result<Self> {
        if !Self::supports(config.provider) {
            return Err(Error::config(format!(
                "no Rig backend for provider {}",
                config.provider
            )));
        }
        if config.model.trim().is_empty() {
            return Err(Error::config(format!("no model configured for {}", config.provider)));
        }
        Ok(Self {
            config,
            retry: RetryPolicy::none(),
        })
    }

    /// Retry retryable failures with `policy`.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn config(&self) -> &RigConfig {
        &self.config
    }

    fn has_credentials(&self) -> bool {
        api_key_var(self.config.provider)
            .and_then(|var| std::env::var(var).ok())
            .is_some_and(|key| !key.trim().is_empty())
    }

    async fn prompt_once(&self, model: &str, text: &str) -> Result<String> {
        let provider = self.config.provider;

        // Check env var first to avoid panic
        if !self.has_credentials() {
            let var = api_key_var(provider).unwrap_or("API key");
            return Err(ProviderError::missing_credential(provider, format!("{} not set", var)).into());
        }

        let system = self.config.system_prompt.as_deref();
        let result = match provider {
            Provider::OpenAi => prompt_with!(openai, model, system, text),
            Provider::Claude => prompt_with!(anthropic, model, system, text),
            Provider::Gemini => prompt_with!(gemini, model, system, text),
            Provider::Mistral => prompt_with!(mistral, model, system, text),
            Provider::Vertex | Provider::Bedrock => {
                return Err(Error::config(format!("no Rig backend for provider {}", provider)));
            }
        };

        let response: String = result.map_err(|e| classify_prompt_error(provider, e))?;
        if response.trim().is_empty() {
            return Err(ProviderError::empty_response(provider).into());
        }
        Ok(response)
    }
}

/// Map a Rig failure onto the error taxonomy.
fn classify_prompt_error(provider: Provider, err: PromptError) -> Error {
    let classified = match err {
        PromptError::CompletionError(inner) => match inner {
            CompletionError::HttpError(e) => ProviderError::unavailable(Some(provider), e.to_string()),
            CompletionError::JsonError(e) => ProviderError::invalid_response(provider, e.to_string()),
            CompletionError::ResponseError(msg) => ProviderError::invalid_response(provider, msg),
            CompletionError::ProviderError(msg) => classify_provider_message(provider, msg),
            other => ProviderError::unavailable(Some(provider), other.to_string()),
        },
        other => ProviderError::invalid_response(provider, other.to_string()),
    };
    classified.into()
}

/// Vendors report throttling and overload only through the message body of
/// their error payload.
fn classify_provider_message(provider: Provider, msg: String) -> ProviderError {
    let lower = msg.to_ascii_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("rate_limit") {
        ProviderError::rate_limit(provider, msg)
    } else if lower.contains("timeout") || lower.contains("timed out") {
        ProviderError::timeout(provider, msg)
    } else if lower.contains("401") || lower.contains("unauthorized") || lower.contains("api key") {
        ProviderError::missing_credential(provider, msg)
    } else if lower.contains("503") || lower.contains("overloaded") || lower.contains("unavailable") {
        ProviderError::unavailable(Some(provider), msg)
    } else {
        ProviderError::invalid_response(provider, msg)
    }
}

#[async_trait]
impl ProviderClient for RigProviderClient {
    fn identity(&self) -> Provider {
        self.config.provider
    }

    async fn query(
        &self,
        ctx: &RequestContext,
        text: &str,
        model_version: Option<&str>,
    ) -> Result<ProviderCompletion> {
        let model = model_version.unwrap_or(&self.config.model);
        tracing::debug!(
            provider = %self.config.provider,
            model = %model,
            prompt_len = text.len(),
            "Calling LLM"
        );

        let response = self
            .retry
            .run(ctx, |_| ctx.run(self.prompt_once(model, text)))
            .await?;

        Ok(ProviderCompletion {
            input_tokens: (text.len() / 4) as u64,
            output_tokens: (response.len() / 4) as u64,
            text: response,
        })
    }

    async fn check_availability(&self) -> bool {
        self.has_credentials()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llm_dispatch_core::ErrorKind;

    #[test]
    fn test_config_builder() {
        let config = RigConfig::new(Provider::Claude, "claude-3-5-haiku-latest")
            .with_system_prompt("You are a helpful assistant");

        assert_eq!(config.provider, Provider::Claude);
        assert_eq!(config.model, "claude-3-5-haiku-latest");
        assert_eq!(config.system_prompt, Some("You are a helpful assistant".to_string()));
    }

    #[test]
    fn test_supported_providers() {
        assert!(RigProviderClient::supports(Provider::OpenAi));
        assert!(RigProviderClient::supports(Provider::Claude));
        assert!(RigProviderClient::supports(Provider::Gemini));
        assert!(RigProviderClient::supports(Provider::Mistral));
        assert!(!RigProviderClient::supports(Provider::Vertex));
        assert!(!RigProviderClient::supports(Provider::Bedrock));
    }

    #[test]
    fn test_new_rejects_unsupported_or_unnamed_model() {
        assert!(matches!(
            RigProviderClient::new(RigConfig::new(Provider::Bedrock, "titan")),
            Err(Error::Config(_))
        ));
        assert!(RigProviderClient::new(RigConfig::new(Provider::OpenAi, " ")).is_err());

        let client = RigProviderClient::new(RigConfig::new(Provider::Mistral, "mistral-small-latest")).unwrap();
        assert_eq!(client.identity(), Provider::Mistral);
        assert_eq!(client.config().model, "mistral-small-latest");
    }

    #[test]
    fn test_provider_message_classification() {
        let cases = [
            ("HTTP 429 Too Many Requests", ErrorKind::RateLimit),
            ("rate_limit_error: slow down", ErrorKind::RateLimit),
            ("upstream request timed out", ErrorKind::Timeout),
            ("401 Unauthorized", ErrorKind::MissingCredential),
            ("model is overloaded", ErrorKind::Unavailable),
            ("unexpected field `choices`", ErrorKind::InvalidResponse),
        ];
        for (msg, kind) in cases {
            let err = classify_provider_message(Provider::OpenAi, msg.to_string());
            assert_eq!(err.kind, kind, "{}", msg);
            assert_eq!(err.provider, Some(Provider::OpenAi));
        }
    }

    #[test]
    fn test_completion_error_classification() {
        let err = classify_prompt_error(
            Provider::Gemini,
            PromptError::CompletionError(CompletionError::ResponseError("no candidates".into())),
        );
        assert!(err.is_kind(ErrorKind::InvalidResponse));
        assert!(!err.is_retryable());

        let err = classify_prompt_error(
            Provider::Gemini,
            PromptError::CompletionError(CompletionError::ProviderError("429 quota".into())),
        );
        assert!(err.is_kind(ErrorKind::RateLimit));
        assert!(err.is_retryable());
    }
}
