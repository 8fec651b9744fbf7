use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::types::{Provider, TaskType};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub router: RouterConfig,
    pub retry: RetryConfig,
    pub parallel: ParallelConfig,
    pub providers: BTreeMap<Provider, ProviderSettings>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_ms: u64,
    pub max_query_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            request_timeout_ms: 30_000,
            max_query_length: 8_000,
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_minute: u32,
    pub burst: u32,
    pub client_retention_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: 120,
            burst: 30,
            client_retention_secs: 24 * 60 * 60,
            cleanup_interval_secs: 10 * 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_items: usize,
    /// How often the in-process store sweeps expired entries.
    pub cleanup_interval_secs: u64,
    /// Use Redis instead of the in-process store when set.
    pub redis_url: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 60 * 60,
            max_items: 10_000,
            cleanup_interval_secs: 5 * 60,
            redis_url: None,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RouterConfig {
    pub availability_ttl_secs: u64,
    /// Disable automatic availability refresh.
    pub test_mode: bool,
    pub task_affinity: HashMap<TaskType, Provider>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            availability_ttl_secs: 5 * 60,
            test_mode: false,
            task_affinity: default_task_affinity(),
        }
    }
}

impl RouterConfig {
    pub fn availability_ttl(&self) -> Duration {
        Duration::from_secs(self.availability_ttl_secs)
    }
}

/// Which provider is presumed best at each task.
pub fn default_task_affinity() -> HashMap<TaskType, Provider> {
    HashMap::from([
        (TaskType::Generation, Provider::OpenAi),
        (TaskType::Summarization, Provider::Claude),
        (TaskType::Sentiment, Provider::Gemini),
        (TaskType::QuestionAnswering, Provider::Mistral),
    ])
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub factor: f64,
    /// Fractional perturbation, e.g. 0.2 for ±20%.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            factor: 2.0,
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ParallelConfig {
    pub timeout_ms: u64,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

impl ParallelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderSettings {
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Default model when a request does not name one.
    pub model: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub json: bool,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("LLM_DISPATCH_ENV").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(File::with_name("config/local").required(false))
            // Map APP__SERVER__PORT=3000 to server.port
            .add_source(Environment::with_prefix("APP").separator("__"))
            .build()?;

        s.try_deserialize()
    }

    /// Enabled providers and their settings.
    pub fn enabled_providers(&self) -> impl Iterator<Item = (Provider, &ProviderSettings)> {
        self.providers
            .iter()
            .filter(|(_, settings)| settings.enabled)
            .map(|(provider, settings)| (*provider, settings))
    }
}
