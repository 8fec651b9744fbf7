//! Axum-based HTTP server for the gateway.

use axum::{
    extract::{Json, MatchedPath, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use llm_dispatch_core::{
    config::ServerConfig,
    traits::ResponseCache,
    types::{
        AvailabilitySnapshot, ParallelQueryResponse, Provider, QueryRequest, QueryResponse,
    },
    Error, ErrorKind, RequestContext, Result,
};
use llm_dispatch_governance::metrics::{
    track_query, track_request, track_tokens, QueryOutcome,
};
use llm_dispatch_model_gateway::{
    Dispatcher, ParallelDispatcher, ProviderRegistry, ProviderRouter, ProviderStats,
};

use crate::rate_limit::{rate_limit_middleware, RateLimiter};

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to bind to.
    pub port: u16,
    /// Deadline applied to every query.
    pub request_timeout: Duration,
    /// Longest accepted query, in characters.
    pub max_query_length: usize,
    /// Enable CORS.
    pub enable_cors: bool,
    /// Enable request tracing.
    pub enable_tracing: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for GatewayConfig {
    fn from(server: &ServerConfig) -> Self {
        Self {
            host: server.host.clone(),
            port: server.port,
            request_timeout: server.request_timeout(),
            max_query_length: server.max_query_length,
            enable_cors: true,
            enable_tracing: true,
        }
    }
}

/// Shared application state.
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub parallel: Arc<ParallelDispatcher>,
    pub router: Arc<ProviderRouter>,
    pub registry: Arc<ProviderRegistry>,
    pub cache: Arc<dyn ResponseCache>,
    pub request_timeout: Duration,
    pub max_query_length: usize,
    /// Cancelled on server shutdown; every request context derives from it.
    pub shutdown: CancellationToken,
}

impl AppState {
    fn request_context(&self) -> RequestContext {
        RequestContext::with_token(self.shutdown.child_token()).child_with_timeout(self.request_timeout)
    }
}

/// Gateway server.
pub struct GatewayServer {
    config: GatewayConfig,
    state: Arc<AppState>,
    rate_limiter: Option<Arc<RateLimiter>>,
    metrics_handle: Option<PrometheusHandle>,
}

impl GatewayServer {
    /// Create a new gateway server.
    pub fn new(
        config: GatewayConfig,
        dispatcher: Arc<Dispatcher>,
        parallel: Arc<ParallelDispatcher>,
        router: Arc<ProviderRouter>,
    ) -> Self {
        Self::with_shutdown(config, dispatcher, parallel, router, CancellationToken::new())
    }

    /// Create a server whose in-flight requests are cancelled with `shutdown`.
    pub fn with_shutdown(
        config: GatewayConfig,
        dispatcher: Arc<Dispatcher>,
        parallel: Arc<ParallelDispatcher>,
        router: Arc<ProviderRouter>,
        shutdown: CancellationToken,
    ) -> Self {
        let state = AppState {
            cache: dispatcher.cache().clone(),
            registry: router.registry().clone(),
            dispatcher,
            parallel,
            router,
            request_timeout: config.request_timeout,
            max_query_length: config.max_query_length,
            shutdown,
        };
        Self {
            config,
            state: Arc::new(state),
            rate_limiter: None,
            metrics_handle: None,
        }
    }

    /// Apply per-client and global rate limits to `/v1` routes.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Set metrics handle.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// Build the Axum router.
    pub fn build_router(&self) -> Router {
        let mut api = Router::new()
            .route("/v1/query", post(query_handler))
            .route("/v1/query/parallel", post(parallel_query_handler))
            .route("/v1/providers", get(providers_handler))
            .route("/v1/cache", delete(flush_cache_handler))
            .with_state(self.state.clone());

        if let Some(limiter) = &self.rate_limiter {
            api = api.layer(middleware::from_fn_with_state(limiter.clone(), rate_limit_middleware));
        }

        let mut router = Router::new().route("/health", get(health_handler)).merge(api);

        if let Some(handle) = &self.metrics_handle {
            let handle = handle.clone();
            router = router.route("/metrics", get(move || async move { handle.render() }));
        }

        router = router.layer(middleware::from_fn(metrics_middleware));

        if self.config.enable_cors {
            router = router.layer(CorsLayer::new().allow_origin(Any).allow_methods(Any));
        }

        if self.config.enable_tracing {
            router = router.layer(TraceLayer::new_for_http());
        }

        router
    }

    /// Run the server until the shutdown token is cancelled.
    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::gateway(format!("Failed to bind: {}", e)))?;

        tracing::info!(addr = %addr, "Gateway server starting");

        let shutdown = self.state.shutdown.clone();
        axum::serve(
            listener,
            self.build_router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::gateway(format!("Server error: {}", e)))?;

        tracing::info!("Gateway server stopped");
        Ok(())
    }
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Parallel query request.
#[derive(Debug, Deserialize)]
pub struct ParallelQueryRequest {
    #[serde(flatten)]
    pub request: QueryRequest,
    /// Providers to query; all available providers when empty.
    #[serde(default)]
    pub providers: Vec<Provider>,
    /// Shared deadline override, in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Provider listing.
#[derive(Debug, Serialize)]
pub struct ProvidersResponse {
    pub availability: AvailabilitySnapshot,
    pub stats: Vec<ProviderStats>,
}

/// Health response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Status.
    pub status: String,
    /// Version.
    pub version: String,
}

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code.
    pub code: String,
    /// Error message.
    pub message: String,
    /// Request ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// An error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    pub error: Error,
    pub request_id: Option<String>,
}

impl ApiError {
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self {
            error,
            request_id: None,
        }
    }
}

/// HTTP status for an error.
pub fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        Error::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        Error::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        Error::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Error::AllProvidersFailed { .. } => StatusCode::BAD_GATEWAY,
        Error::Provider(e) => match e.kind {
            ErrorKind::RateLimit => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::InvalidResponse | ErrorKind::EmptyResponse => StatusCode::BAD_GATEWAY,
            ErrorKind::MissingCredential => StatusCode::INTERNAL_SERVER_ERROR,
        },
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Stable machine-readable code for an error.
pub fn error_code(error: &Error) -> &'static str {
    match error {
        Error::InvalidRequest(_) => "invalid_request",
        Error::RateLimited => "rate_limited",
        Error::Cancelled => "cancelled",
        Error::DeadlineExceeded => "deadline_exceeded",
        Error::AllProvidersFailed { .. } => "all_providers_failed",
        Error::Provider(e) => e.kind.as_str(),
        _ => "internal_error",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.error);
        if status.is_server_error() {
            tracing::error!(error = %self.error, request_id = ?self.request_id, "Request failed");
        }
        let body = ErrorResponse {
            code: error_code(&self.error).to_string(),
            message: self.error.to_string(),
            request_id: self.request_id,
        };
        (status, Json(body)).into_response()
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Single query handler.
async fn query_handler(
    State(state): State<Arc<AppState>>,
    Json(mut payload): Json<QueryRequest>,
) -> std::result::Result<Json<QueryResponse>, ApiError> {
    let request_id = payload
        .request_id
        .get_or_insert_with(|| Uuid::new_v4().to_string())
        .clone();

    payload
        .validate(state.max_query_length)
        .map_err(|e| ApiError::from(e).with_request_id(&request_id))?;

    tracing::info!(
        request_id = %request_id,
        provider = ?payload.provider,
        task_type = ?payload.task_type,
        query_len = payload.query.len(),
        "Processing query"
    );

    let started = Instant::now();
    let ctx = state.request_context();
    let result = state.dispatcher.handle(&ctx, &payload).await;
    let latency = started.elapsed().as_secs_f64();

    match result {
        Ok(response) => {
            let outcome = if response.cached {
                QueryOutcome::Cached
            } else if response.original_provider.is_some() {
                QueryOutcome::Fallback
            } else {
                QueryOutcome::Success
            };
            track_query(Some(response.provider), outcome, latency);
            if !response.cached {
                track_tokens(response.provider, response.input_tokens, response.output_tokens);
            }
            Ok(Json(response))
        }
        Err(error) => {
            let provider = error.as_provider_error().and_then(|e| e.provider);
            track_query(provider, QueryOutcome::Error, latency);
            Err(ApiError::from(error).with_request_id(request_id))
        }
    }
}

/// Parallel query handler.
async fn parallel_query_handler(
    State(state): State<Arc<AppState>>,
    Json(mut payload): Json<ParallelQueryRequest>,
) -> std::result::Result<Json<ParallelQueryResponse>, ApiError> {
    let request_id = payload
        .request
        .request_id
        .get_or_insert_with(|| Uuid::new_v4().to_string())
        .clone();

    payload
        .request
        .validate(state.max_query_length)
        .map_err(|e| ApiError::from(e).with_request_id(&request_id))?;

    tracing::info!(
        request_id = %request_id,
        providers = ?payload.providers,
        "Processing parallel query"
    );

    let ctx = state.request_context();
    let response = state
        .parallel
        .handle(
            &ctx,
            &payload.request,
            &payload.providers,
            payload.timeout_ms.map(Duration::from_millis),
        )
        .await;

    for (provider, outcome) in &response.results {
        let outcome = if outcome.is_success() {
            QueryOutcome::Success
        } else {
            QueryOutcome::Error
        };
        track_query(Some(*provider), outcome, response.latency_ms as f64 / 1000.0);
    }

    Ok(Json(response))
}

/// Availability and per-provider request counters.
async fn providers_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(ProvidersResponse {
        availability: state.router.availability_snapshot().await,
        stats: state.registry.stats(),
    })
}

/// Drop every cached response.
async fn flush_cache_handler(
    State(state): State<Arc<AppState>>,
) -> std::result::Result<StatusCode, ApiError> {
    state.cache.flush().await?;
    tracing::info!("Response cache flushed");
    Ok(StatusCode::NO_CONTENT)
}

/// Record request count and latency per route.
async fn metrics_middleware(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let response = next.run(request).await;

    track_request(
        &method,
        &path,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}
