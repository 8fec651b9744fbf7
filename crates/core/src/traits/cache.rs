//! Response cache trait.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{QueryRequest, QueryResponse};

/// Store of previously served responses, keyed by
/// [`QueryRequest::cache_key`].
#[async_trait]
pub trait ResponseCache: Send + Sync {
    /// Look up a live entry for the request.
    async fn get(&self, request: &QueryRequest) -> Result<Option<QueryResponse>>;

    /// Store a response for the request.
    async fn set(&self, request: &QueryRequest, response: &QueryResponse) -> Result<()>;

    /// Drop every entry.
    async fn flush(&self) -> Result<()>;
}
