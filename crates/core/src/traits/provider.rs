//! Provider client trait.

use async_trait::async_trait;

use crate::context::RequestContext;
use crate::error::Result;
use crate::types::{Provider, ProviderCompletion};

/// A vendor-specific language-model client.
///
/// Implementations surface every failure as a classified
/// [`ProviderError`](crate::error::ProviderError) so the router can decide
/// whether to fall back.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Which provider this client talks to.
    fn identity(&self) -> Provider;

    /// Send `text` to the provider, honoring the context's cancellation
    /// and deadline.
    async fn query(
        &self,
        ctx: &RequestContext,
        text: &str,
        model_version: Option<&str>,
    ) -> Result<ProviderCompletion>;

    /// Cheap probe of whether the provider can currently be used.
    async fn check_availability(&self) -> bool;
}
