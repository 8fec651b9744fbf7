//! Mock implementations of core traits for testing.
//!
//! These mocks are shared by the unit tests of every crate in the workspace
//! and by the end-to-end tests of the binary.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::{
    context::RequestContext,
    error::{ProviderError, Result},
    traits::{ProviderClient, ResponseCache},
    types::{Provider, ProviderCompletion, QueryRequest, QueryResponse},
};

// =============================================================================
// Mock Provider
// =============================================================================

/// One scripted reply of a [`MockProvider`].
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Answer with this text.
    Text(String),
    /// Fail with this classified error.
    Fail(ProviderError),
    /// Never answer.
    Hang,
    /// Panic inside the call.
    Panic,
}

/// Scripted provider client.
///
/// Replies are consumed from the script in order; once the script is empty
/// the default reply is repeated.
pub struct MockProvider {
    provider: Provider,
    script: Mutex<VecDeque<MockReply>>,
    default_reply: MockReply,
    delay: Option<Duration>,
    probe_delay: Option<Duration>,
    available: AtomicBool,
    calls: AtomicUsize,
    availability_checks: AtomicUsize,
}

impl MockProvider {
    /// A provider that always answers with `text`.
    pub fn new(provider: Provider, text: impl Into<String>) -> Self {
        Self::with_default(provider, MockReply::Text(text.into()))
    }

    /// A provider that always fails with `error`.
    pub fn failing(provider: Provider, error: ProviderError) -> Self {
        Self::with_default(provider, MockReply::Fail(error))
    }

    /// A provider that never answers.
    pub fn hanging(provider: Provider) -> Self {
        Self::with_default(provider, MockReply::Hang)
    }

    fn with_default(provider: Provider, default_reply: MockReply) -> Self {
        Self {
            provider,
            script: Mutex::new(VecDeque::new()),
            default_reply,
            delay: None,
            probe_delay: None,
            available: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            availability_checks: AtomicUsize::new(0),
        }
    }

    /// Queue replies to be returned before the default.
    pub fn with_script(self, replies: Vec<MockReply>) -> Self {
        *self.script.lock().unwrap() = replies.into();
        self
    }

    /// Wait this long before replying.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Wait this long before answering an availability check.
    pub fn with_probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = Some(delay);
        self
    }

    /// Start out unavailable.
    pub fn unavailable(self) -> Self {
        self.set_available(false);
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of `query` calls made.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of `check_availability` calls made.
    pub fn availability_checks(&self) -> usize {
        self.availability_checks.load(Ordering::SeqCst)
    }

    fn next_reply(&self) -> MockReply {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_reply.clone())
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    fn identity(&self) -> Provider {
        self.provider
    }

    async fn query(
        &self,
        _ctx: &RequestContext,
        text: &str,
        _model_version: Option<&str>,
    ) -> Result<ProviderCompletion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.next_reply();

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match reply {
            MockReply::Text(response) => Ok(ProviderCompletion {
                input_tokens: (text.len() / 4) as u64,
                output_tokens: (response.len() / 4) as u64,
                text: response,
            }),
            MockReply::Fail(error) => Err(error.into()),
            MockReply::Hang => std::future::pending().await,
            MockReply::Panic => panic!("{} mock panicked", self.provider),
        }
    }

    async fn check_availability(&self) -> bool {
        self.availability_checks.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.probe_delay {
            tokio::time::sleep(delay).await;
        }
        self.available.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Mock Response Cache
// =============================================================================

/// Unbounded, non-expiring cache that counts lookups.
#[derive(Default)]
pub struct MockResponseCache {
    entries: Mutex<HashMap<String, QueryResponse>>,
    gets: AtomicUsize,
    sets: AtomicUsize,
}

impl MockResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn set_count(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResponseCache for MockResponseCache {
    async fn get(&self, request: &QueryRequest) -> Result<Option<QueryResponse>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        Ok(self.entries.lock().unwrap().get(&request.cache_key()).cloned())
    }

    async fn set(&self, request: &QueryRequest, response: &QueryResponse) -> Result<()> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.entries
            .lock()
            .unwrap()
            .insert(request.cache_key(), response.clone());
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.entries.lock().unwrap().clear();
        Ok(())
    }
}
