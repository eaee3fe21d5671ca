//! FORGE LLM - Provider Traits
//!
//! Provider-agnostic async traits for the engine's optional LLM hooks: the
//! abstractive compressor and the LLM-backed router. Concrete providers are
//! external collaborators; this crate only defines the seam, plus a
//! deterministic test double dependents can use in their own tests.

use async_trait::async_trait;
use forge_core::ForgeResult;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// A text generation provider. One method, on purpose: the compressor and
/// the router both issue a single prompt and read a single completion.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generate a completion for `prompt`, bounded by `max_tokens`.
    async fn generate(&self, prompt: &str, max_tokens: u32) -> ForgeResult<String>;

    /// Provider identifier for logs and audit metadata.
    fn name(&self) -> &str;
}

/// Deadline wrapper: callers that must not block a build on a slow provider
/// wrap the call with a timeout and treat `None` as degrade-to-heuristic.
pub async fn generate_with_timeout(
    provider: &dyn TextGenerator,
    prompt: &str,
    max_tokens: u32,
    timeout: Duration,
) -> Option<ForgeResult<String>> {
    tokio::time::timeout(timeout, provider.generate(prompt, max_tokens))
        .await
        .ok()
}

/// Scripted provider for tests: pops queued responses in order, then repeats
/// the last one. Never used in production paths.
pub struct FixedResponder {
    responses: Mutex<VecDeque<String>>,
    last: Mutex<String>,
}

impl FixedResponder {
    pub fn new(responses: Vec<String>) -> Self {
        let last = responses.last().cloned().unwrap_or_default();
        Self {
            responses: Mutex::new(responses.into()),
            last: Mutex::new(last),
        }
    }

    pub fn single(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }
}

#[async_trait]
impl TextGenerator for FixedResponder {
    async fn generate(&self, _prompt: &str, _max_tokens: u32) -> ForgeResult<String> {
        let mut queue = self.responses.lock().expect("responder lock poisoned");
        match queue.pop_front() {
            Some(response) => {
                *self.last.lock().expect("responder lock poisoned") = response.clone();
                Ok(response)
            }
            None => Ok(self.last.lock().expect("responder lock poisoned").clone()),
        }
    }

    fn name(&self) -> &str {
        "fixed_responder"
    }
}

/// Provider that always fails; exercises degradation paths in tests.
pub struct FailingProvider;

#[async_trait]
impl TextGenerator for FailingProvider {
    async fn generate(&self, _prompt: &str, _max_tokens: u32) -> ForgeResult<String> {
        Err(forge_core::ForgeError::Compress(
            forge_core::CompressError::SummarizerFailed {
                reason: "provider permanently unavailable".to_string(),
            },
        ))
    }

    fn name(&self) -> &str {
        "failing_provider"
    }
}
