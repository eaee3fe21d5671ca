//! LLM-backed router with heuristic degradation

use crate::{RouteRequest, Router, RuleRouter};
use async_trait::async_trait;
use dashmap::DashMap;
use forge_core::{ComplexityLevel, ForgeResult, RoutingDecision};
use forge_llm::{generate_with_timeout, TextGenerator};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const CLASSIFY_PROMPT: &str = "Classify the complexity of the following request. Reply with \
exactly one word: simple, moderate, complex, or expert.\n\nRequest:\n";

/// Routes via an LLM classification of the query, degrading to the rule
/// router on any provider failure, timeout, or unparseable reply. Timeouts
/// are heuristic-continue: the build proceeds on the rule path and nothing
/// is treated as a detection or an error.
///
/// Successful classifications are cached by query hash so repeated queries
/// do not pay for repeated calls; failures are never cached.
pub struct LlmRouter {
    provider: Arc<dyn TextGenerator>,
    rules: RuleRouter,
    timeout: Duration,
    decisions: DashMap<String, ComplexityLevel>,
}

impl LlmRouter {
    pub fn new(provider: Arc<dyn TextGenerator>, rules: RuleRouter) -> Self {
        Self {
            provider,
            rules,
            timeout: Duration::from_secs(2),
            decisions: DashMap::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn query_hash(query: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(query.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn parse_level(reply: &str) -> Option<ComplexityLevel> {
        let normalized = reply.trim().to_lowercase();
        let first_word = normalized.split_whitespace().next()?;
        match first_word.trim_matches(|c: char| !c.is_alphabetic()) {
            "simple" => Some(ComplexityLevel::Simple),
            "moderate" => Some(ComplexityLevel::Moderate),
            "complex" => Some(ComplexityLevel::Complex),
            "expert" => Some(ComplexityLevel::Expert),
            _ => None,
        }
    }

    async fn classify(&self, query: &str) -> Option<ComplexityLevel> {
        let hash = Self::query_hash(query);
        if let Some(cached) = self.decisions.get(&hash) {
            debug!("classification served from decision cache");
            return Some(*cached);
        }

        let prompt = format!("{CLASSIFY_PROMPT}{query}");
        match generate_with_timeout(self.provider.as_ref(), &prompt, 4, self.timeout).await {
            Some(Ok(reply)) => match Self::parse_level(&reply) {
                Some(level) => {
                    self.decisions.insert(hash, level);
                    Some(level)
                }
                None => {
                    warn!(reply = %reply.trim(), "unparseable classification, degrading to rules");
                    None
                }
            },
            Some(Err(err)) => {
                warn!(error = %err, "classifier failed, degrading to rules");
                None
            }
            None => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "classifier timed out, degrading to rules");
                None
            }
        }
    }
}

#[async_trait]
impl Router for LlmRouter {
    async fn route(&self, request: &RouteRequest) -> ForgeResult<RoutingDecision> {
        let override_level = self.classify(&request.query).await;
        let mut decision = self.rules.route_with(request, override_level);
        if override_level.is_some() {
            decision.reasoning = format!("llm-classified; {}", decision.reasoning);
        }
        Ok(decision)
    }

    fn name(&self) -> &str {
        "llm_router"
    }
}
