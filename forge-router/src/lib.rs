//! FORGE Router - Model Selection
//!
//! Two-stage decision per request: a heuristic complexity estimator scores
//! the query, then priority-ordered rules pick a model, falling back to the
//! default when nothing matches or the target is unavailable. An optional
//! LLM-backed router can sit in front and must degrade to the rule-based
//! path on any failure or timeout.

use async_trait::async_trait;
use forge_core::{ForgeResult, RoutingDecision, SegmentType};

mod complexity;
mod rules;
mod llm;

pub use complexity::{ComplexityEstimator, ComplexitySignals};

pub use rules::RuleRouter;

pub use llm::LlmRouter;

/// The routing view of one build request.
#[derive(Debug, Clone, Default)]
pub struct RouteRequest {
    /// Concatenated user-facing query text.
    pub query: String,
    /// Estimated token count of the whole input.
    pub token_count: u64,
    /// Segment types present in the request.
    pub segment_types: Vec<SegmentType>,
}

/// A router decides which model serves a request. Implementations must be
/// deterministic for identical rules and inputs.
#[async_trait]
pub trait Router: Send + Sync {
    async fn route(&self, request: &RouteRequest) -> ForgeResult<RoutingDecision>;

    fn name(&self) -> &str;
}
