//! Routing decision types

use crate::ComplexityLevel;
use serde::{Deserialize, Serialize};

/// A model the router can select.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTarget {
    pub id: String,
    /// Blended cost per input token, in USD.
    pub cost_per_token: f64,
    pub max_context_tokens: u32,
    /// Unavailable targets are skipped in favour of the rule's fallback.
    pub available: bool,
}

impl ModelTarget {
    pub fn new(id: impl Into<String>, cost_per_token: f64, max_context_tokens: u32) -> Self {
        Self {
            id: id.into(),
            cost_per_token,
            max_context_tokens,
            available: true,
        }
    }
}

/// Budget adjustment a routing rule may request for the selected model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct BudgetAdjustment {
    /// Replace `max_context_tokens` for this request, if set.
    pub max_context_tokens: Option<u32>,
    /// Replace `output_reserved` for this request, if set.
    pub output_reserved: Option<u32>,
}

/// The router's verdict for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub selected_model: ModelTarget,
    pub complexity: ComplexityLevel,
    /// Name of the rule that matched, if any.
    pub matched_rule: Option<String>,
    /// True when the decision came from the fallback chain rather than a rule.
    pub is_fallback: bool,
    /// Confidence in [0,1].
    pub confidence: f64,
    /// Human-readable account of why this model was selected.
    pub reasoning: String,
    pub budget_adjustment: Option<BudgetAdjustment>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_round_trip() {
        let decision = RoutingDecision {
            selected_model: ModelTarget::new("fast-tier", 0.000_000_3, 128_000),
            complexity: ComplexityLevel::Simple,
            matched_rule: Some("short-factual".into()),
            is_fallback: false,
            confidence: 0.8,
            reasoning: "short query, no reasoning keywords".into(),
            budget_adjustment: None,
        };
        let json = serde_json::to_string(&decision).unwrap();
        let back: RoutingDecision = serde_json::from_str(&json).unwrap();
        assert_eq!(back, decision);
    }
}
