//! Rule-based router

use crate::{ComplexityEstimator, RouteRequest, Router};
use async_trait::async_trait;
use forge_core::{
    ComplexityLevel, ForgeResult, ModelTarget, RouterError, RoutingDecision, RoutingRuleConfig,
    RuleConditionConfig, SegmentType,
};
use regex::Regex;
use std::collections::HashMap;
use tracing::debug;

/// Parsed token-count range: ">N", "<N", "N-M" or exact "N".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenRange {
    GreaterThan(u64),
    LessThan(u64),
    Between(u64, u64),
    Exactly(u64),
}

impl TokenRange {
    fn parse(expression: &str) -> Result<Self, RouterError> {
        let invalid = |reason: &str| RouterError::InvalidRange {
            expression: expression.to_string(),
            reason: reason.to_string(),
        };
        let trimmed = expression.trim();
        if let Some(rest) = trimmed.strip_prefix('>') {
            return rest
                .trim()
                .parse()
                .map(TokenRange::GreaterThan)
                .map_err(|_| invalid("expected a number after '>'"));
        }
        if let Some(rest) = trimmed.strip_prefix('<') {
            return rest
                .trim()
                .parse()
                .map(TokenRange::LessThan)
                .map_err(|_| invalid("expected a number after '<'"));
        }
        if let Some((low, high)) = trimmed.split_once('-') {
            let low: u64 = low
                .trim()
                .parse()
                .map_err(|_| invalid("expected a number before '-'"))?;
            let high: u64 = high
                .trim()
                .parse()
                .map_err(|_| invalid("expected a number after '-'"))?;
            if low > high {
                return Err(invalid("range lower bound exceeds upper bound"));
            }
            return Ok(TokenRange::Between(low, high));
        }
        trimmed
            .parse()
            .map(TokenRange::Exactly)
            .map_err(|_| invalid("expected '>N', '<N', 'N-M' or 'N'"))
    }

    fn contains(&self, value: u64) -> bool {
        match self {
            TokenRange::GreaterThan(n) => value > *n,
            TokenRange::LessThan(n) => value < *n,
            TokenRange::Between(low, high) => (*low..=*high).contains(&value),
            TokenRange::Exactly(n) => value == *n,
        }
    }
}

enum CompiledCondition {
    Complexity(ComplexityLevel),
    Keyword(Regex),
    TokenCount(TokenRange),
    SegmentTypePresent(SegmentType),
}

struct CompiledRule {
    name: String,
    priority: i32,
    condition: CompiledCondition,
    target_model: String,
    fallback_model: Option<String>,
    budget_adjustment: Option<forge_core::BudgetAdjustment>,
}

impl CompiledRule {
    fn matches(&self, request: &RouteRequest, complexity: ComplexityLevel) -> bool {
        match &self.condition {
            CompiledCondition::Complexity(level) => complexity == *level,
            CompiledCondition::Keyword(regex) => regex.is_match(&request.query),
            CompiledCondition::TokenCount(range) => range.contains(request.token_count),
            CompiledCondition::SegmentTypePresent(seg_type) => {
                request.segment_types.contains(seg_type)
            }
        }
    }
}

/// Priority-ordered first-match router over declarative rules. Given the
/// same rules and inputs the decision is identical; nothing here consults
/// clocks, randomness, or external state.
pub struct RuleRouter {
    rules: Vec<CompiledRule>,
    models: HashMap<String, ModelTarget>,
    default_model: String,
    estimator: ComplexityEstimator,
}

impl RuleRouter {
    /// Compile declarative rules. Fails fast on a bad regex or range so a
    /// misconfigured policy cannot silently skip a rule.
    pub fn new(
        default_model: impl Into<String>,
        models: Vec<ModelTarget>,
        rules: &[RoutingRuleConfig],
    ) -> ForgeResult<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let condition = match &rule.condition {
                RuleConditionConfig::Complexity(level) => CompiledCondition::Complexity(*level),
                RuleConditionConfig::Keyword(pattern) => CompiledCondition::Keyword(
                    Regex::new(pattern).map_err(|e| RouterError::InvalidPattern {
                        rule: rule.name.clone(),
                        reason: e.to_string(),
                    })?,
                ),
                RuleConditionConfig::TokenCount(expression) => {
                    CompiledCondition::TokenCount(TokenRange::parse(expression)?)
                }
                RuleConditionConfig::SegmentTypePresent(seg_type) => {
                    CompiledCondition::SegmentTypePresent(*seg_type)
                }
            };
            compiled.push(CompiledRule {
                name: rule.name.clone(),
                priority: rule.priority,
                condition,
                target_model: rule.target_model.clone(),
                fallback_model: rule.fallback_model.clone(),
                budget_adjustment: rule.budget_adjustment,
            });
        }
        // Descending priority; equal priorities keep declaration order.
        compiled.sort_by_key(|rule| std::cmp::Reverse(rule.priority));

        Ok(Self {
            rules: compiled,
            models: models.into_iter().map(|m| (m.id.clone(), m)).collect(),
            default_model: default_model.into(),
            estimator: ComplexityEstimator::new(),
        })
    }

    fn resolve_model(&self, id: &str) -> Option<ModelTarget> {
        self.models.get(id).filter(|m| m.available).cloned()
    }

    fn default_target(&self) -> ModelTarget {
        self.resolve_model(&self.default_model)
            .unwrap_or_else(|| ModelTarget::new(self.default_model.clone(), 0.0, 128_000))
    }

    /// Rule matching with an optional complexity override, used by the LLM
    /// router when its classifier succeeded. The heuristic signals still
    /// supply the confidence either way.
    pub fn route_with(
        &self,
        request: &RouteRequest,
        complexity_override: Option<ComplexityLevel>,
    ) -> RoutingDecision {
        let signals = self.estimator.signals(&request.query);
        let complexity = complexity_override.unwrap_or(signals.estimated_level);

        for rule in &self.rules {
            if !rule.matches(request, complexity) {
                continue;
            }

            // Matched: the target wins unless it is unavailable, in which
            // case the rule's fallback, then the global default.
            if let Some(model) = self.resolve_model(&rule.target_model) {
                debug!(rule = %rule.name, model = %model.id, "routing rule matched");
                return RoutingDecision {
                    selected_model: model,
                    complexity,
                    matched_rule: Some(rule.name.clone()),
                    is_fallback: false,
                    confidence: signals.confidence,
                    reasoning: format!(
                        "rule '{}' matched (complexity {complexity}, score {:.1})",
                        rule.name, signals.score
                    ),
                    budget_adjustment: rule.budget_adjustment,
                };
            }

            if let Some(fallback) = rule
                .fallback_model
                .as_deref()
                .and_then(|id| self.resolve_model(id))
            {
                debug!(rule = %rule.name, model = %fallback.id, "target unavailable, rule fallback");
                return RoutingDecision {
                    selected_model: fallback,
                    complexity,
                    matched_rule: Some(rule.name.clone()),
                    is_fallback: true,
                    confidence: signals.confidence,
                    reasoning: format!(
                        "rule '{}' matched but target '{}' is unavailable; using rule fallback",
                        rule.name, rule.target_model
                    ),
                    budget_adjustment: rule.budget_adjustment,
                };
            }

            debug!(rule = %rule.name, "target and fallback unavailable, using default");
            return RoutingDecision {
                selected_model: self.default_target(),
                complexity,
                matched_rule: Some(rule.name.clone()),
                is_fallback: true,
                confidence: signals.confidence,
                reasoning: format!(
                    "rule '{}' matched but no usable target; using default model",
                    rule.name
                ),
                budget_adjustment: rule.budget_adjustment,
            };
        }

        RoutingDecision {
            selected_model: self.default_target(),
            complexity,
            matched_rule: None,
            is_fallback: true,
            confidence: signals.confidence,
            reasoning: format!("no rule matched (complexity {complexity}); using default model"),
            budget_adjustment: None,
        }
    }
}

#[async_trait]
impl Router for RuleRouter {
    async fn route(&self, request: &RouteRequest) -> ForgeResult<RoutingDecision> {
        Ok(self.route_with(request, None))
    }

    fn name(&self) -> &str {
        "rule_router"
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn fixture() -> RuleRouter {
        let rules = vec![
            RoutingRuleConfig {
                name: "small".to_string(),
                priority: 20,
                condition: RuleConditionConfig::TokenCount("<100".to_string()),
                target_model: "fast-tier".to_string(),
                fallback_model: None,
                budget_adjustment: None,
            },
            RoutingRuleConfig {
                name: "large".to_string(),
                priority: 10,
                condition: RuleConditionConfig::TokenCount(">1000".to_string()),
                target_model: "expert-tier".to_string(),
                fallback_model: None,
                budget_adjustment: None,
            },
        ];
        RuleRouter::new(
            "default-tier",
            vec![
                ModelTarget::new("fast-tier", 0.0, 128_000),
                ModelTarget::new("expert-tier", 0.0, 200_000),
                ModelTarget::new("default-tier", 0.0, 128_000),
            ],
            &rules,
        )
        .expect("fixture rules compile")
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        /// Router determinism: the same rules and the same inputs always
        /// produce the same decision.
        #[test]
        fn prop_route_with_deterministic(
            query in ".{0,300}",
            tokens in 0u64..5_000,
        ) {
            let router = fixture();
            let request = RouteRequest {
                query,
                token_count: tokens,
                segment_types: vec![SegmentType::User],
            };
            let first = router.route_with(&request, None);
            let second = router.route_with(&request, None);
            prop_assert_eq!(first, second);
        }

        /// Token ranges partition the decision space the way the rules say.
        #[test]
        fn prop_token_ranges_respected(tokens in 0u64..5_000) {
            let router = fixture();
            let request = RouteRequest {
                query: String::new(),
                token_count: tokens,
                segment_types: Vec::new(),
            };
            let decision = router.route_with(&request, None);
            let expected = if tokens < 100 {
                "fast-tier"
            } else if tokens > 1_000 {
                "expert-tier"
            } else {
                "default-tier"
            };
            prop_assert_eq!(decision.selected_model.id, expected);
        }
    }
}
