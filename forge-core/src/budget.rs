//! Budget policy and allocation records

use crate::{OverflowStrategy, SegmentType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Token budget policy for one build. A value, not code: the allocator
/// branches on these fields and nothing else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BudgetPolicy {
    /// Total model window in tokens.
    pub max_context_tokens: u32,
    /// Tokens reserved for the model's answer. Never spent on context.
    pub output_reserved: u32,
    /// Tokens reserved for extended thinking. Never spent on context.
    pub thinking_reserved: u32,
    /// Saturation above this fraction of the content budget draws a warning.
    pub saturation_threshold: f64,
    pub overflow_strategy: OverflowStrategy,
    /// Per-type share of the elastic budget, each in [0,1], summing to <= 1.
    pub elastic_ratios: BTreeMap<SegmentType, f64>,
    /// Types that are always rigid regardless of priority.
    pub rigid_segment_types: Vec<SegmentType>,
    /// Floor for the elastic budget after rigid spend.
    pub min_elastic_tokens: u32,
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        let mut elastic_ratios = BTreeMap::new();
        elastic_ratios.insert(SegmentType::Rag, 0.35);
        elastic_ratios.insert(SegmentType::User, 0.20);
        elastic_ratios.insert(SegmentType::Assistant, 0.20);
        elastic_ratios.insert(SegmentType::FewShot, 0.10);
        elastic_ratios.insert(SegmentType::State, 0.05);
        Self {
            max_context_tokens: 128_000,
            output_reserved: 4_096,
            thinking_reserved: 0,
            saturation_threshold: 0.85,
            overflow_strategy: OverflowStrategy::TruncateLowestPriority,
            elastic_ratios,
            rigid_segment_types: vec![
                SegmentType::System,
                SegmentType::Schema,
                SegmentType::ToolDefinition,
            ],
            min_elastic_tokens: 0,
        }
    }
}

impl BudgetPolicy {
    /// Tokens available for context after both reserves.
    pub fn content_budget(&self) -> u32 {
        self.max_context_tokens
            .saturating_sub(self.output_reserved)
            .saturating_sub(self.thinking_reserved)
    }
}

/// Outcome record for one allocation. Attached to the package for
/// observability; never consulted by later stages except for saturation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BudgetAllocation {
    pub total_budget: u32,
    pub content_budget: u32,
    pub output_reserved: u32,
    pub thinking_reserved: u32,
    pub rigid_used: u32,
    /// Elastic tokens admitted, broken down by segment type.
    pub elastic_used: BTreeMap<SegmentType, u32>,
    pub total_used: u32,
    /// Segments that wanted in but did not fit.
    pub overflow_count: u32,
}

impl BudgetAllocation {
    /// Kept tokens over content budget, computed from the final kept set.
    pub fn saturation_rate(&self) -> f64 {
        if self.content_budget == 0 {
            return 0.0;
        }
        f64::from(self.total_used) / f64::from(self.content_budget)
    }

    pub fn elastic_total(&self) -> u32 {
        self.elastic_used.values().sum()
    }
}
