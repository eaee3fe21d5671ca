//! Allocate stage: delegate to the budget manager

use crate::{PipelineContext, PipelineStage};
use async_trait::async_trait;
use forge_budget::{BidWeights, BudgetManager};
use forge_core::{ForgeResult, Segment};
use tracing::debug;

/// The decision stage: hands the segment list to the three-tier budget
/// manager and keeps only what was admitted. All allocation audit entries
/// and warnings merge into the pipeline context.
pub struct AllocateStage {
    weights: BidWeights,
}

impl AllocateStage {
    pub fn new() -> Self {
        Self {
            weights: BidWeights::default(),
        }
    }

    pub fn with_weights(mut self, weights: BidWeights) -> Self {
        self.weights = weights;
        self
    }
}

impl Default for AllocateStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PipelineStage for AllocateStage {
    fn name(&self) -> &str {
        "allocate"
    }

    async fn process(
        &self,
        segments: Vec<Segment>,
        ctx: &mut PipelineContext,
    ) -> ForgeResult<Vec<Segment>> {
        let manager =
            BudgetManager::new(ctx.policy.budget.clone()).with_weights(self.weights);
        let outcome = manager.allocate(&segments, &ctx.cancel)?;

        ctx.audit_log.extend(outcome.audit);
        ctx.warnings.extend(outcome.warnings);

        if ctx.debug {
            debug!(
                kept = outcome.kept.len(),
                dropped = outcome.dropped.len(),
                saturation = format!("{:.3}", outcome.allocation.saturation_rate()),
                "allocation complete"
            );
        }
        ctx.budget_allocation = Some(outcome.allocation);
        Ok(outcome.kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::{PolicyConfig, SegmentType};
    use forge_tokenizer::TokenizerRegistry;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_allocation_recorded_in_context() {
        let mut policy = PolicyConfig::default();
        policy.budget.max_context_tokens = 1_000;
        policy.budget.output_reserved = 100;
        let mut ctx = PipelineContext::new(
            "m",
            Arc::new(policy),
            Arc::new(TokenizerRegistry::new()),
        );
        let segments = vec![
            Segment::new(SegmentType::System, "sys").with_token_count(50),
            Segment::new(SegmentType::Rag, "chunk").with_token_count(100).with_seq(1),
        ];
        let out = AllocateStage::new().process(segments, &mut ctx).await.unwrap();
        assert_eq!(out.len(), 2);
        let allocation = ctx.budget_allocation.unwrap();
        assert_eq!(allocation.rigid_used, 50);
        assert_eq!(allocation.total_used, 150);
        assert_eq!(ctx.audit_log.len(), 2);
    }
}
