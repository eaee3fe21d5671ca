//! Compress stage: saturation-triggered engine invocation

use crate::{PipelineContext, PipelineStage};
use async_trait::async_trait;
use forge_compress::CompressEngine;
use forge_core::{ForgeResult, Segment};
use std::sync::Arc;
use tracing::debug;

/// Runs the compression engine over the budgeted set. Compression saves
/// budget only under budget pressure, so this stage sits after Allocate and
/// lets the engine's saturation trigger decide whether to do anything.
pub struct CompressStage {
    engine: Arc<CompressEngine>,
}

impl CompressStage {
    pub fn new(engine: Arc<CompressEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl PipelineStage for CompressStage {
    fn name(&self) -> &str {
        "compress"
    }

    async fn process(
        &self,
        segments: Vec<Segment>,
        ctx: &mut PipelineContext,
    ) -> ForgeResult<Vec<Segment>> {
        let available = ctx.policy.budget.content_budget();
        let counter = ctx.registry.resolve(&ctx.model)?;
        let model = ctx.model.clone();

        let before: u64 = segments
            .iter()
            .map(|seg| u64::from(seg.token_count.unwrap_or(0)))
            .sum();

        let compressed = self
            .engine
            .compress(
                &segments,
                available,
                &model,
                counter,
                &mut ctx.audit_log,
                &mut ctx.warnings,
            )
            .await?;

        let after: u64 = compressed
            .iter()
            .map(|seg| u64::from(seg.token_count.unwrap_or(0)))
            .sum();

        // Saturation is defined over the final kept set; keep the
        // allocation record in step with what compression changed.
        if let Some(allocation) = ctx.budget_allocation.as_mut() {
            allocation.total_used = u32::try_from(after).unwrap_or(u32::MAX);
        }

        if ctx.debug && after != before {
            debug!(before, after, "compression changed kept tokens");
        }
        Ok(compressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_compress::{TruncationCompressor, TruncationMode};
    use forge_core::{PolicyConfig, Priority, SegmentType};
    use forge_tokenizer::TokenizerRegistry;

    #[tokio::test]
    async fn test_compression_updates_allocation() {
        let mut policy = PolicyConfig::default();
        policy.budget.max_context_tokens = 500;
        policy.budget.output_reserved = 0;
        let mut ctx = PipelineContext::new(
            "unknown-model",
            Arc::new(policy),
            Arc::new(TokenizerRegistry::new()),
        );
        ctx.budget_allocation = Some(forge_core::BudgetAllocation {
            content_budget: 500,
            total_used: 800,
            ..Default::default()
        });

        let engine = Arc::new(CompressEngine::new(
            0.6,
            true,
            10,
            Arc::new(TruncationCompressor::new(TruncationMode::Tail)),
        ));
        // CharCounter for unknown models: 4 chars per token.
        let segments: Vec<Segment> = (0..8)
            .map(|i| {
                Segment::new(SegmentType::Rag, "x".repeat(400))
                    .with_priority(Priority::Low)
                    .with_token_count(100)
                    .with_seq(i)
            })
            .collect();

        let out = CompressStage::new(engine)
            .process(segments, &mut ctx)
            .await
            .unwrap();
        let total: u64 = out.iter().map(|s| u64::from(s.token_count.unwrap())).sum();
        assert!(total <= 500);
        assert_eq!(
            ctx.budget_allocation.unwrap().total_used as u64,
            total
        );
    }
}
