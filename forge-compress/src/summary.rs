//! Abstractive summary compressor

use crate::{
    total_tokens, CompressContext, CompressionResult, Compressor, TruncationCompressor,
    TruncationMode,
};
use forge_core::{CompressError, ForgeResult, Segment};
use forge_llm::TextGenerator;
use std::sync::Arc;
use tracing::warn;

const SUMMARY_PROMPT: &str = "Summarize the following context fragments into a single dense \
paragraph. Preserve facts, identifiers and numbers; drop repetition and filler.\n\n";

/// Compresses by asking an external summarizer to rewrite the whole group
/// into one segment. On provider failure it falls back to tail truncation
/// unless the fallback is disabled, in which case the failure is surfaced.
pub struct SummaryCompressor {
    provider: Arc<dyn TextGenerator>,
    fallback_to_truncation: bool,
}

impl SummaryCompressor {
    pub fn new(provider: Arc<dyn TextGenerator>) -> Self {
        Self {
            provider,
            fallback_to_truncation: true,
        }
    }

    pub fn without_fallback(mut self) -> Self {
        self.fallback_to_truncation = false;
        self
    }

    fn build_prompt(segments: &[Segment]) -> String {
        let mut prompt = String::from(SUMMARY_PROMPT);
        for seg in segments {
            prompt.push_str("---\n");
            prompt.push_str(&seg.content);
            prompt.push('\n');
        }
        prompt
    }
}

#[async_trait::async_trait]
impl Compressor for SummaryCompressor {
    async fn compress(
        &self,
        segments: &[Segment],
        ctx: &CompressContext,
    ) -> ForgeResult<CompressionResult> {
        let original_tokens = total_tokens(segments);
        if segments.is_empty() || original_tokens <= u64::from(ctx.target_tokens) {
            return Ok(CompressionResult {
                segments: segments.to_vec(),
                original_tokens,
                compressed_tokens: original_tokens,
                method: self.name().to_string(),
                removed_ids: Vec::new(),
            });
        }

        let prompt = Self::build_prompt(segments);
        match self.provider.generate(&prompt, ctx.target_tokens).await {
            Ok(summary) if !summary.trim().is_empty() => {
                let parents: Vec<_> = segments.iter().map(|seg| seg.id).collect();
                let removed_ids = parents.clone();
                // The summary inherits the shape of the first segment: the
                // group shares a type tier by construction in the engine.
                let count = u32::try_from(ctx.counter.count(&summary)).unwrap_or(u32::MAX);
                let derived = segments[0]
                    .derive_compressed(summary, parents, self.name())
                    .with_token_count(count);
                let compressed_tokens = u64::from(count);
                Ok(CompressionResult {
                    segments: vec![derived],
                    original_tokens,
                    compressed_tokens,
                    method: self.name().to_string(),
                    removed_ids,
                })
            }
            Ok(_) | Err(_) if self.fallback_to_truncation => {
                warn!(
                    provider = self.provider.name(),
                    "summarizer unavailable or empty, falling back to truncation"
                );
                TruncationCompressor::new(TruncationMode::Tail)
                    .compress(segments, ctx)
                    .await
            }
            Ok(_) => Err(CompressError::SummarizerFailed {
                reason: "summarizer returned empty output".to_string(),
            }
            .into()),
            Err(err) => Err(CompressError::SummarizerFailed {
                reason: err.to_string(),
            }
            .into()),
        }
    }

    fn name(&self) -> &str {
        "llm_summary"
    }
}
