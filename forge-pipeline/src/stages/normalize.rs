//! Normalize stage: NFC, invisible-char stripping, token counting

use crate::{PipelineContext, PipelineStage};
use async_trait::async_trait;
use forge_core::{AuditEntry, Decision, ForgeResult, ReasonCode, Segment};
use forge_sanitize::{SanitizeOutcome, Sanitizer, UnicodeNormalizer};
use tracing::debug;

/// First stage of every pipeline. Unicode NFC plus invisible-character
/// stripping, empty-segment removal, and token-count population - nothing
/// downstream may touch budget math before counts exist.
pub struct NormalizeStage {
    normalizer: UnicodeNormalizer,
}

impl NormalizeStage {
    pub fn new() -> Self {
        Self {
            normalizer: UnicodeNormalizer::new(),
        }
    }
}

impl Default for NormalizeStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PipelineStage for NormalizeStage {
    fn name(&self) -> &str {
        "normalize"
    }

    async fn process(
        &self,
        segments: Vec<Segment>,
        ctx: &mut PipelineContext,
    ) -> ForgeResult<Vec<Segment>> {
        let counter = ctx.registry.resolve(&ctx.model)?;
        let mut result = Vec::with_capacity(segments.len());

        for seg in segments {
            let outcome: SanitizeOutcome = self
                .normalizer
                .sanitize(&seg.content)
                .map_err(|reason| forge_core::SanitizeError::SanitizerFailed {
                    sanitizer: "unicode_normalizer".to_string(),
                    reason,
                })?;

            let changed = outcome.content != seg.content.as_ref();
            if changed {
                ctx.audit_log.push(AuditEntry::new(
                    seg.id,
                    Decision::Sanitize,
                    ReasonCode::SanitizeUnicodeNormalized,
                    format!(
                        "normalized to NFC, {} characters removed",
                        seg.content.chars().count() - outcome.content.chars().count()
                    ),
                    self.name(),
                    0,
                ));
            }

            if outcome.content.trim().is_empty() {
                ctx.audit_log.push(AuditEntry::new(
                    seg.id,
                    Decision::Drop,
                    ReasonCode::SelectLowRelevance,
                    "empty after normalization",
                    self.name(),
                    0,
                ));
                continue;
            }

            // Transformed content invalidates any carried count; untouched
            // segments keep a pre-populated count (prefix-cache reuse).
            let seg = if changed {
                seg.replacing_content(outcome.content)
            } else {
                seg
            };
            let seg = if seg.token_count.is_none() {
                let count = u32::try_from(counter.count(&seg.content)).unwrap_or(u32::MAX);
                seg.with_token_count(count)
            } else {
                seg
            };
            result.push(seg);
        }

        if ctx.debug {
            let total: u64 = result
                .iter()
                .map(|s| u64::from(s.token_count.unwrap_or(0)))
                .sum();
            debug!(segments = result.len(), total_tokens = total, "normalize complete");
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::{PolicyConfig, SegmentType};
    use forge_tokenizer::TokenizerRegistry;
    use std::sync::Arc;

    fn ctx() -> PipelineContext {
        PipelineContext::new(
            "unknown-model",
            Arc::new(PolicyConfig::default()),
            Arc::new(TokenizerRegistry::new()),
        )
    }

    #[tokio::test]
    async fn test_token_counts_populated() {
        let mut ctx = ctx();
        let segments = vec![Segment::new(SegmentType::User, "hello world")];
        let out = NormalizeStage::new().process(segments, &mut ctx).await.unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].token_count.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_empty_segment_dropped_with_audit() {
        let mut ctx = ctx();
        let segments = vec![
            Segment::new(SegmentType::User, "   \u{200B}  "),
            Segment::new(SegmentType::User, "real content"),
        ];
        let dropped_id = segments[0].id;
        let out = NormalizeStage::new().process(segments, &mut ctx).await.unwrap();
        assert_eq!(out.len(), 1);
        let entry = ctx
            .audit_log
            .iter()
            .find(|e| e.segment_id == dropped_id && e.decision == Decision::Drop)
            .unwrap();
        assert_eq!(entry.reason_code, ReasonCode::SelectLowRelevance);
    }

    #[tokio::test]
    async fn test_zero_width_stripped_and_audited() {
        let mut ctx = ctx();
        let segments = vec![Segment::new(SegmentType::User, "pass\u{200B}word")];
        let out = NormalizeStage::new().process(segments, &mut ctx).await.unwrap();
        assert_eq!(out[0].content.as_ref(), "password");
        assert!(ctx
            .audit_log
            .iter()
            .any(|e| e.reason_code == ReasonCode::SanitizeUnicodeNormalized));
    }

    #[tokio::test]
    async fn test_unchanged_content_not_audited() {
        let mut ctx = ctx();
        let segments = vec![Segment::new(SegmentType::User, "clean")];
        let _ = NormalizeStage::new().process(segments, &mut ctx).await.unwrap();
        assert!(ctx.audit_log.is_empty());
    }
}
