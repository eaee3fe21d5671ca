//! Sanitize stage: the zero-trust chain applied per segment

use crate::{PipelineContext, PipelineStage};
use async_trait::async_trait;
use forge_cache::{segment_key, TieredCache};
use forge_core::{
    AuditEntry, Decision, ForgeResult, InjectionAction, ReasonCode, SanitizeError, Segment,
};
use forge_sanitize::SanitizeChain;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Serialized form of a chain pass, for the segment-level cache.
#[derive(Debug, Serialize, Deserialize)]
struct CachedOutcome {
    content: String,
    passed: bool,
    rejected_by: Option<String>,
    warnings: Vec<String>,
}

/// Runs the sanitizer chain over every segment. System-originated segments
/// (the caller's own prompt, schemas, tool definitions) skip the chain:
/// zero-trust applies to external content, not to the application's own
/// configuration.
pub struct SanitizeStage {
    chain: SanitizeChain,
    on_injection: InjectionAction,
    segment_cache: Option<Arc<TieredCache>>,
}

impl SanitizeStage {
    pub fn new(chain: SanitizeChain, on_injection: InjectionAction) -> Self {
        Self {
            chain,
            on_injection,
            segment_cache: None,
        }
    }

    pub fn from_policy(policy: &forge_core::SanitizePolicy) -> Self {
        Self::new(SanitizeChain::from_policy(policy), policy.on_injection)
    }

    pub fn with_segment_cache(mut self, cache: Arc<TieredCache>) -> Self {
        self.segment_cache = Some(cache);
        self
    }

    pub fn sanitizer_names(&self) -> Vec<String> {
        self.chain.names().iter().map(|s| s.to_string()).collect()
    }

    fn is_trusted(segment: &Segment) -> bool {
        matches!(
            segment.provenance.source_type,
            forge_core::SourceType::System
        )
    }

    fn reason_for(sanitizer: &str) -> ReasonCode {
        match sanitizer {
            "html_stripper" => ReasonCode::SanitizeHtmlStripped,
            "pii_redactor" => ReasonCode::SanitizePiiRedacted,
            "length_guard" => ReasonCode::SanitizeLengthTruncated,
            "injection_detector" => ReasonCode::SanitizeInjectionDetected,
            _ => ReasonCode::SanitizeUnicodeNormalized,
        }
    }

    async fn run_chain(
        &self,
        segment: &Segment,
        model: &str,
    ) -> Result<CachedOutcome, SanitizeError> {
        let key = segment_key(&segment.content, model);
        if let Some(cache) = &self.segment_cache {
            if let Some(entry) = cache.get(&key).await {
                if let Ok(cached) = serde_json::from_slice::<CachedOutcome>(&entry.value) {
                    debug!(segment = %segment.id, "sanitize served from segment cache");
                    return Ok(cached);
                }
            }
        }

        let outcome = self.chain.run(&segment.content)?;
        let cached = CachedOutcome {
            content: outcome.content,
            passed: outcome.passed,
            rejected_by: outcome.rejected_by,
            warnings: outcome.warnings,
        };

        if let Some(cache) = &self.segment_cache {
            if let Ok(bytes) = serde_json::to_vec(&cached) {
                cache.set(key, bytes).await;
            }
        }
        Ok(cached)
    }
}

#[async_trait]
impl PipelineStage for SanitizeStage {
    fn name(&self) -> &str {
        "sanitize"
    }

    async fn process(
        &self,
        segments: Vec<Segment>,
        ctx: &mut PipelineContext,
    ) -> ForgeResult<Vec<Segment>> {
        let mut result = Vec::with_capacity(segments.len());

        for seg in segments {
            if Self::is_trusted(&seg) {
                result.push(seg);
                continue;
            }

            let outcome = self.run_chain(&seg, &ctx.model).await?;

            for warning in &outcome.warnings {
                ctx.warnings.push(warning.clone());
                // "[sanitizer_name] detail" - recover the name for audit.
                let sanitizer = warning
                    .strip_prefix('[')
                    .and_then(|rest| rest.split_once(']'))
                    .map(|(name, _)| name.to_string())
                    .unwrap_or_default();
                ctx.audit_log.push(
                    AuditEntry::new(
                        seg.id,
                        Decision::Sanitize,
                        Self::reason_for(&sanitizer),
                        warning.clone(),
                        self.name(),
                        0,
                    )
                    .with_metadata("sanitizer", serde_json::json!(sanitizer)),
                );
            }

            if !outcome.passed {
                let rejected_by = outcome.rejected_by.unwrap_or_default();
                match self.on_injection {
                    InjectionAction::Error => {
                        return Err(SanitizeError::InjectionRejected {
                            sanitizer: rejected_by,
                            patterns: outcome.warnings,
                        }
                        .into());
                    }
                    InjectionAction::WarnAndRemove => {
                        let reason = Self::reason_for(&rejected_by);
                        ctx.audit_log.push(
                            AuditEntry::new(
                                seg.id,
                                Decision::Drop,
                                reason,
                                format!("rejected by {rejected_by}"),
                                self.name(),
                                -i64::from(seg.token_count.unwrap_or(0)),
                            )
                            .with_metadata("sanitizer", serde_json::json!(rejected_by)),
                        );
                        continue;
                    }
                    InjectionAction::LogOnly => {
                        warn!(segment = %seg.id, sanitizer = %rejected_by, "threat detected, kept by policy");
                        result.push(seg);
                        continue;
                    }
                }
            }

            if outcome.content != seg.content.as_ref() {
                // Transformed: re-count tokens for the new content.
                let counter = ctx.registry.resolve(&ctx.model)?;
                let count =
                    u32::try_from(counter.count(&outcome.content)).unwrap_or(u32::MAX);
                result.push(seg.replacing_content(outcome.content).with_token_count(count));
            } else {
                result.push(seg);
            }
        }

        Ok(result)
    }
}
