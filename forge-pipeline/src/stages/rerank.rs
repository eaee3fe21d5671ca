//! Rerank stage: preference ordering, dedup, caps, decay, MMR

use crate::{PipelineContext, PipelineStage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forge_core::{
    AuditEntry, Decision, ForgeResult, ReasonCode, RerankPolicy, Segment, SegmentType,
};
use forge_compress::{jaccard_similarity, ngram_set};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

const NGRAM: usize = 2;

/// Orders segments so budgeting sees them in preference order, and prunes
/// duplicates before they can waste budget. Sort keys: priority, then
/// retrieval score, then insertion index (stable). Optional extras per
/// policy: temporal score decay, MMR diversity within a priority tier, and
/// per-type caps.
pub struct RerankStage {
    policy: RerankPolicy,
}

impl RerankStage {
    pub fn new(policy: RerankPolicy) -> Self {
        Self { policy }
    }

    /// Score after optional temporal decay. `now` is sampled once per pass
    /// so the sort comparator stays consistent.
    fn decayed_score(&self, segment: &Segment, now: DateTime<Utc>) -> Option<f64> {
        let score = segment.score()?;
        if !self.policy.enable_temporal_decay {
            return Some(score);
        }
        let Some(timestamp) = segment.metadata.timestamp else {
            return Some(score);
        };
        let age_days = (now - timestamp).num_seconds().max(0) as f64 / 86_400.0;
        let weight = (-self.policy.temporal_decay_rate * age_days)
            .exp()
            .max(self.policy.temporal_min_weight);
        Some(score * weight)
    }

    fn sort_preference(&self, segments: &mut [Segment], now: DateTime<Utc>) {
        segments.sort_by(|a, b| {
            b.effective_priority()
                .cmp(&a.effective_priority())
                .then_with(|| {
                    let score_a = self.decayed_score(a, now).unwrap_or(f64::NEG_INFINITY);
                    let score_b = self.decayed_score(b, now).unwrap_or(f64::NEG_INFINITY);
                    score_b
                        .partial_cmp(&score_a)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.seq.cmp(&b.seq))
        });
    }

    /// Greedy MMR reorder within each same-priority run. Relevance is the
    /// decayed score; similarity is n-gram Jaccard against already-chosen
    /// segments in the run.
    fn mmr_reorder(&self, segments: Vec<Segment>, now: DateTime<Utc>) -> Vec<Segment> {
        let lambda = self.policy.mmr_lambda;
        let mut result = Vec::with_capacity(segments.len());
        let mut run: Vec<Segment> = Vec::new();

        let flush = |run: &mut Vec<Segment>, result: &mut Vec<Segment>, stage: &Self| {
            if run.len() <= 2 {
                result.append(run);
                return;
            }
            let mut remaining: Vec<(Segment, HashSet<String>)> = run
                .drain(..)
                .map(|seg| {
                    let grams = ngram_set(&seg.content, NGRAM);
                    (seg, grams)
                })
                .collect();
            let mut chosen_grams: Vec<HashSet<String>> = Vec::new();
            while !remaining.is_empty() {
                let mut best = 0usize;
                let mut best_value = f64::NEG_INFINITY;
                for (idx, (seg, grams)) in remaining.iter().enumerate() {
                    let relevance = stage.decayed_score(seg, now).unwrap_or(0.0);
                    let max_similarity = chosen_grams
                        .iter()
                        .map(|chosen| jaccard_similarity(grams, chosen))
                        .fold(0.0f64, f64::max);
                    let value = lambda * relevance - (1.0 - lambda) * max_similarity;
                    if value > best_value {
                        best_value = value;
                        best = idx;
                    }
                }
                let (seg, grams) = remaining.remove(best);
                chosen_grams.push(grams);
                result.push(seg);
            }
        };

        for seg in segments {
            if let Some(last) = run.last() {
                if last.effective_priority() != seg.effective_priority() {
                    flush(&mut run, &mut result, self);
                }
            }
            run.push(seg);
        }
        flush(&mut run, &mut result, self);
        result
    }
}

#[async_trait]
impl PipelineStage for RerankStage {
    fn name(&self) -> &str {
        "rerank"
    }

    async fn process(
        &self,
        segments: Vec<Segment>,
        ctx: &mut PipelineContext,
    ) -> ForgeResult<Vec<Segment>> {
        let now = Utc::now();
        let mut ordered = segments;
        self.sort_preference(&mut ordered, now);

        // Dedup: in preference order, later near-duplicates lose.
        let mut kept: Vec<Segment> = Vec::with_capacity(ordered.len());
        let mut kept_grams: Vec<HashSet<String>> = Vec::new();
        for seg in ordered {
            let grams = ngram_set(&seg.content, NGRAM);
            let duplicate_of = kept
                .iter()
                .zip(kept_grams.iter())
                .find(|(_, existing)| {
                    jaccard_similarity(&grams, existing) >= self.policy.similarity_threshold
                })
                .map(|(survivor, _)| survivor.id);
            if let Some(survivor) = duplicate_of {
                ctx.audit_log.push(
                    AuditEntry::new(
                        seg.id,
                        Decision::Drop,
                        ReasonCode::SelectDeduplicated,
                        format!("near-duplicate of {survivor}"),
                        self.name(),
                        -i64::from(seg.token_count.unwrap_or(0)),
                    )
                    .with_metadata("parent_segment_ids", serde_json::json!([survivor.to_string()])),
                );
                continue;
            }
            kept_grams.push(grams);
            kept.push(seg);
        }

        // Per-type caps, applied in preference order.
        if !self.policy.max_per_type.is_empty() {
            let mut counts: BTreeMap<SegmentType, usize> = BTreeMap::new();
            let mut capped = Vec::with_capacity(kept.len());
            for seg in kept {
                let count = counts.entry(seg.segment_type).or_insert(0);
                let cap = self.policy.max_per_type.get(&seg.segment_type);
                if let Some(&cap) = cap {
                    if *count >= cap {
                        ctx.audit_log.push(AuditEntry::new(
                            seg.id,
                            Decision::Drop,
                            ReasonCode::SelectLowRelevance,
                            format!("over the per-type cap of {cap} for {}", seg.segment_type),
                            self.name(),
                            -i64::from(seg.token_count.unwrap_or(0)),
                        ));
                        continue;
                    }
                }
                *count += 1;
                capped.push(seg);
            }
            kept = capped;
        }

        if self.policy.enable_mmr {
            kept = self.mmr_reorder(kept, now);
        }

        if ctx.debug {
            debug!(kept = kept.len(), "rerank complete");
        }
        Ok(kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::{PolicyConfig, Priority};
    use forge_tokenizer::TokenizerRegistry;
    use std::sync::Arc;

    fn ctx() -> PipelineContext {
        PipelineContext::new(
            "m",
            Arc::new(PolicyConfig::default()),
            Arc::new(TokenizerRegistry::new()),
        )
    }

    fn rag(content: &str, priority: Priority, score: f64, seq: usize) -> Segment {
        Segment::new(SegmentType::Rag, content)
            .with_priority(priority)
            .with_score(score)
            .with_token_count(content.len() as u32)
            .with_seq(seq)
    }

    #[tokio::test]
    async fn test_priority_then_score_then_seq() {
        let mut ctx = ctx();
        let segments = vec![
            rag("low score high", Priority::High, 0.1, 0),
            rag("high score medium", Priority::Medium, 0.9, 1),
            rag("high score high", Priority::High, 0.9, 2),
        ];
        let out = RerankStage::new(RerankPolicy::default())
            .process(segments, &mut ctx)
            .await
            .unwrap();
        let seqs: Vec<usize> = out.iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![2, 0, 1]);
    }

    #[tokio::test]
    async fn test_stable_for_equal_keys() {
        let mut ctx = ctx();
        let segments = vec![
            rag("aaa bbb ccc", Priority::Medium, 0.5, 0),
            rag("ddd eee fff", Priority::Medium, 0.5, 1),
            rag("ggg hhh iii", Priority::Medium, 0.5, 2),
        ];
        let out = RerankStage::new(RerankPolicy::default())
            .process(segments, &mut ctx)
            .await
            .unwrap();
        let seqs: Vec<usize> = out.iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_dedup_drops_lower_preference() {
        let mut ctx = ctx();
        let policy = RerankPolicy {
            similarity_threshold: 0.25,
            ..Default::default()
        };
        let a = rag("Python removed the GIL in 3.13", Priority::High, 0.5, 0);
        let b = rag("Python 3.13 removed the GIL", Priority::Low, 0.5, 1);
        let loser_id = b.id;
        let survivor_id = a.id;
        let out = RerankStage::new(policy).process(vec![a, b], &mut ctx).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, survivor_id);
        let entry = ctx
            .audit_log
            .iter()
            .find(|e| e.segment_id == loser_id)
            .unwrap();
        assert_eq!(entry.reason_code, ReasonCode::SelectDeduplicated);
        assert!(entry.metadata.contains_key("parent_segment_ids"));
    }

    #[tokio::test]
    async fn test_dedup_survivor_deterministic() {
        // Same priority: higher score survives, regardless of input order.
        let mut ctx = ctx();
        let policy = RerankPolicy {
            similarity_threshold: 0.8,
            ..Default::default()
        };
        let a = rag("identical content here now", Priority::Medium, 0.2, 0);
        let b = rag("identical content here now", Priority::Medium, 0.9, 1);
        let high_score_id = b.id;
        let out = RerankStage::new(policy).process(vec![a, b], &mut ctx).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, high_score_id);
    }

    #[tokio::test]
    async fn test_per_type_cap() {
        let mut ctx = ctx();
        let mut policy = RerankPolicy::default();
        policy.max_per_type.insert(SegmentType::Rag, 2);
        let segments = vec![
            rag("first aa bb", Priority::Medium, 0.9, 0),
            rag("second cc dd", Priority::Medium, 0.8, 1),
            rag("third ee ff", Priority::Medium, 0.7, 2),
        ];
        let out = RerankStage::new(policy).process(segments, &mut ctx).await.unwrap();
        assert_eq!(out.len(), 2);
        // The lowest-scored one was capped out.
        assert!(ctx
            .audit_log
            .iter()
            .any(|e| e.reason_code == ReasonCode::SelectLowRelevance));
    }

    #[tokio::test]
    async fn test_temporal_decay_demotes_old_segments() {
        let mut ctx = ctx();
        let policy = RerankPolicy {
            enable_temporal_decay: true,
            temporal_decay_rate: 0.5,
            temporal_min_weight: 0.01,
            ..Default::default()
        };
        let mut old = rag("old news entirely different", Priority::Medium, 0.9, 0);
        old.metadata.timestamp = Some(Utc::now() - chrono::Duration::days(30));
        let mut fresh = rag("fresh fact completely other", Priority::Medium, 0.5, 1);
        fresh.metadata.timestamp = Some(Utc::now());
        let out = RerankStage::new(policy)
            .process(vec![old, fresh], &mut ctx)
            .await
            .unwrap();
        // Fresh 0.5 beats decayed 0.9.
        assert_eq!(out[0].seq, 1);
    }

    #[tokio::test]
    async fn test_mmr_prefers_diverse_runner_up() {
        let mut ctx = ctx();
        let policy = RerankPolicy {
            enable_mmr: true,
            mmr_lambda: 0.3,
            // Similar but below the dedup threshold.
            similarity_threshold: 0.95,
            ..Default::default()
        };
        let top = rag("rust async runtime design notes", Priority::Medium, 0.9, 0);
        let echo = rag("rust async runtime design ideas", Priority::Medium, 0.8, 1);
        let diverse = rag("database btree page layout", Priority::Medium, 0.7, 2);
        let diverse_id = diverse.id;
        let out = RerankStage::new(policy)
            .process(vec![top, echo, diverse], &mut ctx)
            .await
            .unwrap();
        assert_eq!(out.len(), 3);
        // With a diversity-heavy lambda the unrelated chunk jumps the echo.
        assert_eq!(out[1].id, diverse_id);
    }
}
