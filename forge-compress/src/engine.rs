//! Compression engine - saturation trigger and priority tiers

use crate::{total_tokens, CompressContext, Compressor, DedupCompressor};
use forge_core::{
    AuditEntry, CompressError, ControlFlags, Decision, ForgeResult, Priority, ReasonCode, Segment,
    SegmentId,
};
use forge_tokenizer::TokenCounter;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

const STAGE: &str = "compress";

/// Orchestrates compressors: decides when to compress and what, the
/// compressors decide how. Tier order protects priority: dedup first, then
/// Low, Medium, and finally High with a warning. Critical is untouchable.
pub struct CompressEngine {
    saturation_trigger: f64,
    preserve_must_keep: bool,
    min_segment_tokens: u32,
    dedup: DedupCompressor,
    default_compressor: Arc<dyn Compressor>,
}

impl CompressEngine {
    pub fn new(
        saturation_trigger: f64,
        preserve_must_keep: bool,
        min_segment_tokens: u32,
        default_compressor: Arc<dyn Compressor>,
    ) -> Self {
        Self {
            saturation_trigger: saturation_trigger.clamp(0.0, 1.0),
            preserve_must_keep,
            min_segment_tokens,
            dedup: DedupCompressor::default(),
            default_compressor,
        }
    }

    pub fn with_dedup(mut self, dedup: DedupCompressor) -> Self {
        self.dedup = dedup;
        self
    }

    fn is_compressible(&self, segment: &Segment) -> bool {
        if segment.effective_priority() == Priority::Critical {
            return false;
        }
        if self.preserve_must_keep && segment.control_flags.contains(ControlFlags::MUST_KEEP) {
            return false;
        }
        if !segment.control_flags.contains(ControlFlags::COMPRESSIBLE) {
            return false;
        }
        segment.token_count.unwrap_or(0) >= self.min_segment_tokens
    }

    /// Compress `segments` into `available_tokens` if saturation demands it.
    /// Audit entries are appended for every segment a compressor removed or
    /// replaced; a warning is pushed when the High tier had to be touched.
    pub async fn compress(
        &self,
        segments: &[Segment],
        available_tokens: u32,
        model: &str,
        counter: Arc<dyn TokenCounter>,
        audit: &mut Vec<AuditEntry>,
        warnings: &mut Vec<String>,
    ) -> ForgeResult<Vec<Segment>> {
        if segments.is_empty() {
            return Ok(Vec::new());
        }

        let original_total = total_tokens(segments);
        let saturation = if available_tokens > 0 {
            original_total as f64 / f64::from(available_tokens)
        } else {
            f64::INFINITY
        };
        if saturation < self.saturation_trigger {
            debug!(
                saturation = format!("{saturation:.3}"),
                trigger = self.saturation_trigger,
                "saturation below trigger, skipping compression"
            );
            return Ok(segments.to_vec());
        }

        // Compress down to the trigger level, not just the raw budget: the
        // allocator already bounded the set, so the point of this engine is
        // to buy back headroom once saturation crosses the line.
        let soft_target =
            (f64::from(available_tokens) * self.saturation_trigger) as u32;

        info!(
            saturation = format!("{saturation:.3}"),
            total = original_total,
            available = available_tokens,
            soft_target,
            "saturation trigger crossed, compressing"
        );

        let mut current: Vec<Segment> = segments.to_vec();

        // Tier 0: dedup across all compressible segments.
        current = self
            .dedup_phase(current, available_tokens, model, &counter, audit)
            .await?;
        if total_tokens(&current) <= u64::from(soft_target) {
            return self.finish(current);
        }

        // Tiers 1-3: compress by ascending priority.
        for (tier, priority) in [
            (1, Priority::Low),
            (2, Priority::Medium),
            (3, Priority::High),
        ] {
            if tier == 3 {
                warnings.push(
                    "compression reached high-priority segments; consider raising the budget"
                        .to_string(),
                );
                warn!("compressing high-priority tier");
            }
            current = self
                .priority_phase(current, soft_target, priority, model, &counter, audit)
                .await?;
            let remaining = total_tokens(&current);
            if remaining <= u64::from(soft_target) {
                debug!(tier, remaining, "target satisfied after tier");
                return self.finish(current);
            }
        }

        // Tiers exhausted. Short of the soft target is tolerable as long as
        // the hard budget holds; past the hard budget is an error.
        let remaining = total_tokens(&current);
        if remaining <= u64::from(available_tokens) {
            return self.finish(current);
        }
        let gap = remaining.saturating_sub(u64::from(available_tokens));
        Err(CompressError::BudgetStillExceeded { gap_tokens: gap }.into())
    }

    async fn dedup_phase(
        &self,
        segments: Vec<Segment>,
        available_tokens: u32,
        model: &str,
        counter: &Arc<dyn TokenCounter>,
        audit: &mut Vec<AuditEntry>,
    ) -> ForgeResult<Vec<Segment>> {
        let (compressible, protected): (Vec<Segment>, Vec<Segment>) = segments
            .into_iter()
            .partition(|seg| self.is_compressible(seg));
        if compressible.len() < 2 {
            return Ok(merge_by_seq(protected, compressible));
        }

        let ctx = CompressContext {
            available_tokens,
            target_tokens: available_tokens,
            saturation: 1.0,
            model: model.to_string(),
            counter: Arc::clone(counter),
        };
        let token_index = token_index(&compressible);
        let result = self.dedup.compress(&compressible, &ctx).await?;
        record_removals(&result.removed_ids, &token_index, &result.method, audit);

        debug!(
            removed = result.removed_ids.len(),
            before = result.original_tokens,
            after = result.compressed_tokens,
            "dedup phase complete"
        );
        Ok(merge_by_seq(protected, result.segments))
    }

    async fn priority_phase(
        &self,
        segments: Vec<Segment>,
        available_tokens: u32,
        priority: Priority,
        model: &str,
        counter: &Arc<dyn TokenCounter>,
        audit: &mut Vec<AuditEntry>,
    ) -> ForgeResult<Vec<Segment>> {
        let (targets, others): (Vec<Segment>, Vec<Segment>) =
            segments.into_iter().partition(|seg| {
                seg.effective_priority() == priority && self.is_compressible(seg)
            });
        if targets.is_empty() {
            return Ok(others);
        }

        let other_tokens = total_tokens(&others);
        let remaining_budget =
            u32::try_from(u64::from(available_tokens).saturating_sub(other_tokens)).unwrap_or(0);

        let ctx = CompressContext {
            available_tokens: remaining_budget,
            target_tokens: remaining_budget,
            saturation: 1.0,
            model: model.to_string(),
            counter: Arc::clone(counter),
        };
        let token_index = token_index(&targets);
        let result = self.default_compressor.compress(&targets, &ctx).await?;
        record_removals(&result.removed_ids, &token_index, &result.method, audit);
        record_replacements(&result.segments, &token_index, &result.method, audit);

        debug!(
            priority = %priority,
            before = result.original_tokens,
            after = result.compressed_tokens,
            "priority tier compressed"
        );
        Ok(merge_by_seq(others, result.segments))
    }

    /// Cycle check before the engine's output is accepted: provenance forms
    /// a DAG, and a back-edge means a compressor wrote corrupt ancestry.
    fn finish(&self, segments: Vec<Segment>) -> ForgeResult<Vec<Segment>> {
        if let Some(cycle_at) = find_provenance_cycle(&segments) {
            return Err(CompressError::CyclicProvenance {
                segment_id: cycle_at,
            }
            .into());
        }
        Ok(segments)
    }
}

fn token_index(segments: &[Segment]) -> HashMap<SegmentId, u32> {
    segments
        .iter()
        .map(|seg| (seg.id, seg.token_count.unwrap_or(0)))
        .collect()
}

fn merge_by_seq(mut a: Vec<Segment>, b: Vec<Segment>) -> Vec<Segment> {
    a.extend(b);
    a.sort_by_key(|seg| seg.seq);
    a
}

fn record_removals(
    removed: &[SegmentId],
    tokens: &HashMap<SegmentId, u32>,
    method: &str,
    audit: &mut Vec<AuditEntry>,
) {
    for id in removed {
        let impact = tokens.get(id).copied().unwrap_or(0);
        audit.push(AuditEntry::new(
            *id,
            Decision::Compress,
            ReasonCode::CompressWindowSaturation,
            format!("removed by {method} under saturation"),
            STAGE,
            -i64::from(impact),
        ));
    }
}

fn record_replacements(
    survivors: &[Segment],
    original_tokens: &HashMap<SegmentId, u32>,
    method: &str,
    audit: &mut Vec<AuditEntry>,
) {
    for seg in survivors {
        if seg.provenance.compression_method.as_deref() != Some(method) {
            continue;
        }
        // A derived replacement: charge the delta against the first parent.
        let Some(parent) = seg.provenance.parent_segment_ids.first() else {
            continue;
        };
        let before = original_tokens.get(parent).copied().unwrap_or(0);
        let after = seg.token_count.unwrap_or(0);
        audit.push(
            AuditEntry::new(
                *parent,
                Decision::Compress,
                ReasonCode::CompressWindowSaturation,
                format!("rewritten by {method}: {before} -> {after} tokens"),
                STAGE,
                i64::from(after) - i64::from(before),
            )
            .with_metadata("replacement", serde_json::json!(seg.id.to_string())),
        );
    }
}

/// DFS over parent links restricted to segments present in the set. Returns
/// the id where a cycle was found.
fn find_provenance_cycle(segments: &[Segment]) -> Option<SegmentId> {
    let by_id: HashMap<SegmentId, &Segment> =
        segments.iter().map(|seg| (seg.id, seg)).collect();

    let mut done: HashSet<SegmentId> = HashSet::new();
    for seg in segments {
        if done.contains(&seg.id) {
            continue;
        }
        let mut in_progress: HashSet<SegmentId> = HashSet::new();
        let mut stack: Vec<(SegmentId, usize)> = vec![(seg.id, 0)];
        in_progress.insert(seg.id);
        while let Some((id, child)) = stack.pop() {
            let parents = by_id
                .get(&id)
                .map(|s| s.provenance.parent_segment_ids.as_slice())
                .unwrap_or(&[]);
            if child < parents.len() {
                stack.push((id, child + 1));
                let parent = parents[child];
                if in_progress.contains(&parent) {
                    return Some(parent);
                }
                if !done.contains(&parent) && by_id.contains_key(&parent) {
                    in_progress.insert(parent);
                    stack.push((parent, 0));
                }
            } else {
                in_progress.remove(&id);
                done.insert(id);
            }
        }
    }
    None
}
