//! Truncation compressor

use crate::{total_tokens, CompressContext, CompressionResult, Compressor};
use forge_core::{ForgeResult, Segment};

/// Which part of the sequence survives truncation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TruncationMode {
    /// Keep the front, drop the tail. System prompts and context heads
    /// usually matter more than trailing history.
    #[default]
    Tail,
    /// Keep the back, drop the head. For recency-dominated content.
    Head,
    /// Keep front and back, drop the middle.
    Middle,
}

impl TruncationMode {
    fn method_name(self) -> &'static str {
        match self {
            TruncationMode::Tail => "truncation_tail",
            TruncationMode::Head => "truncation_head",
            TruncationMode::Middle => "truncation_middle",
        }
    }
}

/// The zero-dependency, deterministic fallback compressor. Admits whole
/// segments until the target is reached; the boundary segment is content-
/// truncated character-proportionally to its remaining token allowance.
pub struct TruncationCompressor {
    mode: TruncationMode,
    /// Share of the target kept from the front in Middle mode.
    head_ratio: f64,
}

impl TruncationCompressor {
    pub fn new(mode: TruncationMode) -> Self {
        Self {
            mode,
            head_ratio: 0.5,
        }
    }

    pub fn with_head_ratio(mut self, ratio: f64) -> Self {
        self.head_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Cut one segment down to `target` tokens, keeping the front or back.
    /// Character-proportional: exact token-boundary cutting would need a
    /// decode pass per candidate cut and buys nothing for budget purposes.
    fn truncate_segment(
        &self,
        segment: &Segment,
        target: u32,
        keep_back: bool,
        parents: Vec<forge_core::SegmentId>,
        ctx: &CompressContext,
    ) -> Option<Segment> {
        let seg_tokens = segment.token_count.unwrap_or(0);
        if target == 0 || seg_tokens == 0 {
            return None;
        }
        let ratio = f64::from(target) / f64::from(seg_tokens);
        let chars: Vec<char> = segment.content.chars().collect();
        let target_chars = ((chars.len() as f64) * ratio) as usize;
        if target_chars == 0 {
            return None;
        }
        let kept: String = if keep_back {
            chars[chars.len() - target_chars.min(chars.len())..]
                .iter()
                .collect()
        } else {
            chars[..target_chars.min(chars.len())].iter().collect()
        };
        if kept.is_empty() {
            return None;
        }
        let count = u32::try_from(ctx.counter.count(&kept)).unwrap_or(u32::MAX);
        Some(
            segment
                .derive_compressed(kept, parents, self.mode.method_name())
                .with_token_count(count),
        )
    }

    fn keep_front(
        &self,
        segments: &[Segment],
        target: u32,
        parents: &[forge_core::SegmentId],
        ctx: &CompressContext,
    ) -> Vec<Segment> {
        let mut kept = Vec::new();
        let mut total = 0u32;
        for seg in segments {
            let tokens = seg.token_count.unwrap_or(0);
            if total + tokens > target {
                let remaining = target - total;
                if let Some(cut) =
                    self.truncate_segment(seg, remaining, false, parents.to_vec(), ctx)
                {
                    kept.push(cut);
                }
                break;
            }
            kept.push(seg.clone());
            total += tokens;
        }
        kept
    }

    fn keep_back(
        &self,
        segments: &[Segment],
        target: u32,
        parents: &[forge_core::SegmentId],
        ctx: &CompressContext,
    ) -> Vec<Segment> {
        let mut kept = Vec::new();
        let mut total = 0u32;
        for seg in segments.iter().rev() {
            let tokens = seg.token_count.unwrap_or(0);
            if total + tokens > target {
                let remaining = target - total;
                if let Some(cut) =
                    self.truncate_segment(seg, remaining, true, parents.to_vec(), ctx)
                {
                    kept.insert(0, cut);
                }
                break;
            }
            kept.insert(0, seg.clone());
            total += tokens;
        }
        kept
    }
}

#[async_trait::async_trait]
impl Compressor for TruncationCompressor {
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

        let parents: Vec<forge_core::SegmentId> = segments.iter().map(|seg| seg.id).collect();
        let kept = match self.mode {
            TruncationMode::Tail => self.keep_front(segments, ctx.target_tokens, &parents, ctx),
            TruncationMode::Head => self.keep_back(segments, ctx.target_tokens, &parents, ctx),
            TruncationMode::Middle => {
                let head_target = (f64::from(ctx.target_tokens) * self.head_ratio) as u32;
                let tail_target = ctx.target_tokens - head_target;
                let mut front = self.keep_front(segments, head_target, &parents, ctx);
                let back = self.keep_back(segments, tail_target, &parents, ctx);
                // The front pass claims a prefix and the back pass a suffix;
                // drop back-pass survivors already present in the front.
                let front_ids: Vec<_> = front.iter().map(|seg| seg.id).collect();
                front.extend(
                    back.into_iter()
                        .filter(|seg| !front_ids.contains(&seg.id)),
                );
                front
            }
        };

        let kept_ids: Vec<_> = kept.iter().map(|seg| seg.id).collect();
        let removed_ids = segments
            .iter()
            .map(|seg| seg.id)
            .filter(|id| !kept_ids.contains(id))
            .collect();

        let compressed_tokens = total_tokens(&kept);
        Ok(CompressionResult {
            segments: kept,
            original_tokens,
            compressed_tokens,
            method: self.name().to_string(),
            removed_ids,
        })
    }

    fn name(&self) -> &str {
        self.mode.method_name()
    }
}
