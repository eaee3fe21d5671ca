//! Assemble stage: final ordering and optional adjacent merge

use crate::{PipelineContext, PipelineStage};
use async_trait::async_trait;
use forge_core::{ControlFlags, ForgeResult, Segment, SegmentType};
use tracing::debug;

/// Final stage: fixed-position segments (system, schemas, tool definitions,
/// few-shot, anything position-locked) lead in type-rank order; everything
/// else follows in insertion order, which is the conversation's own
/// chronology. Optionally merges adjacent same-role segments for APIs that
/// reject consecutive same-role messages.
pub struct AssembleStage {
    merge_adjacent: bool,
}

impl AssembleStage {
    pub fn new() -> Self {
        Self {
            merge_adjacent: false,
        }
    }

    pub fn with_merge_adjacent(mut self) -> Self {
        self.merge_adjacent = true;
        self
    }

    fn is_fixed(segment: &Segment) -> bool {
        segment.control_flags.contains(ControlFlags::LOCK_POSITION)
            || matches!(
                segment.segment_type,
                SegmentType::System
                    | SegmentType::Schema
                    | SegmentType::ToolDefinition
                    | SegmentType::FewShot
            )
    }

    fn merge_adjacent_messages(segments: Vec<Segment>) -> Vec<Segment> {
        let mut result: Vec<Segment> = Vec::with_capacity(segments.len());
        for seg in segments {
            match result.last() {
                Some(last)
                    if last.role == seg.role
                        && !last.control_flags.contains(ControlFlags::LOCK_POSITION) =>
                {
                    let last = result.pop().expect("just checked non-empty");
                    let merged_tokens =
                        last.token_count.unwrap_or(0) + seg.token_count.unwrap_or(0);
                    let merged = last
                        .replacing_content(format!("{}\n\n{}", last.content, seg.content))
                        .with_token_count(merged_tokens);
                    result.push(merged);
                }
                _ => result.push(seg),
            }
        }
        result
    }
}

impl Default for AssembleStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PipelineStage for AssembleStage {
    fn name(&self) -> &str {
        "assemble"
    }

    async fn process(
        &self,
        segments: Vec<Segment>,
        ctx: &mut PipelineContext,
    ) -> ForgeResult<Vec<Segment>> {
        let (mut fixed, mut dynamic): (Vec<Segment>, Vec<Segment>) =
            segments.into_iter().partition(Self::is_fixed);

        fixed.sort_by_key(|seg| (seg.segment_type.assembly_rank(), seg.seq));
        // Dynamic content reads best in the order it arrived.
        dynamic.sort_by_key(|seg| seg.seq);

        let mut assembled = fixed;
        assembled.append(&mut dynamic);

        if self.merge_adjacent {
            assembled = Self::merge_adjacent_messages(assembled);
        }

        if ctx.debug {
            debug!(segments = assembled.len(), "assembled");
        }
        Ok(assembled)
    }
}
