//! FORGE Compress - Saturation-Triggered Compression
//!
//! Compression saves budget only when there is budget pressure, so the
//! engine runs on the already-budgeted set and only when the saturation rate
//! crosses the trigger. Strategy order: dedup, then truncate Low priority,
//! then Medium, then High (with a warning), never Critical. Targets are
//! replaced, not deleted: every derived segment records its parents and the
//! compression method in provenance.

use forge_core::{ForgeResult, Segment};
use forge_tokenizer::TokenCounter;
use std::sync::Arc;

mod similarity;
mod truncation;
mod dedup;
mod summary;
mod engine;

pub use similarity::{jaccard_similarity, ngram_set};

pub use truncation::{TruncationCompressor, TruncationMode};

pub use dedup::DedupCompressor;

pub use summary::SummaryCompressor;

pub use engine::CompressEngine;

/// Shared inputs for one compression call.
#[derive(Clone)]
pub struct CompressContext {
    /// Tokens the whole set may occupy after compression.
    pub available_tokens: u32,
    /// Tokens this call should compress its input down to.
    pub target_tokens: u32,
    /// Saturation of the set at call time.
    pub saturation: f64,
    pub model: String,
    /// Counter used to re-count derived segments.
    pub counter: Arc<dyn TokenCounter>,
}

/// Output of one compressor pass.
#[derive(Debug, Clone)]
pub struct CompressionResult {
    /// Survivors plus derived replacements, input order preserved.
    pub segments: Vec<Segment>,
    pub original_tokens: u64,
    pub compressed_tokens: u64,
    /// Name of the compressor that produced this result.
    pub method: String,
    /// Ids of segments that were removed or replaced.
    pub removed_ids: Vec<forge_core::SegmentId>,
}

/// A compression strategy. Async because the abstractive compressor awaits
/// an external summarizer; the rule-based compressors complete immediately.
#[async_trait::async_trait]
pub trait Compressor: Send + Sync {
    /// Compress `segments` toward `ctx.target_tokens`.
    async fn compress(
        &self,
        segments: &[Segment],
        ctx: &CompressContext,
    ) -> ForgeResult<CompressionResult>;

    /// Method name recorded in provenance.
    fn name(&self) -> &str;
}

pub(crate) fn total_tokens(segments: &[Segment]) -> u64 {
    segments
        .iter()
        .map(|seg| u64::from(seg.token_count.unwrap_or(0)))
        .sum()
}
