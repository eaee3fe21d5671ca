//! Dedup compressor

use crate::similarity::{jaccard_similarity, ngram_set, DEFAULT_NGRAM};
use crate::{total_tokens, CompressContext, CompressionResult, Compressor};
use forge_core::{ForgeResult, Segment};

/// Collapses near-duplicate segments by n-gram Jaccard similarity.
///
/// Jaccard rather than embeddings: zero dependencies, zero latency, and
/// repeated retrieval chunks are the duplicates that actually occur. The
/// survivor of a duplicate pair is chosen by higher priority, then higher
/// retrieval score, then earlier insertion.
pub struct DedupCompressor {
    threshold: f64,
    ngram: usize,
}

impl DedupCompressor {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
            ngram: DEFAULT_NGRAM,
        }
    }

    pub fn with_ngram(mut self, n: usize) -> Self {
        self.ngram = n.max(1);
        self
    }

    /// True when `a` should survive over `b`.
    fn keep_first(a: &Segment, b: &Segment) -> bool {
        let by_priority = a.effective_priority().cmp(&b.effective_priority());
        if by_priority != std::cmp::Ordering::Equal {
            return by_priority == std::cmp::Ordering::Greater;
        }
        let score_a = a.score().unwrap_or(0.0);
        let score_b = b.score().unwrap_or(0.0);
        if (score_a - score_b).abs() > f64::EPSILON {
            return score_a > score_b;
        }
        a.seq <= b.seq
    }
}

impl Default for DedupCompressor {
    fn default() -> Self {
        Self::new(0.85)
    }
}

#[async_trait::async_trait]
impl Compressor for DedupCompressor {
    async fn compress(
        &self,
        segments: &[Segment],
        _ctx: &CompressContext,
    ) -> ForgeResult<CompressionResult> {
        let original_tokens = total_tokens(segments);
        if segments.len() < 2 {
            return Ok(CompressionResult {
                segments: segments.to_vec(),
                original_tokens,
                compressed_tokens: original_tokens,
                method: self.name().to_string(),
                removed_ids: Vec::new(),
            });
        }

        let grams: Vec<_> = segments
            .iter()
            .map(|seg| ngram_set(&seg.content, self.ngram))
            .collect();

        let mut keep = vec![true; segments.len()];
        // Losers absorbed by each survivor, for provenance.
        let mut absorbed: Vec<Vec<forge_core::SegmentId>> = vec![Vec::new(); segments.len()];

        for i in 0..segments.len() {
            if !keep[i] {
                continue;
            }
            for j in (i + 1)..segments.len() {
                if !keep[j] {
                    continue;
                }
                let similarity = jaccard_similarity(&grams[i], &grams[j]);
                if similarity >= self.threshold {
                    if Self::keep_first(&segments[i], &segments[j]) {
                        keep[j] = false;
                        let mut moved = std::mem::take(&mut absorbed[j]);
                        absorbed[i].push(segments[j].id);
                        absorbed[i].append(&mut moved);
                    } else {
                        keep[i] = false;
                        let mut moved = std::mem::take(&mut absorbed[i]);
                        absorbed[j].push(segments[i].id);
                        absorbed[j].append(&mut moved);
                        break;
                    }
                }
            }
        }

        let mut kept = Vec::new();
        let mut removed_ids = Vec::new();
        for (idx, seg) in segments.iter().enumerate() {
            if keep[idx] {
                if absorbed[idx].is_empty() {
                    kept.push(seg.clone());
                } else {
                    // Survivor absorbed duplicates: record the merge.
                    let mut parents = vec![seg.id];
                    parents.extend(absorbed[idx].iter().copied());
                    let count = seg.token_count;
                    let mut derived = seg.derive_compressed(
                        seg.content.to_string(),
                        parents,
                        self.name(),
                    );
                    derived.token_count = count;
                    kept.push(derived);
                }
            } else {
                removed_ids.push(seg.id);
            }
        }

        // Dedup ignores the target: it removes redundancy, not content.
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
        "dedup_jaccard"
    }
}
