//! The segment model - the immutable unit of every pipeline decision

use crate::{Priority, SegmentId, SegmentType, SourceType, Timestamp};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

bitflags! {
    /// Control flags that pin a segment against pipeline mutation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ControlFlags: u8 {
        /// Never drop this segment, regardless of budget pressure.
        const MUST_KEEP = 0b0001;
        /// The compression engine may rewrite this segment.
        const COMPRESSIBLE = 0b0010;
        /// Assemble must not reorder this segment relative to its neighbours.
        const LOCK_POSITION = 0b0100;
    }
}

impl Default for ControlFlags {
    fn default() -> Self {
        ControlFlags::COMPRESSIBLE
    }
}

// Manual serde implementation for ControlFlags (bitflags 2.x + serde)
impl Serialize for ControlFlags {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ControlFlags {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u8::deserialize(deserializer)?;
        Self::from_bits(bits).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid ControlFlags bits: {:#04x}", bits))
        })
    }
}

/// Per-segment metadata. The `custom` map is the extension point for
/// callers; the named fields are the ones pipeline stages read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SegmentMetadata {
    /// When the underlying content was produced.
    pub timestamp: Option<Timestamp>,
    /// Soft expiry in seconds, relative to `timestamp`.
    pub ttl_seconds: Option<u64>,
    /// Retrieval relevance score, if this segment came from a retriever.
    pub retrieval_score: Option<f64>,
    /// Visibility namespace on the context bus.
    pub namespace: String,
    /// Free-form caller metadata.
    pub custom: BTreeMap<String, serde_json::Value>,
}

/// Ancestry record: what a segment was derived from and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// Caller-supplied identifier of the originating source.
    pub source_id: Option<String>,
    pub source_type: SourceType,
    /// Parents in the derivation DAG (compression, dedup, handoff).
    pub parent_segment_ids: Vec<SegmentId>,
    /// Name of the compressor that produced this segment, if any.
    pub compression_method: Option<String>,
    pub retrieval_score: Option<f64>,
}

impl Provenance {
    pub fn new(source_type: SourceType) -> Self {
        Self {
            source_id: None,
            source_type,
            parent_segment_ids: Vec::new(),
            compression_method: None,
            retrieval_score: None,
        }
    }

    /// Provenance for a segment produced by a compressor.
    pub fn compressed(parents: Vec<SegmentId>, method: impl Into<String>) -> Self {
        Self {
            source_id: None,
            source_type: SourceType::Compression,
            parent_segment_ids: parents,
            compression_method: Some(method.into()),
            retrieval_score: None,
        }
    }
}

/// The atomic unit of context. Segments are immutable: every mutation
/// constructor returns a new value, sharing the content buffer where the
/// content itself did not change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: SegmentId,
    pub segment_type: SegmentType,
    /// LLM-level role string ("system", "user", "assistant", "tool").
    pub role: String,
    /// Content is reference-counted so that stages which only change
    /// metadata do not copy the text.
    pub content: Arc<str>,
    /// Populated by the Normalize stage; budget code must not run before it.
    pub token_count: Option<u32>,
    /// Explicit priority. `None` means "derive from segment type".
    pub priority: Option<Priority>,
    pub control_flags: ControlFlags,
    /// Namespaces (beyond the segment's own) allowed to see this segment.
    pub visibility: Vec<String>,
    pub metadata: SegmentMetadata,
    pub provenance: Provenance,
    /// Insertion index within the request; the stable tie-break everywhere.
    pub seq: usize,
}

impl Segment {
    /// Create a segment with the role string conventional for its type.
    pub fn new(segment_type: SegmentType, content: impl Into<String>) -> Self {
        let role = match segment_type {
            SegmentType::System | SegmentType::Schema => "system",
            SegmentType::User | SegmentType::Rag | SegmentType::State => "user",
            SegmentType::Assistant | SegmentType::Summary | SegmentType::FewShot => "assistant",
            SegmentType::ToolDefinition | SegmentType::ToolCall | SegmentType::ToolResult => "tool",
        };
        Self {
            id: Uuid::now_v7(),
            segment_type,
            role: role.to_string(),
            content: Arc::from(content.into()),
            token_count: None,
            priority: None,
            control_flags: ControlFlags::default(),
            visibility: Vec::new(),
            metadata: SegmentMetadata::default(),
            provenance: Provenance::new(match segment_type {
                SegmentType::System | SegmentType::Schema | SegmentType::ToolDefinition => {
                    SourceType::System
                }
                SegmentType::Rag => SourceType::Retrieval,
                SegmentType::ToolCall | SegmentType::ToolResult => SourceType::ToolOutput,
                SegmentType::Assistant | SegmentType::Summary => SourceType::LlmOutput,
                _ => SourceType::UserInput,
            }),
            seq: 0,
        }
    }

    /// Effective priority: the explicit one, or Critical for system-ish
    /// types, or Medium otherwise.
    pub fn effective_priority(&self) -> Priority {
        match self.priority {
            Some(p) => p,
            None if self.segment_type.defaults_to_critical() => Priority::Critical,
            None => Priority::Medium,
        }
    }

    /// Whether the compression engine is allowed to rewrite this segment.
    pub fn is_compressible(&self) -> bool {
        self.effective_priority() != Priority::Critical
            && !self.control_flags.contains(ControlFlags::MUST_KEEP)
            && self.control_flags.contains(ControlFlags::COMPRESSIBLE)
    }

    /// Retrieval score from metadata or provenance, whichever is set.
    pub fn score(&self) -> Option<f64> {
        self.metadata
            .retrieval_score
            .or(self.provenance.retrieval_score)
    }

    // ------------------------------------------------------------------
    // Builder-style constructors. Each returns a new value.
    // ------------------------------------------------------------------

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_flags(mut self, flags: ControlFlags) -> Self {
        self.control_flags = flags;
        self
    }

    pub fn with_seq(mut self, seq: usize) -> Self {
        self.seq = seq;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.metadata.namespace = namespace.into();
        self
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.metadata.retrieval_score = Some(score);
        self
    }

    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.provenance.source_id = Some(source_id.into());
        self
    }

    pub fn with_timestamp(mut self, ts: Timestamp) -> Self {
        self.metadata.timestamp = Some(ts);
        self
    }

    pub fn with_token_count(mut self, count: u32) -> Self {
        self.token_count = Some(count);
        self
    }

    pub fn with_visibility(mut self, namespaces: Vec<String>) -> Self {
        self.visibility = namespaces;
        self
    }

    /// Replace the content, clearing the now-stale token count.
    /// The result keeps the same id; provenance is up to the caller.
    pub fn replacing_content(&self, content: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.content = Arc::from(content.into());
        next.token_count = None;
        next
    }

    /// A derived segment produced by a compressor: fresh id, provenance
    /// pointing at the parents, same type/role/namespace as `self`.
    pub fn derive_compressed(
        &self,
        content: impl Into<String>,
        parents: Vec<SegmentId>,
        method: impl Into<String>,
    ) -> Self {
        let mut next = self.clone();
        next.id = Uuid::now_v7();
        next.content = Arc::from(content.into());
        next.token_count = None;
        next.provenance = Provenance::compressed(parents, method);
        next
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use crate::SegmentType;
    use proptest::prelude::*;

    fn arb_type() -> impl Strategy<Value = SegmentType> {
        prop_oneof![
            Just(SegmentType::System),
            Just(SegmentType::User),
            Just(SegmentType::Assistant),
            Just(SegmentType::Rag),
            Just(SegmentType::FewShot),
            Just(SegmentType::State),
            Just(SegmentType::Summary),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        /// Builders never mutate their input: the original keeps every field
        /// it had before the derived value was produced.
        #[test]
        fn prop_builders_leave_original_intact(
            content in ".{0,200}",
            seg_type in arb_type(),
            score in 0.0f64..1.0,
            seq in 0usize..10_000,
        ) {
            let original = Segment::new(seg_type, content);
            let snapshot = original.clone();

            let _modified = original
                .clone()
                .with_priority(Priority::High)
                .with_score(score)
                .with_seq(seq)
                .with_namespace("elsewhere");

            prop_assert_eq!(original, snapshot);
        }

        /// Content replacement returns a new value with the stale token
        /// count cleared, and leaves the source untouched.
        #[test]
        fn prop_replacing_content_is_pure(
            before in ".{1,100}",
            after in ".{1,100}",
            tokens in 0u32..10_000,
        ) {
            let source = Segment::new(SegmentType::Rag, before).with_token_count(tokens);
            let snapshot = source.clone();
            let replaced = source.replacing_content(after.clone());

            prop_assert_eq!(&source, &snapshot);
            prop_assert_eq!(replaced.content.as_ref(), after.as_str());
            prop_assert_eq!(replaced.token_count, None);
            prop_assert_eq!(replaced.id, source.id);
        }

        /// Derived segments always point back at their parents and never
        /// reuse the source id.
        #[test]
        fn prop_derive_compressed_links_and_renames(
            content in ".{1,100}",
            derived_content in ".{1,100}",
        ) {
            let source = Segment::new(SegmentType::Rag, content);
            let derived =
                source.derive_compressed(derived_content, vec![source.id], "truncation_tail");

            prop_assert_ne!(derived.id, source.id);
            prop_assert_eq!(derived.provenance.source_type, SourceType::Compression);
            prop_assert_eq!(&derived.provenance.parent_segment_ids, &vec![source.id]);
        }
    }
}
