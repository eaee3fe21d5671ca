//! The context package - the deterministic output of a build

use crate::{AuditEntry, BudgetAllocation, RequestId, Segment, SegmentType, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Token accounting for a finished package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub total_tokens: u64,
    pub by_role: BTreeMap<String, u64>,
    pub by_type: BTreeMap<SegmentType, u64>,
    pub segment_count: usize,
}

impl TokenUsage {
    /// Tally usage from the final kept set.
    pub fn from_segments(segments: &[Segment]) -> Self {
        let mut usage = TokenUsage {
            segment_count: segments.len(),
            ..Default::default()
        };
        for seg in segments {
            let tokens = u64::from(seg.token_count.unwrap_or(0));
            usage.total_tokens += tokens;
            *usage.by_role.entry(seg.role.clone()).or_insert(0) += tokens;
            *usage.by_type.entry(seg.segment_type).or_insert(0) += tokens;
        }
        usage
    }
}

/// The output of `build`: ordered segments plus everything needed to audit
/// how they got there. Created once per build and never mutated after return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPackage {
    pub request_id: RequestId,
    pub model: String,
    pub policy_version: String,
    /// Final ordered segment sequence.
    pub segments: Vec<Segment>,
    pub token_usage: TokenUsage,
    pub budget_allocation: BudgetAllocation,
    pub audit_log: Vec<AuditEntry>,
    pub warnings: Vec<String>,
    pub assembly_duration_ms: f64,
    pub created_at: Timestamp,
    /// Request-scoped extras: the routing decision, stage timings.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ContextPackage {
    pub fn new(model: impl Into<String>, policy_version: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::now_v7(),
            model: model.into(),
            policy_version: policy_version.into(),
            segments: Vec::new(),
            token_usage: TokenUsage::default(),
            budget_allocation: BudgetAllocation::default(),
            audit_log: Vec::new(),
            warnings: Vec::new(),
            assembly_duration_ms: 0.0,
            created_at: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    /// The assembled context as `(role, content)` messages, in order.
    pub fn as_messages(&self) -> Vec<(String, String)> {
        self.segments
            .iter()
            .map(|s| (s.role.clone(), s.content.to_string()))
            .collect()
    }
}
