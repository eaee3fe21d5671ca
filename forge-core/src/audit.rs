//! Append-only audit records for pipeline decisions

use crate::{SegmentId, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Terminal or intermediate decision taken on a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Keep,
    Drop,
    Compress,
    Sanitize,
    Redact,
}

/// Closed vocabulary of decision reasons. New variants are additions, never
/// renames - downstream tooling matches on the serialized names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    BudgetExceeded,
    RigidGuaranteed,
    ElasticAllocated,
    CompressWindowSaturation,
    SanitizeInjectionDetected,
    SanitizeHtmlStripped,
    SanitizeUnicodeNormalized,
    SanitizePiiRedacted,
    SanitizeLengthTruncated,
    SanitizeFailed,
    SelectLowRelevance,
    SelectDeduplicated,
    CacheHit,
    RoutingDecision,
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReasonCode::BudgetExceeded => "budget_exceeded",
            ReasonCode::RigidGuaranteed => "rigid_guaranteed",
            ReasonCode::ElasticAllocated => "elastic_allocated",
            ReasonCode::CompressWindowSaturation => "compress_window_saturation",
            ReasonCode::SanitizeInjectionDetected => "sanitize_injection_detected",
            ReasonCode::SanitizeHtmlStripped => "sanitize_html_stripped",
            ReasonCode::SanitizeUnicodeNormalized => "sanitize_unicode_normalized",
            ReasonCode::SanitizePiiRedacted => "sanitize_pii_redacted",
            ReasonCode::SanitizeLengthTruncated => "sanitize_length_truncated",
            ReasonCode::SanitizeFailed => "sanitize_failed",
            ReasonCode::SelectLowRelevance => "select_low_relevance",
            ReasonCode::SelectDeduplicated => "select_deduplicated",
            ReasonCode::CacheHit => "cache_hit",
            ReasonCode::RoutingDecision => "routing_decision",
        };
        write!(f, "{name}")
    }
}

/// One immutable record of a pipeline decision. Entries are appended in the
/// order decisions were made and never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub segment_id: SegmentId,
    pub decision: Decision,
    pub reason_code: ReasonCode,
    pub reason_detail: String,
    pub pipeline_stage: String,
    /// Signed token delta: positive for kept tokens, negative for removed.
    pub token_impact: i64,
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl AuditEntry {
    pub fn new(
        segment_id: SegmentId,
        decision: Decision,
        reason_code: ReasonCode,
        reason_detail: impl Into<String>,
        pipeline_stage: impl Into<String>,
        token_impact: i64,
    ) -> Self {
        Self {
            segment_id,
            decision,
            reason_code,
            reason_detail: reason_detail.into(),
            pipeline_stage: pipeline_stage.into(),
            token_impact,
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_reason_code_serialized_names_are_stable() {
        let json = serde_json::to_string(&ReasonCode::SanitizeInjectionDetected).unwrap();
        assert_eq!(json, "\"sanitize_injection_detected\"");
        let json = serde_json::to_string(&ReasonCode::SelectDeduplicated).unwrap();
        assert_eq!(json, "\"select_deduplicated\"");
    }

    #[test]
    fn test_entry_round_trip() {
        let entry = AuditEntry::new(
            Uuid::now_v7(),
            Decision::Drop,
            ReasonCode::BudgetExceeded,
            "did not fit",
            "budget_allocate",
            -120,
        )
        .with_metadata("bid", serde_json::json!(1.8));

        let json = serde_json::to_string(&entry).unwrap();
        let back: AuditEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
